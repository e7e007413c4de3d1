//! Playbook data model.
//!
//! A playbook arrives already parsed and validated by the loader; the
//! engine only consumes these types. Step order is execution order and
//! step identifiers are unique within a playbook.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Declarative ordered list of steps plus a parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// Playbook name.
    pub name: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared run parameters (validated/resolved against caller input).
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,

    /// Ordered steps; execution order is list order.
    pub steps: Vec<Step>,

    /// Base directory for `file`-typed parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
}

impl Playbook {
    /// Look up a step by id.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Look up a declared parameter by name.
    pub fn get_parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check structural invariants: at least one step, unique step ids.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::InvalidPlaybook(format!(
                "playbook '{}' has no steps",
                self.name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::InvalidPlaybook(format!(
                    "duplicate step id '{}' in playbook '{}'",
                    step.id, self.name
                )));
            }
        }

        Ok(())
    }
}

/// One unit of work within a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier, unique within the playbook.
    pub id: String,

    /// Step type tag, e.g. `gateway.login` or `utility.sleep`.
    #[serde(rename = "type")]
    pub step_type: String,

    /// Raw parameter map; values may contain template markers.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,

    /// Run-if condition; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Whether a failure of this step lets the run proceed.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Declared run parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,

    /// Value type tag.
    #[serde(rename = "type", default)]
    pub param_type: ParamType,

    /// Default applied when the caller omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    /// Whether the parameter must be present by the time a step uses it.
    #[serde(default)]
    pub required: bool,
}

/// Parameter value type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Boolean,
    /// Value is the name of a stored credential.
    Credential,
    /// Value is a path relative to the playbook base directory.
    File,
}

/// Condition attached to a step.
///
/// `left` may contain template markers and is resolved against the run's
/// variable store before comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Left-hand side value or template expression.
    pub left: String,

    /// Comparison operator.
    #[serde(default)]
    pub op: Operator,

    /// Right-hand side value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<serde_json::Value>,
}

/// Condition operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equality check.
    #[default]
    Eq,
    /// Inequality check.
    Ne,
    /// Greater than.
    Gt,
    /// Less than.
    Lt,
    /// Greater than or equal.
    Gte,
    /// Less than or equal.
    Lte,
    /// String contains.
    Contains,
    /// Value is truthy.
    Truthy,
    /// Value is falsy.
    Falsy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            step_type: "utility.log".to_string(),
            params: HashMap::new(),
            condition: None,
            continue_on_error: false,
        }
    }

    #[test]
    fn test_validate_rejects_duplicate_step_ids() {
        let playbook = Playbook {
            name: "dup".to_string(),
            description: None,
            parameters: vec![],
            steps: vec![step("a"), step("b"), step("a")],
            base_dir: None,
        };

        let err = playbook.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'a'"));
    }

    #[test]
    fn test_validate_rejects_empty_playbook() {
        let playbook = Playbook {
            name: "empty".to_string(),
            description: None,
            parameters: vec![],
            steps: vec![],
            base_dir: None,
        };

        assert!(playbook.validate().is_err());
    }

    #[test]
    fn test_step_deserialization_defaults() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "wait",
            "type": "utility.sleep",
            "params": {"seconds": 0.1}
        }))
        .unwrap();

        assert_eq!(step.step_type, "utility.sleep");
        assert!(step.condition.is_none());
        assert!(!step.continue_on_error);
    }

    #[test]
    fn test_parameter_spec_type_tags() {
        let spec: ParameterSpec = serde_json::from_value(serde_json::json!({
            "name": "gateway_url",
            "type": "string",
            "required": true
        }))
        .unwrap();
        assert_eq!(spec.param_type, ParamType::String);
        assert!(spec.required);

        let spec: ParameterSpec = serde_json::from_value(serde_json::json!({
            "name": "login",
            "type": "credential"
        }))
        .unwrap();
        assert_eq!(spec.param_type, ParamType::Credential);
        assert!(!spec.required);
    }
}
