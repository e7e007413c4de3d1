//! Engine and step error types.

use std::collections::HashMap;

use thiserror::Error;

/// Errors raised while resolving step parameters.
///
/// Every variant is attributable to a specific step and is recorded as
/// that step's failure; resolution errors never abort the process.
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    /// A declared required parameter was never supplied.
    #[error("missing required parameter: {0}")]
    MissingRequired(String),

    /// A template marker referenced something that does not exist.
    #[error("unresolved template: {0}")]
    UnresolvedTemplate(String),

    /// A credential template named a credential the lookup does not know.
    #[error("unknown credential: {0}")]
    UnknownCredential(String),

    /// A file parameter pointed outside the playbook base directory.
    #[error("unsafe file path: {0}")]
    UnsafePath(String),
}

/// Errors produced while executing a single step.
#[derive(Debug, Error)]
pub enum StepError {
    /// Parameter resolution failed before the handler ran.
    #[error("parameter resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    /// Handler-reported domain failure.
    #[error("{message}")]
    Execution {
        message: String,
        /// Output produced before the failure, if any.
        partial_output: Option<HashMap<String, serde_json::Value>>,
    },

    /// No handler is registered for the step type.
    #[error("unsupported step type: {0}")]
    UnsupportedStepType(String),

    /// The execution's cancellation token fired while the step was running.
    ///
    /// Not a user-facing failure: the engine records the step as
    /// `cancelled` rather than `failed` when it sees this variant.
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Create an execution failure with no partial output.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            partial_output: None,
        }
    }

    /// Returns true if this error is the cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

/// Errors surfaced by the execution manager and engine lifecycle.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// No active execution with the given id.
    #[error("execution not found: {0}")]
    NotFound(String),

    /// An execution with the given id is already registered.
    #[error("duplicate execution id: {0}")]
    DuplicateExecution(String),

    /// The playbook failed structural validation.
    #[error("invalid playbook: {0}")]
    InvalidPlaybook(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ResolutionError::MissingRequired("gateway_url".to_string());
        assert_eq!(err.to_string(), "missing required parameter: gateway_url");

        let err = StepError::UnsupportedStepType("gateway.reboot".to_string());
        assert_eq!(err.to_string(), "unsupported step type: gateway.reboot");
    }

    #[test]
    fn test_resolution_error_wraps_into_step_error() {
        let err: StepError = ResolutionError::UnknownCredential("prod".to_string()).into();
        assert!(matches!(err, StepError::Resolution(_)));
        assert!(!err.is_cancellation());
        assert!(StepError::Cancelled.is_cancellation());
    }
}
