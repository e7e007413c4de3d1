//! Typed parameter extraction for handlers.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use gatebook_engine::StepError;

/// Deserialize a resolved parameter map into a handler's config struct.
///
/// Missing or ill-typed fields become a step execution failure with the
/// serde message, never a crash.
pub fn parse_params<T: DeserializeOwned>(params: &HashMap<String, Value>) -> Result<T, StepError> {
    let object = Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    serde_json::from_value(object)
        .map_err(|e| StepError::execution(format!("invalid step parameters: {e}")))
}
