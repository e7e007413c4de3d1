//! Utility step handlers: sleep, set_variable, log, assert.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use gatebook_engine::condition::ConditionEvaluator;
use gatebook_engine::playbook::Condition;
use gatebook_engine::{HandlerOutcome, HandlerRegistry, StepContext, StepError, StepHandler};

use crate::params::parse_params;

/// `utility.sleep` — wait a number of seconds, observing cancellation.
pub struct SleepHandler;

#[derive(Debug, Deserialize)]
struct SleepParams {
    seconds: f64,
}

#[async_trait]
impl StepHandler for SleepHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let SleepParams { seconds } = parse_params(params)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(StepError::execution(format!(
                "invalid sleep duration: {seconds}"
            )));
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {
                Ok(HandlerOutcome::empty().output_entry("slept_seconds", serde_json::json!(seconds)))
            }
        }
    }
}

/// `utility.set_variable` — write one run-scoped variable.
pub struct SetVariableHandler;

#[derive(Debug, Deserialize)]
struct SetVariableParams {
    name: String,
    value: Value,
}

#[async_trait]
impl StepHandler for SetVariableHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        _ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let SetVariableParams { name, value } = parse_params(params)?;
        Ok(HandlerOutcome::empty()
            .output_entry("name", serde_json::json!(name.clone()))
            .output_entry("value", value.clone())
            .set_variable(name, value))
    }
}

/// `utility.log` — emit an operator-visible log line.
pub struct LogHandler;

#[derive(Debug, Deserialize)]
struct LogParams {
    message: String,
    #[serde(default = "default_level")]
    level: String,
}

fn default_level() -> String {
    "info".to_string()
}

#[async_trait]
impl StepHandler for LogHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let LogParams { message, level } = parse_params(params)?;
        match level.as_str() {
            "debug" => tracing::debug!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                "{message}"
            ),
            "warn" => tracing::warn!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                "{message}"
            ),
            "error" => tracing::error!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                "{message}"
            ),
            _ => tracing::info!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                "{message}"
            ),
        }
        Ok(HandlerOutcome::empty().output_entry("message", serde_json::json!(message)))
    }
}

/// `utility.assert` — fail the step unless a condition holds.
pub struct AssertHandler {
    evaluator: ConditionEvaluator,
}

impl AssertHandler {
    pub fn new() -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
        }
    }
}

impl Default for AssertHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct AssertParams {
    condition: Condition,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl StepHandler for AssertHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let AssertParams { condition, message } = parse_params(params)?;
        if self.evaluator.evaluate(&condition, &ctx.variables)? {
            Ok(HandlerOutcome::empty().output_entry("passed", serde_json::json!(true)))
        } else {
            Err(StepError::execution(message.unwrap_or_else(|| {
                format!("assertion failed: {} {:?}", condition.left, condition.op)
            })))
        }
    }
}

/// Register the utility family. These handlers carry no external state.
pub fn register(registry: &mut HandlerRegistry) {
    registry.register("utility.sleep", Arc::new(SleepHandler));
    registry.register("utility.set_variable", Arc::new(SetVariableHandler));
    registry.register("utility.log", Arc::new(LogHandler));
    registry.register("utility.assert", Arc::new(AssertHandler::new()));
}
