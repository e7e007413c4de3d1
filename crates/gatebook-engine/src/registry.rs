//! Step handler contract, registry and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;

/// Per-invocation context handed to a step handler.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Execution identifier.
    pub execution_id: String,

    /// Identifier of the step being executed.
    pub step_id: String,

    /// Snapshot of the run's variable store at dispatch time.
    pub variables: HashMap<String, Value>,

    /// The execution's cancellation token. Handlers must observe it at
    /// every suspension point and unwind with [`StepError::Cancelled`].
    pub cancel: CancellationToken,
}

/// What a handler produced.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    /// Handler-defined output map, recorded on the step result.
    pub output: HashMap<String, Value>,

    /// Variable writes, merged into the run's variable store by the
    /// engine. Handlers never mutate the store directly.
    pub variables: HashMap<String, Value>,

    /// Captured screenshot, forwarded to observers.
    pub screenshot: Option<Vec<u8>>,
}

impl HandlerOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Outcome carrying only an output map.
    pub fn with_output(output: HashMap<String, Value>) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    /// Add a single output entry.
    pub fn output_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.output.insert(key.into(), value);
        self
    }

    /// Add a variable write.
    pub fn set_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// Polymorphic executor for one step type.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step with fully resolved parameters.
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError>;
}

/// External resource owned by a handler family, released on teardown.
#[async_trait]
pub trait ExternalResource: Send + Sync {
    /// Resource name, for logging.
    fn name(&self) -> &str;

    /// Release the resource. Must be idempotent.
    async fn release(&self);
}

/// Registry of step handlers, built once per engine instance.
///
/// External-system clients registered here are per-execution; nothing in
/// a registry is shared across executions.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    resources: Vec<Arc<dyn ExternalResource>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            resources: Vec::new(),
        }
    }

    /// Register a handler for a step type.
    pub fn register(&mut self, step_type: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_type.into(), handler);
    }

    /// Track an external resource for teardown.
    pub fn add_resource(&mut self, resource: Arc<dyn ExternalResource>) {
        self.resources.push(resource);
    }

    /// Check whether a step type has a handler.
    pub fn has(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// List registered step types.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Dispatch a step to its handler. Unknown step types fail fast.
    pub async fn dispatch(
        &self,
        step_type: &str,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let handler = self
            .handlers
            .get(step_type)
            .ok_or_else(|| StepError::UnsupportedStepType(step_type.to_string()))?;
        handler.execute(params, ctx).await
    }

    /// Release every tracked external resource.
    pub async fn teardown(&self) {
        for resource in &self.resources {
            tracing::debug!(resource = resource.name(), "Releasing external resource");
            resource.release().await;
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("resources", &self.resources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl StepHandler for EchoHandler {
        async fn execute(
            &self,
            params: &HashMap<String, Value>,
            _ctx: &StepContext,
        ) -> Result<HandlerOutcome, StepError> {
            Ok(HandlerOutcome::with_output(params.clone()))
        }
    }

    struct CountingResource {
        releases: AtomicUsize,
    }

    #[async_trait]
    impl ExternalResource for CountingResource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            execution_id: "exec-1".to_string(),
            step_id: "step-1".to_string(),
            variables: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_known_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("utility.echo", Arc::new(EchoHandler));
        assert!(registry.has("utility.echo"));

        let mut params = HashMap::new();
        params.insert("message".to_string(), serde_json::json!("hi"));

        let outcome = registry
            .dispatch("utility.echo", &params, &ctx())
            .await
            .unwrap();
        assert_eq!(outcome.output["message"], serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_step_type_fails_fast() {
        let registry = HandlerRegistry::new();
        let err = registry
            .dispatch("gateway.reboot", &HashMap::new(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnsupportedStepType(t) if t == "gateway.reboot"));
    }

    #[tokio::test]
    async fn test_teardown_releases_resources() {
        let resource = Arc::new(CountingResource {
            releases: AtomicUsize::new(0),
        });
        let mut registry = HandlerRegistry::new();
        registry.add_resource(resource.clone());

        registry.teardown().await;
        assert_eq!(resource.releases.load(Ordering::SeqCst), 1);
    }
}
