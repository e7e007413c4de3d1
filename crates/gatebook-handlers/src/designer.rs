//! Designer application step handlers.
//!
//! Same shape as the browser family: a host-provided [`DesignerDriver`]
//! does the real work, the handlers adapt steps onto it, and the driver
//! is released with the execution's other external resources.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use gatebook_engine::{
    ExternalResource, HandlerOutcome, HandlerRegistry, StepContext, StepError, StepHandler,
};

use crate::params::parse_params;

/// Backend contract for driving the designer application.
#[async_trait]
pub trait DesignerDriver: Send + Sync {
    /// Open a project by name or path.
    async fn open(&self, project: &str) -> anyhow::Result<()>;
    /// Invoke a named designer command with free-form arguments.
    async fn invoke(&self, command: &str, args: &Value) -> anyhow::Result<Value>;
    /// Close the application. Must be idempotent.
    async fn close(&self);
}

struct DesignerResource {
    driver: Arc<dyn DesignerDriver>,
}

#[async_trait]
impl ExternalResource for DesignerResource {
    fn name(&self) -> &str {
        "designer"
    }

    async fn release(&self) {
        self.driver.close().await;
    }
}

/// `designer.open`
pub struct DesignerOpenHandler {
    driver: Arc<dyn DesignerDriver>,
}

#[derive(Debug, Deserialize)]
struct OpenParams {
    project: String,
}

#[async_trait]
impl StepHandler for DesignerOpenHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let OpenParams { project } = parse_params(params)?;
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
            result = self.driver.open(&project) => {
                result.map_err(|e| StepError::execution(format!("designer open failed: {e}")))?
            }
        }
        tracing::debug!(execution_id = %ctx.execution_id, project = %project, "Designer project opened");
        Ok(HandlerOutcome::empty().output_entry("project", serde_json::json!(project)))
    }
}

/// `designer.invoke`
pub struct DesignerInvokeHandler {
    driver: Arc<dyn DesignerDriver>,
}

#[derive(Debug, Deserialize)]
struct InvokeParams {
    command: String,
    #[serde(default)]
    args: Value,
}

#[async_trait]
impl StepHandler for DesignerInvokeHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let InvokeParams { command, args } = parse_params(params)?;
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
            result = self.driver.invoke(&command, &args) => {
                result.map_err(|e| StepError::execution(format!("designer command {command} failed: {e}")))?
            }
        };
        Ok(HandlerOutcome::empty()
            .output_entry("command", serde_json::json!(command))
            .output_entry("result", result))
    }
}

/// `designer.close` — close the application mid-playbook. End-of-run
/// teardown still runs; the driver's close contract is idempotent.
pub struct DesignerCloseHandler {
    driver: Arc<dyn DesignerDriver>,
}

#[async_trait]
impl StepHandler for DesignerCloseHandler {
    async fn execute(
        &self,
        _params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        self.driver.close().await;
        tracing::debug!(execution_id = %ctx.execution_id, "Designer closed");
        Ok(HandlerOutcome::empty().output_entry("closed", serde_json::json!(true)))
    }
}

/// Register the designer family against one driver instance.
pub fn register(registry: &mut HandlerRegistry, driver: Arc<dyn DesignerDriver>) {
    registry.register(
        "designer.open",
        Arc::new(DesignerOpenHandler {
            driver: driver.clone(),
        }),
    );
    registry.register(
        "designer.invoke",
        Arc::new(DesignerInvokeHandler {
            driver: driver.clone(),
        }),
    );
    registry.register(
        "designer.close",
        Arc::new(DesignerCloseHandler {
            driver: driver.clone(),
        }),
    );
    registry.add_resource(Arc::new(DesignerResource { driver }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct EchoDesigner {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl DesignerDriver for EchoDesigner {
        async fn open(&self, _project: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn invoke(&self, command: &str, args: &Value) -> anyhow::Result<Value> {
            Ok(serde_json::json!({"command": command, "args": args}))
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
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
    async fn test_invoke_returns_driver_result() {
        let handler = DesignerInvokeHandler {
            driver: Arc::new(EchoDesigner::default()),
        };
        let mut params = HashMap::new();
        params.insert("command".to_string(), serde_json::json!("export"));
        params.insert("args".to_string(), serde_json::json!({"format": "pdf"}));

        let outcome = handler.execute(&params, &ctx()).await.unwrap();
        assert_eq!(
            outcome.output.get("result"),
            Some(&serde_json::json!({"command": "export", "args": {"format": "pdf"}}))
        );
    }

    #[tokio::test]
    async fn test_explicit_close_reaches_driver() {
        let driver = Arc::new(EchoDesigner::default());
        let handler = DesignerCloseHandler {
            driver: driver.clone(),
        };

        let outcome = handler.execute(&HashMap::new(), &ctx()).await.unwrap();
        assert_eq!(outcome.output.get("closed"), Some(&serde_json::json!(true)));
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_installs_family() {
        let mut registry = HandlerRegistry::new();
        register(&mut registry, Arc::new(EchoDesigner::default()));
        assert!(registry.has("designer.open"));
        assert!(registry.has("designer.invoke"));
        assert!(registry.has("designer.close"));
    }
}
