//! `playbook.run` — execute a child playbook as a single step.
//!
//! The child gets its own engine, registry, and cancel token; cancelling
//! the parent step cancels the child and waits for it to wind down, so
//! the child's external resources are released before the parent records
//! the step.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use gatebook_engine::{
    CredentialLookup, ExecutionStatus, HandlerOutcome, HandlerRegistry, Playbook, PlaybookEngine,
    RuntimeConfig, StepContext, StepError, StepHandler,
};

use crate::params::parse_params;

/// Builds the child registry. Each invocation needs a fresh one because
/// registries carry per-execution resources.
pub type ChildRegistryFactory = Arc<dyn Fn() -> HandlerRegistry + Send + Sync>;

pub struct PlaybookRunHandler {
    registry_factory: ChildRegistryFactory,
    credentials: Arc<dyn CredentialLookup>,
    config: RuntimeConfig,
}

#[derive(Debug, Deserialize)]
struct RunParams {
    /// Inline playbook definition.
    #[serde(default)]
    playbook: Option<Playbook>,
    /// Path to a playbook JSON file, used when no inline definition is
    /// given.
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    parameters: HashMap<String, Value>,
}

impl PlaybookRunHandler {
    pub fn new(
        registry_factory: ChildRegistryFactory,
        credentials: Arc<dyn CredentialLookup>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry_factory,
            credentials,
            config,
        }
    }

    async fn load(&self, params: RunParams) -> Result<(Playbook, HashMap<String, Value>), StepError> {
        let playbook = match (params.playbook, params.path) {
            (Some(playbook), _) => playbook,
            (None, Some(path)) => {
                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| StepError::execution(format!("cannot read playbook {path}: {e}")))?;
                serde_json::from_str(&raw)
                    .map_err(|e| StepError::execution(format!("invalid playbook {path}: {e}")))?
            }
            (None, None) => {
                return Err(StepError::execution(
                    "playbook.run needs either 'playbook' or 'path'",
                ))
            }
        };
        playbook
            .validate()
            .map_err(|e| StepError::execution(format!("invalid child playbook: {e}")))?;
        Ok((playbook, params.parameters))
    }
}

#[async_trait]
impl StepHandler for PlaybookRunHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let (playbook, parameters) = self.load(parse_params(params)?).await?;
        let child_id = format!("{}.{}", ctx.execution_id, ctx.step_id);

        tracing::info!(
            execution_id = %ctx.execution_id,
            child_id = %child_id,
            playbook = %playbook.name,
            "Running child playbook"
        );

        let engine = Arc::new(PlaybookEngine::new(
            child_id,
            Arc::new(playbook),
            parameters,
            None,
            (self.registry_factory)(),
            self.credentials.clone(),
            Vec::new(),
            &self.config,
        ));

        // Run in a task of its own so a parent cancel does not drop the
        // child mid-step; cancel() then lets it unwind through teardown.
        let mut run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                engine.cancel().await;
                let _ = run.await;
                return Err(StepError::Cancelled);
            }
            _ = &mut run => {}
        }

        let snapshot = engine.snapshot();
        let results = serde_json::to_value(&snapshot.step_results)
            .unwrap_or(Value::Null);
        let output = HashMap::from([
            ("status".to_string(), serde_json::json!(snapshot.status.to_string())),
            ("steps".to_string(), results),
        ]);

        match snapshot.status {
            ExecutionStatus::Completed => Ok(HandlerOutcome::with_output(output)),
            ExecutionStatus::Cancelled => Err(StepError::Cancelled),
            status => Err(StepError::Execution {
                message: format!(
                    "child playbook ended {status}: {}",
                    snapshot.error.unwrap_or_else(|| "step failed".to_string())
                ),
                partial_output: Some(output),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatebook_engine::InMemoryCredentials;
    use tokio_util::sync::CancellationToken;

    fn factory() -> ChildRegistryFactory {
        Arc::new(|| {
            let mut registry = HandlerRegistry::new();
            crate::utility::register(&mut registry);
            registry
        })
    }

    fn ctx() -> StepContext {
        StepContext {
            execution_id: "parent".to_string(),
            step_id: "child-step".to_string(),
            variables: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_child_playbook_runs_to_completion() {
        let handler = PlaybookRunHandler::new(
            factory(),
            InMemoryCredentials::shared(Vec::new()),
            RuntimeConfig::default(),
        );
        let mut params = HashMap::new();
        params.insert(
            "playbook".to_string(),
            serde_json::json!({
                "name": "child",
                "steps": [
                    {"id": "set", "type": "utility.set_variable",
                     "params": {"name": "x", "value": 1}}
                ]
            }),
        );

        let outcome = handler.execute(&params, &ctx()).await.unwrap();
        assert_eq!(
            outcome.output.get("status"),
            Some(&serde_json::json!("completed"))
        );
    }

    #[tokio::test]
    async fn test_child_failure_surfaces_as_step_error() {
        let handler = PlaybookRunHandler::new(
            factory(),
            InMemoryCredentials::shared(Vec::new()),
            RuntimeConfig::default(),
        );
        let mut params = HashMap::new();
        params.insert(
            "playbook".to_string(),
            serde_json::json!({
                "name": "child",
                "steps": [
                    {"id": "boom", "type": "utility.assert",
                     "params": {"condition": {"left": "1", "op": "eq", "right": 2},
                                "message": "mismatch"}}
                ]
            }),
        );

        let err = handler.execute(&params, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
    }

    #[tokio::test]
    async fn test_missing_definition_rejected() {
        let handler = PlaybookRunHandler::new(
            factory(),
            InMemoryCredentials::shared(Vec::new()),
            RuntimeConfig::default(),
        );
        let err = handler.execute(&HashMap::new(), &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("'playbook' or 'path'"));
    }

    #[tokio::test]
    async fn test_parent_cancel_cancels_child() {
        let handler = Arc::new(PlaybookRunHandler::new(
            factory(),
            InMemoryCredentials::shared(Vec::new()),
            RuntimeConfig::default(),
        ));
        let mut params = HashMap::new();
        params.insert(
            "playbook".to_string(),
            serde_json::json!({
                "name": "child",
                "steps": [
                    {"id": "nap", "type": "utility.sleep", "params": {"seconds": 30}}
                ]
            }),
        );

        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            handler.execute(&params, &ctx),
        )
        .await
        .expect("child must wind down promptly")
        .unwrap_err();
        assert!(err.is_cancellation());
    }
}
