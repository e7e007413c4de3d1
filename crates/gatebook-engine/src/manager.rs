//! Execution manager.
//!
//! Owns the set of concurrently active engines, supervises each run as a
//! background task with a wall-clock budget, and reclaims terminal
//! executions after a TTL window. The registry map is only ever locked
//! for insert/lookup/remove; step execution runs entirely outside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::RuntimeConfig;
use crate::credentials::{Credential, CredentialLookup};
use crate::engine::PlaybookEngine;
use crate::error::EngineError;
use crate::execution::ExecutionSnapshot;
use crate::observer::ExecutionObserver;
use crate::playbook::Playbook;
use crate::registry::HandlerRegistry;

/// Builds a fresh handler registry for each execution, so external
/// clients (gateway sessions, browser drivers) are never shared across
/// runs.
pub type RegistryFactory = Box<dyn Fn() -> HandlerRegistry + Send + Sync>;

struct ActiveExecution {
    engine: Arc<PlaybookEngine>,
    run_abort: AbortHandle,
    supervisor: JoinHandle<()>,
    completed_at: Option<Instant>,
}

/// Process-wide owner of active playbook executions.
pub struct ExecutionManager {
    active: Mutex<HashMap<String, ActiveExecution>>,
    config: RuntimeConfig,
    credentials: Arc<dyn CredentialLookup>,
    registry_factory: RegistryFactory,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl ExecutionManager {
    pub fn new(
        config: RuntimeConfig,
        credentials: Arc<dyn CredentialLookup>,
        registry_factory: RegistryFactory,
        observers: Vec<Arc<dyn ExecutionObserver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(HashMap::new()),
            config,
            credentials,
            registry_factory,
            observers,
        })
    }

    /// Submit a playbook run. Returns immediately with the execution id;
    /// the run proceeds as a supervised background task.
    pub fn execute(
        self: &Arc<Self>,
        playbook: Arc<Playbook>,
        parameters: HashMap<String, Value>,
        credential: Option<Credential>,
        execution_id: Option<String>,
    ) -> Result<String, EngineError> {
        playbook.validate()?;
        let execution_id =
            execution_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let engine = Arc::new(PlaybookEngine::new(
            execution_id.clone(),
            playbook,
            parameters,
            credential,
            (self.registry_factory)(),
            self.credentials.clone(),
            self.observers.clone(),
            &self.config,
        ));

        let mut active = self.active.lock().expect("manager registry lock");
        if active.contains_key(&execution_id) {
            return Err(EngineError::DuplicateExecution(execution_id));
        }

        let run_task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });
        let run_abort = run_task.abort_handle();
        let supervisor = self.spawn_supervisor(execution_id.clone(), engine.clone(), run_task);

        active.insert(
            execution_id.clone(),
            ActiveExecution {
                engine,
                run_abort,
                supervisor,
                completed_at: None,
            },
        );
        drop(active);

        tracing::info!(execution_id = %execution_id, "Execution registered");
        Ok(execution_id)
    }

    /// Look up an active execution's engine.
    pub fn get(&self, execution_id: &str) -> Option<Arc<PlaybookEngine>> {
        self.active
            .lock()
            .expect("manager registry lock")
            .get(execution_id)
            .map(|active| active.engine.clone())
    }

    /// Pause an active execution at its next step boundary.
    pub async fn pause(&self, execution_id: &str) -> Result<(), EngineError> {
        let engine = self
            .get(execution_id)
            .ok_or_else(|| EngineError::NotFound(execution_id.to_string()))?;
        engine.pause().await;
        Ok(())
    }

    /// Resume a paused execution.
    pub async fn resume(&self, execution_id: &str) -> Result<(), EngineError> {
        let engine = self
            .get(execution_id)
            .ok_or_else(|| EngineError::NotFound(execution_id.to_string()))?;
        engine.resume().await;
        Ok(())
    }

    /// Point-in-time snapshot of an execution.
    pub fn status(&self, execution_id: &str) -> Result<ExecutionSnapshot, EngineError> {
        let engine = self
            .get(execution_id)
            .ok_or_else(|| EngineError::NotFound(execution_id.to_string()))?;
        Ok(engine.snapshot())
    }

    /// Cancel an execution. Returns false when the id is unknown, which
    /// is a no-op signal rather than an error.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let entry = {
            let active = self.active.lock().expect("manager registry lock");
            active
                .get(execution_id)
                .map(|a| (a.engine.clone(), a.run_abort.clone()))
        };
        let Some((engine, run_abort)) = entry else {
            return false;
        };

        engine.cancel().await;
        if !engine.status().is_terminal() {
            // The handler ignored the signal past the grace window.
            tracing::warn!(execution_id = %execution_id, "Interrupting stuck run task");
            run_abort.abort();
            engine.finalize_interrupted().await;
        }
        self.mark_completed(execution_id);
        true
    }

    /// Remove terminal executions whose completion is older than the TTL.
    /// Never touches a non-terminal execution. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.config.execution_ttl;
        let mut active = self.active.lock().expect("manager registry lock");
        let before = active.len();
        active.retain(|execution_id, entry| {
            let expired = entry.engine.status().is_terminal()
                && entry
                    .completed_at
                    .map(|at| at.elapsed() >= ttl)
                    .unwrap_or(false);
            if expired {
                tracing::info!(execution_id = %execution_id, "Reclaiming expired execution");
            }
            !expired
        });
        before - active.len()
    }

    /// Periodic TTL sweep as a background task.
    pub fn spawn_ttl_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, "TTL sweep reclaimed executions");
                }
            }
        })
    }

    /// Cancel every active execution and await their unwinding, bounded
    /// by the shutdown grace, so no external resources survive exit.
    pub async fn shutdown(&self) {
        // Entries stay registered through the cancel pass so status()
        // keeps answering for runs that are still winding down.
        let engines: Vec<Arc<PlaybookEngine>> = {
            let active = self.active.lock().expect("manager registry lock");
            active.values().map(|entry| entry.engine.clone()).collect()
        };
        if engines.is_empty() {
            return;
        }
        tracing::info!(count = engines.len(), "Shutting down active executions");

        futures::future::join_all(engines.iter().map(|engine| engine.cancel())).await;

        let drained: Vec<(String, ActiveExecution)> = {
            let mut active = self.active.lock().expect("manager registry lock");
            active.drain().collect()
        };
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        for (execution_id, entry) in drained {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, entry.supervisor).await.is_err() {
                tracing::warn!(execution_id = %execution_id, "Forcing run task shutdown");
                entry.run_abort.abort();
                entry.engine.finalize_interrupted().await;
            }
        }
    }

    fn spawn_supervisor(
        self: &Arc<Self>,
        execution_id: String,
        engine: Arc<PlaybookEngine>,
        run_task: JoinHandle<()>,
    ) -> JoinHandle<()> {
        let manager: Weak<ExecutionManager> = Arc::downgrade(self);
        let run_timeout = self.config.run_timeout;
        let run_abort = run_task.abort_handle();

        tokio::spawn(async move {
            match tokio::time::timeout(run_timeout, run_task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // The run task was aborted or panicked outside a step.
                    tracing::error!(
                        execution_id = %execution_id,
                        error = %e,
                        "Run task ended abnormally"
                    );
                    engine.finalize_interrupted().await;
                }
                Err(_) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        timeout = ?run_timeout,
                        "Run exceeded its wall-clock budget, cancelling"
                    );
                    engine.cancel().await;
                    if !engine.status().is_terminal() {
                        run_abort.abort();
                        engine.finalize_interrupted().await;
                    }
                }
            }

            if let Some(manager) = manager.upgrade() {
                manager.mark_completed(&execution_id);
            }
        })
    }

    fn mark_completed(&self, execution_id: &str) {
        let mut active = self.active.lock().expect("manager registry lock");
        if let Some(entry) = active.get_mut(execution_id) {
            if entry.completed_at.is_none() {
                entry.completed_at = Some(Instant::now());
            }
        }
    }
}
