//! Progress observer interface.
//!
//! Observers receive per-step and per-transition notifications so a live
//! UI layer (WebSocket, SSE) can follow a run. Delivery is at-least-once
//! per transition and never applies back-pressure to the engine: slow or
//! failing observers are logged and dropped for that notification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::execution::{ExecutionStatus, StepResult};

/// Callbacks invoked by the engine as a run progresses.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// A step finished and its result was recorded.
    async fn on_step_result(&self, execution_id: &str, result: &StepResult) -> anyhow::Result<()> {
        let _ = (execution_id, result);
        Ok(())
    }

    /// The execution transitioned to a new status.
    async fn on_state_change(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> anyhow::Result<()> {
        let _ = (execution_id, status);
        Ok(())
    }

    /// A handler captured a screenshot.
    async fn on_screenshot(&self, execution_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let _ = (execution_id, bytes);
        Ok(())
    }
}

/// Fans notifications out to observers with a bounded per-call budget.
pub(crate) struct ObserverSet {
    observers: Vec<Arc<dyn ExecutionObserver>>,
    budget: Duration,
}

impl ObserverSet {
    pub(crate) fn new(observers: Vec<Arc<dyn ExecutionObserver>>, budget: Duration) -> Self {
        Self { observers, budget }
    }

    pub(crate) async fn notify_step_result(&self, execution_id: &str, result: &StepResult) {
        for observer in &self.observers {
            match tokio::time::timeout(self.budget, observer.on_step_result(execution_id, result))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    execution_id = %execution_id,
                    step_id = %result.step_id,
                    error = %e,
                    "Observer failed on step result"
                ),
                Err(_) => tracing::warn!(
                    execution_id = %execution_id,
                    step_id = %result.step_id,
                    "Observer timed out on step result"
                ),
            }
        }
    }

    pub(crate) async fn notify_state_change(&self, execution_id: &str, status: ExecutionStatus) {
        for observer in &self.observers {
            match tokio::time::timeout(self.budget, observer.on_state_change(execution_id, status))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    execution_id = %execution_id,
                    status = %status,
                    error = %e,
                    "Observer failed on state change"
                ),
                Err(_) => tracing::warn!(
                    execution_id = %execution_id,
                    status = %status,
                    "Observer timed out on state change"
                ),
            }
        }
    }

    pub(crate) async fn notify_screenshot(&self, execution_id: &str, bytes: &[u8]) {
        for observer in &self.observers {
            match tokio::time::timeout(self.budget, observer.on_screenshot(execution_id, bytes))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    execution_id = %execution_id,
                    error = %e,
                    "Observer failed on screenshot"
                ),
                Err(_) => tracing::warn!(
                    execution_id = %execution_id,
                    "Observer timed out on screenshot"
                ),
            }
        }
    }
}
