//! Playbook execution engine.
//!
//! Drives one playbook run to completion: walks steps in order, applies
//! skip conditions, resolves parameters, dispatches handlers, records
//! per-step results and exposes pause/resume/cancel controls.
//!
//! The run's variable store and result list are owned exclusively by the
//! engine; external callers only ever read a snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::condition::ConditionEvaluator;
use crate::config::RuntimeConfig;
use crate::credentials::{Credential, CredentialLookup};
use crate::error::StepError;
use crate::execution::{ExecutionSnapshot, ExecutionStatus, StepResult};
use crate::observer::{ExecutionObserver, ObserverSet};
use crate::playbook::{Playbook, Step};
use crate::registry::{HandlerRegistry, StepContext};
use crate::resolver::{ParameterResolver, ResolveContext};

/// Why the run loop stopped processing further steps.
enum Stop {
    Failed(String),
    Cancelled,
}

struct EngineState {
    status: ExecutionStatus,
    variables: HashMap<String, Value>,
    results: Vec<StepResult>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// One playbook run: state machine, step loop and control surface.
pub struct PlaybookEngine {
    execution_id: String,
    playbook: Arc<Playbook>,
    registry: HandlerRegistry,
    resolver: ParameterResolver,
    conditions: ConditionEvaluator,
    credentials: Arc<dyn CredentialLookup>,
    observers: ObserverSet,
    state: Mutex<EngineState>,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    cancel_grace: Duration,
    started_at: DateTime<Utc>,
}

impl PlaybookEngine {
    /// Create an engine for one run.
    ///
    /// Caller-supplied `parameters` are merged with credential autofill
    /// and declared defaults into the initial variable store; missing
    /// required parameters are not an error here — they surface at the
    /// first step that references them.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: impl Into<String>,
        playbook: Arc<Playbook>,
        parameters: HashMap<String, Value>,
        run_credential: Option<Credential>,
        registry: HandlerRegistry,
        credentials: Arc<dyn CredentialLookup>,
        observers: Vec<Arc<dyn ExecutionObserver>>,
        config: &RuntimeConfig,
    ) -> Self {
        let resolver = ParameterResolver::new();
        let variables = resolver.autofill_run_parameters(
            &parameters,
            &playbook.parameters,
            run_credential.as_ref(),
        );

        let (pause_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Self {
            execution_id: execution_id.into(),
            playbook,
            registry,
            resolver,
            conditions: ConditionEvaluator::new(),
            credentials,
            observers: ObserverSet::new(observers, config.observer_timeout),
            state: Mutex::new(EngineState {
                status: ExecutionStatus::Pending,
                variables,
                results: Vec::new(),
                completed_at: None,
                error: None,
            }),
            cancel: CancellationToken::new(),
            pause_tx,
            done_tx,
            cancel_grace: config.cancel_grace,
            started_at: Utc::now(),
        }
    }

    /// Execution identifier.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Cancellation token for this run; child tokens let nested work
    /// share the run's cancellation scope.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current status.
    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().expect("engine state lock").status
    }

    /// Point-in-time snapshot for external readers.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let state = self.state.lock().expect("engine state lock");
        ExecutionSnapshot {
            execution_id: self.execution_id.clone(),
            playbook: self.playbook.name.clone(),
            status: state.status,
            step_results: state.results.clone(),
            variables: state.variables.clone(),
            started_at: self.started_at,
            completed_at: state.completed_at,
            error: state.error.clone(),
        }
    }

    /// Run the playbook to a terminal state. Called once, as a background
    /// task under the execution manager's supervision.
    pub async fn run(&self) {
        {
            let mut state = self.state.lock().expect("engine state lock");
            if state.status != ExecutionStatus::Pending {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    status = %state.status,
                    "Refusing to run an execution twice"
                );
                return;
            }
            state.status = ExecutionStatus::Running;
        }
        tracing::info!(
            execution_id = %self.execution_id,
            playbook = %self.playbook.name,
            steps = self.playbook.steps.len(),
            "Playbook execution started"
        );
        self.observers
            .notify_state_change(&self.execution_id, ExecutionStatus::Running)
            .await;

        let mut pause_rx = self.pause_tx.subscribe();
        let mut stop: Option<Stop> = None;

        for step in &self.playbook.steps {
            // A stopping failure or cancellation still records a result
            // for every remaining step, never omits one.
            match &stop {
                Some(Stop::Failed(_)) => {
                    self.record_result(StepResult::skipped(&step.id)).await;
                    continue;
                }
                Some(Stop::Cancelled) => {
                    self.record_result(StepResult::cancelled(&step.id, Utc::now()))
                        .await;
                    continue;
                }
                None => {}
            }

            // Step boundary: cancellation first, then the pause gate.
            if self.cancel.is_cancelled() {
                stop = Some(Stop::Cancelled);
                self.record_result(StepResult::cancelled(&step.id, Utc::now()))
                    .await;
                continue;
            }
            if !self.wait_while_paused(&mut pause_rx).await {
                stop = Some(Stop::Cancelled);
                self.record_result(StepResult::cancelled(&step.id, Utc::now()))
                    .await;
                continue;
            }

            if let Some(condition) = &step.condition {
                let variables = self.variables();
                match self.conditions.evaluate(condition, &variables) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            execution_id = %self.execution_id,
                            step_id = %step.id,
                            "Skip condition not met"
                        );
                        self.record_result(StepResult::skipped(&step.id)).await;
                        continue;
                    }
                    Err(e) => {
                        self.record_result(StepResult::failed(&step.id, e.to_string(), Utc::now()))
                            .await;
                        if !step.continue_on_error {
                            stop = Some(Stop::Failed(e.to_string()));
                        }
                        continue;
                    }
                }
            }

            let started_at = Utc::now();
            match self.execute_step(step).await {
                Ok(outcome) => {
                    self.merge_variables(outcome.variables);
                    if let Some(bytes) = &outcome.screenshot {
                        self.observers
                            .notify_screenshot(&self.execution_id, bytes)
                            .await;
                    }
                    self.record_result(StepResult::success(&step.id, outcome.output, started_at))
                        .await;
                }
                Err(e) if e.is_cancellation() => {
                    tracing::info!(
                        execution_id = %self.execution_id,
                        step_id = %step.id,
                        "Step unwound on cancellation"
                    );
                    self.record_result(StepResult::cancelled(&step.id, started_at))
                        .await;
                    stop = Some(Stop::Cancelled);
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        step_id = %step.id,
                        step_type = %step.step_type,
                        error = %e,
                        "Step failed"
                    );
                    let mut result = StepResult::failed(&step.id, e.to_string(), started_at);
                    if let StepError::Execution {
                        partial_output: Some(partial),
                        ..
                    } = &e
                    {
                        result.output = partial.clone();
                    }
                    self.record_result(result).await;
                    if !step.continue_on_error {
                        stop = Some(Stop::Failed(e.to_string()));
                    }
                }
            }
        }

        let (status, error) = match stop {
            None => (ExecutionStatus::Completed, None),
            Some(Stop::Failed(message)) => (ExecutionStatus::Failed, Some(message)),
            Some(Stop::Cancelled) => (ExecutionStatus::Cancelled, None),
        };
        self.finish(status, error).await;
    }

    /// Request a pause. The in-flight step finishes; the run blocks at
    /// the next step boundary until `resume` is called.
    pub async fn pause(&self) {
        let paused = {
            let mut state = self.state.lock().expect("engine state lock");
            if state.status == ExecutionStatus::Running {
                state.status = ExecutionStatus::Paused;
                true
            } else {
                false
            }
        };
        if paused {
            let _ = self.pause_tx.send(true);
            tracing::info!(execution_id = %self.execution_id, "Execution paused");
            self.observers
                .notify_state_change(&self.execution_id, ExecutionStatus::Paused)
                .await;
        }
    }

    /// Release a pause.
    pub async fn resume(&self) {
        let resumed = {
            let mut state = self.state.lock().expect("engine state lock");
            if state.status == ExecutionStatus::Paused {
                state.status = ExecutionStatus::Running;
                true
            } else {
                false
            }
        };
        if resumed {
            let _ = self.pause_tx.send(false);
            tracing::info!(execution_id = %self.execution_id, "Execution resumed");
            self.observers
                .notify_state_change(&self.execution_id, ExecutionStatus::Running)
                .await;
        }
    }

    /// Cancel the run: signal the in-flight handler, then wait (bounded
    /// by the cancel grace) for the run loop to reach a terminal state
    /// and release its external resources. Idempotent.
    pub async fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }

        tracing::info!(execution_id = %self.execution_id, "Cancellation requested");
        self.cancel.cancel();

        let mut done_rx = self.done_tx.subscribe();
        let unwound = async {
            loop {
                if *done_rx.borrow_and_update() {
                    break;
                }
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.cancel_grace, unwound).await.is_err() {
            tracing::warn!(
                execution_id = %self.execution_id,
                grace = ?self.cancel_grace,
                "Run loop did not unwind within the cancel grace"
            );
        }
    }

    /// Last-resort finalization after the manager interrupts a run task
    /// whose handler ignored the cancellation signal.
    pub(crate) async fn finalize_interrupted(&self) {
        if self.status().is_terminal() {
            return;
        }

        // Keep the per-step result invariant: every step not yet recorded
        // gets a cancelled result.
        let missing: Vec<String> = {
            let state = self.state.lock().expect("engine state lock");
            self.playbook
                .steps
                .iter()
                .filter(|s| !state.results.iter().any(|r| r.step_id == s.id))
                .map(|s| s.id.clone())
                .collect()
        };
        for step_id in missing {
            self.record_result(StepResult::cancelled(&step_id, Utc::now()))
                .await;
        }
        self.finish(ExecutionStatus::Cancelled, None).await;
    }

    async fn execute_step(&self, step: &Step) -> Result<crate::registry::HandlerOutcome, StepError> {
        let variables = self.variables();
        let resolve_ctx = ResolveContext {
            variables: &variables,
            specs: &self.playbook.parameters,
            credentials: self.credentials.as_ref(),
            base_dir: self.playbook.base_dir.as_deref(),
        };
        let params = self.resolver.resolve(&step.params, &resolve_ctx).await?;

        tracing::debug!(
            execution_id = %self.execution_id,
            step_id = %step.id,
            step_type = %step.step_type,
            "Dispatching step"
        );

        let ctx = StepContext {
            execution_id: self.execution_id.clone(),
            step_id: step.id.clone(),
            variables,
            cancel: self.cancel.clone(),
        };

        // A panicking handler must never escape the background task; it
        // becomes a generic step failure.
        let dispatch = self.registry.dispatch(&step.step_type, &params, &ctx);
        match std::panic::AssertUnwindSafe(dispatch).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(
                    execution_id = %self.execution_id,
                    step_id = %step.id,
                    step_type = %step.step_type,
                    panic = %message,
                    "Handler panicked"
                );
                Err(StepError::execution(format!("handler panicked: {message}")))
            }
        }
    }

    /// Wait out a pause; returns false if cancellation fired first.
    async fn wait_while_paused(&self, pause_rx: &mut watch::Receiver<bool>) -> bool {
        while *pause_rx.borrow_and_update() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
        true
    }

    fn variables(&self) -> HashMap<String, Value> {
        self.state.lock().expect("engine state lock").variables.clone()
    }

    fn merge_variables(&self, writes: HashMap<String, Value>) {
        if writes.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("engine state lock");
        // Writes after a terminal transition are discarded.
        if state.status.is_terminal() {
            return;
        }
        for (name, value) in writes {
            state.variables.insert(name, value);
        }
    }

    async fn record_result(&self, result: StepResult) {
        let discarded = {
            let mut state = self.state.lock().expect("engine state lock");
            if state.status.is_terminal() {
                true
            } else {
                state.results.push(result.clone());
                false
            }
        };
        if discarded {
            tracing::debug!(
                execution_id = %self.execution_id,
                step_id = %result.step_id,
                "Discarding step result after terminal state"
            );
            return;
        }

        tracing::info!(
            execution_id = %self.execution_id,
            step_id = %result.step_id,
            outcome = %result.outcome,
            duration_ms = result.duration_ms,
            "Step finished"
        );
        self.observers
            .notify_step_result(&self.execution_id, &result)
            .await;
    }

    async fn finish(&self, status: ExecutionStatus, error: Option<String>) {
        {
            let mut state = self.state.lock().expect("engine state lock");
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.completed_at = Some(Utc::now());
            state.error = error;
        }

        // Release external resources before anyone observes the terminal
        // state, so a cancelled browser session is gone by the time
        // cancel() returns.
        self.registry.teardown().await;

        tracing::info!(
            execution_id = %self.execution_id,
            status = %status,
            "Playbook execution finished"
        );
        self.observers
            .notify_state_change(&self.execution_id, status)
            .await;
        let _ = self.done_tx.send(true);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
