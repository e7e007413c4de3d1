//! Execution status and per-step result types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// High-level status of one playbook execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Submitted but the run loop has not started yet.
    Pending,
    /// Steps are being processed.
    Running,
    /// Blocked at a step boundary until resumed.
    Paused,
    /// All steps processed without a stopping failure.
    Completed,
    /// A step failed and stopped the run.
    Failed,
    /// The run was cancelled or timed out.
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Recorded result of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step identifier.
    pub step_id: String,

    /// Outcome classification.
    pub outcome: StepOutcome,

    /// Handler-defined output map.
    #[serde(default)]
    pub output: HashMap<String, serde_json::Value>,

    /// Error message when the outcome is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the step started.
    pub started_at: DateTime<Utc>,

    /// When the step finished (equal to `started_at` for skipped steps).
    pub finished_at: DateTime<Utc>,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl StepResult {
    fn finished(
        step_id: &str,
        outcome: StepOutcome,
        output: HashMap<String, serde_json::Value>,
        error: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            step_id: step_id.to_string(),
            outcome,
            output,
            error,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    /// Successful step with its output map.
    pub fn success(
        step_id: &str,
        output: HashMap<String, serde_json::Value>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finished(step_id, StepOutcome::Success, output, None, started_at)
    }

    /// Failed step with the handler's error message.
    pub fn failed(step_id: &str, error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self::finished(
            step_id,
            StepOutcome::Failed,
            HashMap::new(),
            Some(error.into()),
            started_at,
        )
    }

    /// Step skipped by its condition or by an earlier stopping failure.
    pub fn skipped(step_id: &str) -> Self {
        let now = Utc::now();
        Self::finished(step_id, StepOutcome::Skipped, HashMap::new(), None, now)
    }

    /// Step cancelled before or during execution.
    pub fn cancelled(step_id: &str, started_at: DateTime<Utc>) -> Self {
        Self::finished(
            step_id,
            StepOutcome::Cancelled,
            HashMap::new(),
            None,
            started_at,
        )
    }
}

/// Point-in-time snapshot of an execution, safe to hand to external readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Execution identifier.
    pub execution_id: String,

    /// Playbook name.
    pub playbook: String,

    /// Current status.
    pub status: ExecutionStatus,

    /// Per-step results recorded so far, in step order.
    pub step_results: Vec<StepResult>,

    /// Current run-scoped variable store.
    pub variables: HashMap<String, serde_json::Value>,

    /// When the run was submitted.
    pub started_at: DateTime<Utc>,

    /// Set once the run reaches a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// First stopping error, when the status is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
