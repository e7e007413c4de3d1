//! Runtime configuration.

use std::time::Duration;

/// Timing knobs for the engine and execution manager.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long a terminal execution stays in the active registry before
    /// the TTL sweep reclaims it.
    pub execution_ttl: Duration,

    /// Wall-clock budget for one playbook run; expiry behaves like an
    /// explicit cancel.
    pub run_timeout: Duration,

    /// How long `shutdown` waits for active runs to unwind.
    pub shutdown_grace: Duration,

    /// How long `cancel` waits for the run loop to reach a terminal state
    /// before the manager interrupts the task.
    pub cancel_grace: Duration,

    /// Per-call budget for observer notifications.
    pub observer_timeout: Duration,
}

impl RuntimeConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            execution_ttl: env_secs("GATEBOOK_EXECUTION_TTL_SECS", defaults.execution_ttl),
            run_timeout: env_secs("GATEBOOK_RUN_TIMEOUT_SECS", defaults.run_timeout),
            shutdown_grace: env_secs("GATEBOOK_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
            cancel_grace: env_secs("GATEBOOK_CANCEL_GRACE_SECS", defaults.cancel_grace),
            observer_timeout: env_millis(
                "GATEBOOK_OBSERVER_TIMEOUT_MS",
                defaults.observer_timeout,
            ),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_ttl: Duration::from_secs(30 * 60),
            run_timeout: Duration::from_secs(60 * 60),
            shutdown_grace: Duration::from_secs(15),
            cancel_grace: Duration::from_secs(10),
            observer_timeout: Duration::from_millis(1000),
        }
    }
}

fn env_secs(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn env_millis(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}
