use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens when a handoff payload fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPolicy {
    /// Drop the payload for that pair and keep going
    #[default]
    FailOpen,
    /// Count the producer's attempt as failed (subject to retry)
    FailFast,
}

/// Engine-wide execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub handoff_policy: HandoffPolicy,

    /// Cancel executor calls that overrun their step timeout
    #[serde(default = "default_enforce_timeouts")]
    pub enforce_timeouts: bool,

    /// Timeout for steps that do not declare one
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Maximum steps dispatched per round (0 = unlimited)
    #[serde(default)]
    pub max_concurrency: usize,

    /// Terminal workflows kept for status queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_enforce_timeouts() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_history_limit() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handoff_policy: HandoffPolicy::default(),
            enforce_timeouts: default_enforce_timeouts(),
            default_timeout_secs: default_timeout_secs(),
            max_concurrency: 0,
            history_limit: default_history_limit(),
        }
    }
}

impl EngineConfig {
    pub fn with_handoff_policy(mut self, policy: HandoffPolicy) -> Self {
        self.handoff_policy = policy;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_enforce_timeouts(mut self, enforce: bool) -> Self {
        self.enforce_timeouts = enforce;
        self
    }

    /// Timeout applied to a step, falling back to the engine default
    pub fn step_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.default_timeout_secs))
    }
}
