//! Coordinator configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How convergence waiters learn about new states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Re-check on every committed transition.
    #[default]
    Broadcast,
    /// Re-check the current state every `poll_interval_ms`.
    Poll,
}

/// What the machine does after rejecting an illegal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IllegalTransitionPolicy {
    /// Leave the state untouched and report the fault to the submitter.
    #[default]
    Report,
    /// Report the fault, then resume both backends and commit `BothRunning`.
    ForceResume,
}

/// Tunables of one coordinator. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a facade operation waits for the backends to converge.
    pub convergence_timeout_ms: u64,
    /// Re-check period of the polling waiter.
    pub poll_interval_ms: u64,
    pub wait_strategy: WaitStrategy,
    pub illegal_transition_policy: IllegalTransitionPolicy,
    /// Capacity of the committed-transition broadcast channel.
    pub transition_log_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            convergence_timeout_ms: 50_000,
            poll_interval_ms: 10,
            wait_strategy: WaitStrategy::Broadcast,
            illegal_transition_policy: IllegalTransitionPolicy::Report,
            transition_log_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid coordinator config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.convergence_timeout_ms > 0, "convergence_timeout_ms must be positive");
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        anyhow::ensure!(
            self.transition_log_capacity > 0,
            "transition_log_capacity must be positive"
        );
        Ok(())
    }

    pub const fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.convergence_timeout_ms)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
