use serde::{Deserialize, Serialize};

use crate::shared::{RetryConfig, ValidationError};

/// How runs for the same `(connector, table)` pair may overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Runs for the same pair may execute concurrently.
    #[default]
    AllowConcurrent,
    /// Starting a run is rejected while another run for the same pair is running.
    SkipIfRunning,
}

/// Settings of the sync workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry policy attached to every step invocation.
    pub retry: RetryConfig,
    /// Maximum time, in milliseconds, a single step attempt may take.
    pub step_timeout_ms: u64,
    /// Maximum number of runs executing steps at the same time.
    pub max_concurrent_runs: u16,
    /// Overlap policy for runs targeting the same `(connector, table)` pair.
    pub overlap_policy: OverlapPolicy,
    /// Interval, in milliseconds, at which schedules are checked for due firings.
    pub schedule_poll_interval_ms: u64,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.retry.validate()?;

        if self.step_timeout_ms == 0 {
            return Err(ValidationError::Zero("step_timeout_ms"));
        }

        if self.max_concurrent_runs == 0 {
            return Err(ValidationError::Zero("max_concurrent_runs"));
        }

        if self.schedule_poll_interval_ms == 0 {
            return Err(ValidationError::Zero("schedule_poll_interval_ms"));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            step_timeout_ms: 60 * 60 * 1_000,
            max_concurrent_runs: 8,
            overlap_policy: OverlapPolicy::default(),
            schedule_poll_interval_ms: 1_000,
        }
    }
}
