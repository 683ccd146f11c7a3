use std::time::Duration;

use syncloop_config::shared::RetryConfig;

/// Backoff schedule applied to every step attempt of a run.
///
/// The delay after attempt `n` (starting at 1) is `initial_interval * coefficient^(n - 1)`, capped
/// at `maximum_interval`. `maximum_attempts` counts every attempt including the first, with `0`
/// meaning unlimited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial_interval: Duration,
    backoff_coefficient: f64,
    maximum_interval: Duration,
    maximum_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        initial_interval: Duration,
        backoff_coefficient: f64,
        maximum_interval: Duration,
        maximum_attempts: u32,
    ) -> Self {
        Self {
            initial_interval,
            backoff_coefficient,
            maximum_interval,
            maximum_attempts,
        }
    }

    pub fn maximum_attempts(&self) -> u32 {
        self.maximum_attempts
    }

    /// Returns `true` if another attempt may follow attempt number `attempt`.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }

    /// Returns the delay to wait after the failed attempt number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs =
            self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.maximum_interval.as_secs_f64() {
            return self.maximum_interval;
        }

        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        (&RetryConfig::default()).into()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_interval_ms),
            config.backoff_coefficient,
            Duration::from_millis(config.max_interval_ms),
            config.max_attempts,
        )
    }
}
