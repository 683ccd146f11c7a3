use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Retry settings applied to every step invocation of a sync run.
///
/// The delay before retry `n` (1-based) is `initial_interval_ms * backoff_coefficient^(n - 1)`,
/// capped at `max_interval_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay, in milliseconds, before the first retry.
    pub initial_interval_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_coefficient: f64,
    /// Upper bound, in milliseconds, for the delay between attempts.
    pub max_interval_ms: u64,
    /// Total number of attempts, the first one included. Zero means unlimited.
    pub max_attempts: u32,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.backoff_coefficient < 1.0 {
            return Err(ValidationError::BackoffCoefficientTooSmall(
                self.backoff_coefficient,
            ));
        }

        if self.initial_interval_ms > self.max_interval_ms {
            return Err(ValidationError::InitialIntervalAboveMax {
                initial: self.initial_interval_ms,
                max: self.max_interval_ms,
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            max_interval_ms: 300_000,
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_config_is_valid() {
        assert_eq!(RetryConfig::default().validate(), Ok(()));
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let config = RetryConfig {
            backoff_coefficient: 0.5,
            ..RetryConfig::default()
        };

        assert_eq!(
            config.validate(),
            Err(ValidationError::BackoffCoefficientTooSmall(0.5))
        );
    }

    #[test]
    fn initial_interval_above_max_is_rejected() {
        let config = RetryConfig {
            initial_interval_ms: 10,
            max_interval_ms: 5,
            ..RetryConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InitialIntervalAboveMax { initial: 10, max: 5 })
        ));
    }
}
