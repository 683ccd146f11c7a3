use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// The backoff coefficient would shrink the retry interval.
    #[error("`backoff_coefficient` must be at least 1.0, got {0}")]
    BackoffCoefficientTooSmall(f64),
    /// The first retry interval is larger than the maximum one.
    #[error("`initial_interval_ms` ({initial}) cannot exceed `max_interval_ms` ({max})")]
    InitialIntervalAboveMax { initial: u64, max: u64 },
    /// A value which must be positive was set to zero.
    #[error("`{0}` cannot be zero")]
    Zero(&'static str),
}
