use std::fmt;

use crate::error::{ErrorKind, SyncError};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The step is retried automatically according to the retry policy.
    Timed,
    /// The step fails immediately, the run has to be retried by hand once the cause is fixed.
    NoRetry,
}

impl fmt::Display for RetryDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDirective::Timed => f.write_str("timed"),
            RetryDirective::NoRetry => f.write_str("no_retry"),
        }
    }
}

/// Policy describing how a failed step attempt is handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }

    pub fn should_retry(&self) -> bool {
        self.retry_directive == RetryDirective::Timed
    }
}

/// Builds an [`ErrorHandlingPolicy`] from a step error.
///
/// Steps are expected to be retryable, so everything not known to be permanent is retried with
/// backoff until the attempts run out.
pub fn build_error_handling_policy(error: &SyncError) -> ErrorHandlingPolicy {
    match error.kind() {
        ErrorKind::InvalidData => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Fix the source data or the table definition, then retry the run."),
        ),
        ErrorKind::ValidationError => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Fix the rows rejected by the destination, then retry the run."),
        ),
        ErrorKind::ConfigError => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Update the connector or worker configuration, then retry the run."),
        ),
        ErrorKind::NonRetryable => ErrorHandlingPolicy::new(RetryDirective::NoRetry, None),
        ErrorKind::StepTimeout => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Check the step executor for slow queries or raise the step timeout."),
        ),
        ErrorKind::SourceConnectionFailed
        | ErrorKind::DestinationConnectionFailed
        | ErrorKind::StoreConnectionFailed => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Verify the connectivity and credentials of the failing system."),
        ),
        _ => ErrorHandlingPolicy::new(RetryDirective::Timed, None),
    }
}
