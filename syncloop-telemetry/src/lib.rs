//! Logging and metrics setup shared by the worker binary and the test suites.

pub mod metrics;
pub mod tracing;
