//! Durable orchestration of table sync runs.
//!
//! A run copies one table from a source connector into the destination by invoking the steps of
//! a [`executor::StepExecutor`] in a fixed order. Runs are journaled in a [`store::run::RunStore`]
//! so they survive restarts, retried with backoff, cancellable between steps, and started on
//! demand through the [`registry::RunRegistry`] or on a cron cadence by the
//! [`schedule::trigger::ScheduleTrigger`].

mod macros;

pub mod concurrency;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod migrations;
pub mod registry;
pub mod schedule;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
pub mod workflow;
