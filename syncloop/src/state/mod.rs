//! Durable state of runs and schedules.

pub mod history;
pub mod run;
pub mod schedule;
