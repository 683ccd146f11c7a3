//! Recurring triggers for copy table runs.

pub mod cron;
pub mod manager;
pub mod trigger;
