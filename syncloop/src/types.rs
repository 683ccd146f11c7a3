//! Identifiers and small value types shared across the crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SyncError};
use crate::sync_error;

/// A single record flowing through extract, transform and load.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Identifier of a source connector.
pub type ConnectorId = String;

/// Length of the random suffix appended to generated run ids.
const RUN_ID_SUFFIX_LEN: usize = 8;

/// Unique identifier of a run.
///
/// The string encodes how the run was started and which table it targets so operators can read
/// it at a glance, but nothing in the crate parses it back: the structured
/// [`crate::state::run::RunAttributes`] stored with every run are the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier for a run started on demand, e.g. `run-now-copy_table-orders-1700000000-x1y2z3w4`.
    pub fn run_now(kind: WorkflowKind, table: &str, now: DateTime<Utc>) -> Self {
        Self(format!(
            "run-now-{kind}-{table}-{}-{}",
            now.timestamp(),
            random_suffix()
        ))
    }

    /// Identifier for a run fired by a schedule.
    pub fn scheduled(table: &str, now: DateTime<Utc>) -> Self {
        Self(format!(
            "scheduled-{table}-{}-{}",
            now.timestamp(),
            random_suffix()
        ))
    }

    /// Identifier for a run retrying `original`.
    pub fn retry(original: &RunId, now: DateTime<Utc>) -> Self {
        Self(format!(
            "retry-{original}-{}-{}",
            now.timestamp(),
            random_suffix()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

fn random_suffix() -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(RUN_ID_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Unique identifier of a schedule, derived from connector, table and creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(String);

impl ScheduleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds `schedule-{connector}-{table}-{created_at_ms}`.
    pub fn derive(connector_id: &str, table: &str, created_at_ms: i64) -> Self {
        Self(format!("schedule-{connector_id}-{table}-{created_at_ms}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScheduleId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Whether a run copies the whole table or only rows newer than the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, SyncMode::Incremental)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(sync_error!(
                ErrorKind::InvalidData,
                "Unknown sync mode",
                other
            )),
        }
    }
}

/// The workflows this engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Copies one table from a source connector into the destination.
    CopyTable,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::CopyTable => "copy_table",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both the snake case name and the legacy `CopyTableWorkflow` type name.
impl FromStr for WorkflowKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy_table" | "CopyTableWorkflow" => Ok(WorkflowKind::CopyTable),
            other => Err(sync_error!(
                ErrorKind::UnknownWorkflowKind,
                "Unknown workflow kind",
                other
            )),
        }
    }
}

/// How a run came to be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    RunNow,
    Scheduled,
    Retry,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::RunNow => "run_now",
            RunKind::Scheduled => "scheduled",
            RunKind::Retry => "retry",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The named operations a copy table run invokes on its step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    GetLastSyncTime,
    Extract,
    Transform,
    Load,
    UpdateLastSyncTime,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::GetLastSyncTime => "get_last_sync_time",
            StepKind::Extract => "extract",
            StepKind::Transform => "transform",
            StepKind::Load => "load",
            StepKind::UpdateLastSyncTime => "update_last_sync_time",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn workflow_kind_accepts_both_names() {
        assert_eq!(
            "copy_table".parse::<WorkflowKind>().unwrap(),
            WorkflowKind::CopyTable
        );
        assert_eq!(
            "CopyTableWorkflow".parse::<WorkflowKind>().unwrap(),
            WorkflowKind::CopyTable
        );

        let err = "MergeWorkflow".parse::<WorkflowKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownWorkflowKind);
        assert_eq!(err.detail(), Some("MergeWorkflow"));
    }

    #[test]
    fn run_ids_carry_kind_table_and_unique_suffix() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let a = RunId::run_now(WorkflowKind::CopyTable, "orders", now);
        let b = RunId::run_now(WorkflowKind::CopyTable, "orders", now);
        assert!(a.as_str().starts_with("run-now-copy_table-orders-1704067200-"));
        assert_ne!(a, b);

        let scheduled = RunId::scheduled("orders", now);
        assert!(scheduled.as_str().starts_with("scheduled-orders-1704067200-"));

        let retry = RunId::retry(&scheduled, now);
        assert!(retry.as_str().starts_with(&format!("retry-{scheduled}-")));
    }

    #[test]
    fn schedule_id_is_derived_from_pair_and_time() {
        let id = ScheduleId::derive("conn1", "orders", 1_700_000_000_000);
        assert_eq!(id.as_str(), "schedule-conn1-orders-1700000000000");
    }

    #[test]
    fn sync_mode_parses_names() {
        assert_eq!("full".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert_eq!(SyncMode::Incremental.to_string(), "incremental");
        assert!("partial".parse::<SyncMode>().is_err());
    }
}
