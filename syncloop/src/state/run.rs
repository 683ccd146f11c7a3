use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SyncError};
use crate::sync_error;
use crate::types::{ConnectorId, RunId, RunKind, ScheduleId, StepKind, SyncMode, WorkflowKind};

/// Phase of a copy table run, as reported by the run's state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunPhase {
    /// Set when the run is created, before any step executes.
    Starting,
    /// Resolving the watermark of an incremental run.
    FetchingLastSyncTime,
    Extracting,
    Transforming,
    Loading,
    /// Extract returned no rows, the run finishes without transforming or loading.
    NoDataToProcess,
    /// Persisting the watermark of an incremental run.
    UpdatingSyncTime,
    /// The watermark could not be persisted, the run still completes.
    SyncTimeUpdateFailed,
    Completed,
    ExtractFailed,
    TransformFailed,
    LoadFailed,
    Cancelled,
}

impl SyncRunPhase {
    /// Returns the phase name exposed by the state query.
    pub fn as_static_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::FetchingLastSyncTime => "fetching_last_sync_time",
            Self::Extracting => "extracting",
            Self::Transforming => "transforming",
            Self::Loading => "loading",
            Self::NoDataToProcess => "no_data_to_process",
            Self::UpdatingSyncTime => "updating_sync_time",
            Self::SyncTimeUpdateFailed => "sync_time_update_failed",
            Self::Completed => "completed",
            Self::ExtractFailed => "extract_failed",
            Self::TransformFailed => "transform_failed",
            Self::LoadFailed => "load_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` once the run can no longer change phase.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns the coarse status implied by this phase.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::ExtractFailed | Self::TransformFailed | Self::LoadFailed => RunStatus::Failed,
            Self::Cancelled => RunStatus::Cancelled,
            Self::Starting
            | Self::FetchingLastSyncTime
            | Self::Extracting
            | Self::Transforming
            | Self::Loading
            | Self::NoDataToProcess
            | Self::UpdatingSyncTime
            | Self::SyncTimeUpdateFailed => RunStatus::Running,
        }
    }

    /// Returns the terminal phase a run ends in when `step` fails permanently.
    ///
    /// Returns `None` for steps whose failure does not fail the run.
    pub fn failed_for(step: StepKind) -> Option<Self> {
        match step {
            StepKind::Extract => Some(Self::ExtractFailed),
            StepKind::Transform => Some(Self::TransformFailed),
            StepKind::Load => Some(Self::LoadFailed),
            StepKind::GetLastSyncTime | StepKind::UpdateLastSyncTime => None,
        }
    }
}

impl fmt::Display for SyncRunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

impl FromStr for SyncRunPhase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let phase = match s {
            "starting" => Self::Starting,
            "fetching_last_sync_time" => Self::FetchingLastSyncTime,
            "extracting" => Self::Extracting,
            "transforming" => Self::Transforming,
            "loading" => Self::Loading,
            "no_data_to_process" => Self::NoDataToProcess,
            "updating_sync_time" => Self::UpdatingSyncTime,
            "sync_time_update_failed" => Self::SyncTimeUpdateFailed,
            "completed" => Self::Completed,
            "extract_failed" => Self::ExtractFailed,
            "transform_failed" => Self::TransformFailed,
            "load_failed" => Self::LoadFailed,
            "cancelled" => Self::Cancelled,
            other => {
                return Err(sync_error!(
                    ErrorKind::DeserializationError,
                    "Unknown run phase",
                    other
                ));
            }
        };

        Ok(phase)
    }
}

/// Coarse lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

impl FromStr for RunStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(sync_error!(
                ErrorKind::DeserializationError,
                "Unknown run status",
                other
            )),
        }
    }
}

/// Structured identity of a run.
///
/// Every lookup by table, connector or originating schedule goes through these attributes, never
/// through the run id string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAttributes {
    pub workflow_kind: WorkflowKind,
    pub kind: RunKind,
    pub table: String,
    pub connector_id: ConnectorId,
    pub schedule_id: Option<ScheduleId>,
    pub retry_of: Option<RunId>,
}

/// Input of a copy table run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTableParams {
    pub table: String,
    pub connector_id: ConnectorId,
    pub mode: SyncMode,
    /// Explicit watermark. When absent, incremental runs fetch the persisted one.
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Result of a successfully completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub rows_processed: u64,
    /// Mode the run actually executed in, which is `full` if the watermark could not be fetched.
    pub mode: SyncMode,
    /// Extract returned no rows.
    pub no_data: bool,
    pub watermark_updated: bool,
}

/// Failure of a run that ended in a failed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step: StepKind,
    pub message: String,
    pub solution: Option<String>,
}

/// Durable record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub attributes: RunAttributes,
    pub params: CopyTableParams,
    pub phase: SyncRunPhase,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub failure: Option<RunFailure>,
    /// Set by a cancellation request, survives restarts.
    pub cancel_requested: bool,
}

impl RunRecord {
    /// Creates the record of a run that has just been started.
    pub fn new(
        id: RunId,
        attributes: RunAttributes,
        params: CopyTableParams,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            attributes,
            params,
            phase: SyncRunPhase::Starting,
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
            closed_at: None,
            outcome: None,
            failure: None,
            cancel_requested: false,
        }
    }

    /// Moves the record to `phase`, closing it if the phase is terminal.
    pub fn set_phase(&mut self, phase: SyncRunPhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.status = phase.status();
        self.updated_at = now;
        if phase.is_terminal() {
            self.closed_at = Some(now);
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Mode the run executed in, falling back to the requested one while it is still running.
    pub fn effective_mode(&self) -> SyncMode {
        self.outcome
            .as_ref()
            .map(|outcome| outcome.mode)
            .unwrap_or(self.params.mode)
    }
}

/// Selection of runs for listing. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub workflow_kind: Option<WorkflowKind>,
    pub status: Option<RunStatus>,
    pub table: Option<String>,
    pub connector_id: Option<ConnectorId>,
    pub schedule_id: Option<ScheduleId>,
}

impl RunFilter {
    /// Matches every running run.
    pub fn running() -> Self {
        Self {
            status: Some(RunStatus::Running),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &RunRecord) -> bool {
        let attributes = &record.attributes;

        self.workflow_kind
            .is_none_or(|kind| kind == attributes.workflow_kind)
            && self.status.is_none_or(|status| status == record.status)
            && self
                .table
                .as_ref()
                .is_none_or(|table| *table == attributes.table)
            && self
                .connector_id
                .as_ref()
                .is_none_or(|connector_id| *connector_id == attributes.connector_id)
            && self
                .schedule_id
                .as_ref()
                .is_none_or(|schedule_id| attributes.schedule_id.as_ref() == Some(schedule_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(table: &str) -> RunRecord {
        RunRecord::new(
            RunId::new("run-1"),
            RunAttributes {
                workflow_kind: WorkflowKind::CopyTable,
                kind: RunKind::RunNow,
                table: table.to_owned(),
                connector_id: "conn1".to_owned(),
                schedule_id: None,
                retry_of: None,
            },
            CopyTableParams {
                table: table.to_owned(),
                connector_id: "conn1".to_owned(),
                mode: SyncMode::Incremental,
                last_sync_time: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn phase_names_round_trip_through_strings() {
        for phase in [
            SyncRunPhase::FetchingLastSyncTime,
            SyncRunPhase::NoDataToProcess,
            SyncRunPhase::SyncTimeUpdateFailed,
            SyncRunPhase::LoadFailed,
        ] {
            assert_eq!(phase.as_static_str().parse::<SyncRunPhase>().unwrap(), phase);
        }
    }

    #[test]
    fn transient_phases_are_still_running() {
        assert_eq!(SyncRunPhase::NoDataToProcess.status(), RunStatus::Running);
        assert_eq!(
            SyncRunPhase::SyncTimeUpdateFailed.status(),
            RunStatus::Running
        );
        assert!(SyncRunPhase::Cancelled.is_terminal());
        assert_eq!(
            SyncRunPhase::failed_for(StepKind::UpdateLastSyncTime),
            None
        );
    }

    #[test]
    fn terminal_phase_closes_record() {
        let mut record = record("orders");
        let now = Utc::now();

        record.set_phase(SyncRunPhase::Loading, now);
        assert!(record.closed_at.is_none());

        record.set_phase(SyncRunPhase::LoadFailed, now);
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.closed_at, Some(now));
    }

    #[test]
    fn filter_matches_on_structured_attributes() {
        let record = record("orders");

        assert!(RunFilter::default().matches(&record));
        assert!(RunFilter::running().matches(&record));

        let by_table = RunFilter {
            table: Some("customers".to_owned()),
            ..RunFilter::default()
        };
        assert!(!by_table.matches(&record));

        let by_schedule = RunFilter {
            schedule_id: Some(ScheduleId::new("schedule-conn1-orders-1")),
            ..RunFilter::default()
        };
        assert!(!by_schedule.matches(&record));
    }
}
