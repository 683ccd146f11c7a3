use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConnectorId, RunId, ScheduleId, SyncMode};

/// Default cron expression of schedules created without one: every minute.
pub const DEFAULT_CRON_EXPRESSION: &str = "* * * * *";

/// A persisted recurring trigger for copy table runs of one (connector, table) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: ScheduleId,
    pub connector_id: ConnectorId,
    pub table: String,
    pub cron_expression: String,
    /// `false` while paused.
    pub is_active: bool,
    /// Mode of every run this schedule starts, always incremental.
    pub mode: SyncMode,
    /// Note left by the last pause or unpause.
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_id: Option<RunId>,
}

impl ScheduleConfig {
    pub fn summary(&self) -> ScheduleSummary {
        ScheduleSummary {
            id: self.id.clone(),
            cron_expression: self.cron_expression.clone(),
            is_active: self.is_active,
            last_run_time: self.last_run_time,
            next_run_time: self.next_run_time,
        }
    }

    /// Returns `true` if the schedule is active and its next firing time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self
                .next_run_time
                .is_some_and(|next_run_time| next_run_time <= now)
    }
}

/// Listing view of a schedule, also attached to the runs it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSummary {
    pub id: ScheduleId,
    pub cron_expression: String,
    pub is_active: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
}
