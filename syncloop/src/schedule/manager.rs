use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::schedule::cron::CronExpr;
use crate::state::schedule::{DEFAULT_CRON_EXPRESSION, ScheduleConfig, ScheduleSummary};
use crate::store::schedule::ScheduleStore;
use crate::sync_error;
use crate::types::{ConnectorId, RunId, ScheduleId, SyncMode};

/// Note attached to schedules paused without an explicit note.
pub const DEFAULT_PAUSE_NOTE: &str = "User requested pause";

/// Note attached to schedules unpaused without an explicit note.
pub const DEFAULT_UNPAUSE_NOTE: &str = "User requested unpause";

/// Note attached by [`ScheduleManager::update_schedule`].
pub const UPDATE_NOTE: &str = "Updated schedule";

/// Maximum number of ids tried when the derived schedule id is already taken.
const MAX_ID_ATTEMPTS: i64 = 16;

/// Request to create a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSchedule {
    pub connector_id: ConnectorId,
    pub table: String,
    /// Defaults to every minute when empty.
    pub cron_expression: String,
    pub is_active: bool,
}

/// Creates and mutates schedules.
///
/// Mutations are serialized so the duplicate check of a creation cannot race with another
/// creation for the same pair.
#[derive(Debug, Clone)]
pub struct ScheduleManager<S> {
    store: S,
    lock: Arc<Mutex<()>>,
}

impl<S> ScheduleManager<S>
where
    S: ScheduleStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Creates a schedule that starts incremental runs.
    ///
    /// Fails with [`ErrorKind::DuplicateSchedule`] if an active schedule exists for the same
    /// connector and table. Paused schedules do not block creation.
    pub async fn create_schedule(&self, request: CreateSchedule) -> SyncResult<ScheduleConfig> {
        if request.connector_id.is_empty() || request.table.is_empty() {
            bail!(
                ErrorKind::InvalidData,
                "Schedule target is incomplete",
                "connector and table are required"
            );
        }

        let cron_expression = normalize_cron(&request.cron_expression);
        let now = Utc::now();
        let next_run_time = next_run_time(cron_expression, now)?;

        let _guard = self.lock.lock().await;

        if let Some(existing) = self
            .find_active(&request.connector_id, &request.table)
            .await?
        {
            return Err(sync_error!(
                ErrorKind::DuplicateSchedule,
                "Schedule with this connector and table already exists",
                existing.id
            ));
        }

        let mut schedule = ScheduleConfig {
            id: ScheduleId::derive(
                &request.connector_id,
                &request.table,
                now.timestamp_millis(),
            ),
            note: format!("Auto-sync for connector {}", request.connector_id),
            connector_id: request.connector_id,
            table: request.table,
            cron_expression: cron_expression.to_owned(),
            is_active: request.is_active,
            mode: SyncMode::Incremental,
            created_at: now,
            last_run_time: None,
            next_run_time: Some(next_run_time),
            last_run_id: None,
        };

        for offset in 0..MAX_ID_ATTEMPTS {
            if offset > 0 {
                schedule.id = ScheduleId::derive(
                    &schedule.connector_id,
                    &schedule.table,
                    (now + TimeDelta::milliseconds(offset)).timestamp_millis(),
                );
            }

            if self.store.insert_schedule(schedule.clone()).await? {
                info!(
                    schedule_id = %schedule.id,
                    connector_id = %schedule.connector_id,
                    table = %schedule.table,
                    cron_expression = %schedule.cron_expression,
                    is_active = schedule.is_active,
                    "schedule created",
                );

                return Ok(schedule);
            }
        }

        Err(sync_error!(
            ErrorKind::DuplicateSchedule,
            "Could not allocate a schedule id",
            schedule.id
        ))
    }

    /// Replaces the cron expression and the active flag of a schedule.
    pub async fn update_schedule(
        &self,
        schedule_id: &ScheduleId,
        cron_expression: &str,
        is_active: bool,
    ) -> SyncResult<ScheduleConfig> {
        let cron_expression = normalize_cron(cron_expression);
        let next_run_time = next_run_time(cron_expression, Utc::now())?;

        let _guard = self.lock.lock().await;

        let mut schedule = self.load(schedule_id).await?;
        if is_active && !schedule.is_active {
            self.ensure_sole_active(&schedule).await?;
        }
        schedule.cron_expression = cron_expression.to_owned();
        schedule.is_active = is_active;
        schedule.next_run_time = Some(next_run_time);
        schedule.note = UPDATE_NOTE.to_owned();

        self.store.update_schedule(&schedule).await?;
        info!(%schedule_id, cron_expression, is_active, "schedule updated");

        Ok(schedule)
    }

    /// Pauses a schedule. The cron expression is left untouched.
    pub async fn pause_schedule(
        &self,
        schedule_id: &ScheduleId,
        note: Option<&str>,
    ) -> SyncResult<ScheduleConfig> {
        self.set_active(schedule_id, false, note.unwrap_or(DEFAULT_PAUSE_NOTE))
            .await
    }

    /// Unpauses a schedule. Firings missed while paused are not caught up.
    pub async fn unpause_schedule(
        &self,
        schedule_id: &ScheduleId,
        note: Option<&str>,
    ) -> SyncResult<ScheduleConfig> {
        self.set_active(schedule_id, true, note.unwrap_or(DEFAULT_UNPAUSE_NOTE))
            .await
    }

    pub async fn get_schedule(&self, schedule_id: &ScheduleId) -> SyncResult<ScheduleConfig> {
        self.load(schedule_id).await
    }

    /// Lists every schedule.
    ///
    /// Read failures do not fail the listing: a schedule that cannot be loaded is skipped, and
    /// an empty list is returned if the ids cannot be enumerated.
    pub async fn list_schedules(&self) -> Vec<ScheduleSummary> {
        let schedule_ids = match self.store.list_schedule_ids().await {
            Ok(schedule_ids) => schedule_ids,
            Err(err) => {
                warn!(error = %err, "failed to enumerate schedules");
                return Vec::new();
            }
        };

        let mut schedules = Vec::with_capacity(schedule_ids.len());
        for schedule_id in schedule_ids {
            match self.store.get_schedule(&schedule_id).await {
                Ok(Some(schedule)) => schedules.push(schedule.summary()),
                Ok(None) => {}
                Err(err) => warn!(%schedule_id, error = %err, "skipping schedule that failed to load"),
            }
        }

        schedules
    }

    /// Deletes a schedule. Runs it already started are kept.
    pub async fn delete_schedule(&self, schedule_id: &ScheduleId) -> SyncResult<()> {
        let _guard = self.lock.lock().await;

        if !self.store.delete_schedule(schedule_id).await? {
            bail!(
                ErrorKind::ScheduleNotFound,
                "Schedule not found",
                schedule_id
            );
        }

        info!(%schedule_id, "schedule deleted");

        Ok(())
    }

    /// Moves a due schedule to its next firing time.
    ///
    /// Returns the schedule as it was stored before advancing, or `None` if it is no longer due.
    pub(crate) async fn advance_due(
        &self,
        schedule_id: &ScheduleId,
        now: DateTime<Utc>,
    ) -> SyncResult<Option<ScheduleConfig>> {
        let _guard = self.lock.lock().await;

        let Some(mut schedule) = self.store.get_schedule(schedule_id).await? else {
            return Ok(None);
        };
        if !schedule.is_due(now) {
            return Ok(None);
        }

        let due = schedule.clone();
        schedule.next_run_time = Some(next_run_time(&schedule.cron_expression, now)?);
        self.store.update_schedule(&schedule).await?;

        Ok(Some(due))
    }

    /// Records the run started by a firing of `schedule_id`.
    pub(crate) async fn record_run(
        &self,
        schedule_id: &ScheduleId,
        fired_at: DateTime<Utc>,
        run_id: RunId,
    ) -> SyncResult<()> {
        let _guard = self.lock.lock().await;

        // The schedule may have been deleted while the run was starting.
        let Some(mut schedule) = self.store.get_schedule(schedule_id).await? else {
            return Ok(());
        };
        schedule.last_run_time = Some(fired_at);
        schedule.last_run_id = Some(run_id);
        self.store.update_schedule(&schedule).await?;

        Ok(())
    }

    async fn set_active(
        &self,
        schedule_id: &ScheduleId,
        is_active: bool,
        note: &str,
    ) -> SyncResult<ScheduleConfig> {
        let _guard = self.lock.lock().await;

        let mut schedule = self.load(schedule_id).await?;
        if is_active && !schedule.is_active {
            self.ensure_sole_active(&schedule).await?;
            let cron_expression = schedule.cron_expression.clone();
            schedule.next_run_time = Some(next_run_time(&cron_expression, Utc::now())?);
        }
        schedule.is_active = is_active;
        schedule.note = note.to_owned();

        self.store.update_schedule(&schedule).await?;
        info!(%schedule_id, is_active, note, "schedule state changed");

        Ok(schedule)
    }

    async fn load(&self, schedule_id: &ScheduleId) -> SyncResult<ScheduleConfig> {
        self.store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| {
                sync_error!(
                    ErrorKind::ScheduleNotFound,
                    "Schedule not found",
                    schedule_id
                )
            })
    }

    /// Fails with [`ErrorKind::DuplicateSchedule`] if another schedule is active for the pair of
    /// `schedule`.
    async fn ensure_sole_active(&self, schedule: &ScheduleConfig) -> SyncResult<()> {
        if let Some(existing) = self
            .find_active(&schedule.connector_id, &schedule.table)
            .await?
            && existing.id != schedule.id
        {
            return Err(sync_error!(
                ErrorKind::DuplicateSchedule,
                "Another schedule is active for this connector and table",
                existing.id
            ));
        }

        Ok(())
    }

    /// Returns the active schedule of a pair, probing every stored schedule.
    async fn find_active(
        &self,
        connector_id: &str,
        table: &str,
    ) -> SyncResult<Option<ScheduleConfig>> {
        for schedule_id in self.store.list_schedule_ids().await? {
            let Some(schedule) = self.store.get_schedule(&schedule_id).await? else {
                continue;
            };

            if schedule.is_active && schedule.connector_id == connector_id && schedule.table == table
            {
                return Ok(Some(schedule));
            }
        }

        Ok(None)
    }
}

fn normalize_cron(cron_expression: &str) -> &str {
    let trimmed = cron_expression.trim();
    if trimmed.is_empty() {
        DEFAULT_CRON_EXPRESSION
    } else {
        trimmed
    }
}

/// Validates `cron_expression` and returns its first firing time after `now`.
fn next_run_time(
    cron_expression: &str,
    now: DateTime<Utc>,
) -> SyncResult<DateTime<Utc>> {
    let cron = CronExpr::parse(cron_expression)?;

    cron.next_after(now).ok_or_else(|| {
        sync_error!(
            ErrorKind::InvalidCronExpression,
            "Cron expression never fires",
            cron_expression
        )
    })
}
