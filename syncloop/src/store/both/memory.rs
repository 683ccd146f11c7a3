use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::state::history::{HistoryEvent, RunEvent};
use crate::state::run::{RunFilter, RunRecord};
use crate::state::schedule::ScheduleConfig;
use crate::store::run::RunStore;
use crate::store::schedule::ScheduleStore;
use crate::types::{RunId, ScheduleId};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<RunId, RunRecord>,
    histories: HashMap<RunId, Vec<HistoryEvent>>,
    schedules: BTreeMap<ScheduleId, ScheduleConfig>,
}

/// In-memory store for tests and for workers that do not need durability across restarts.
///
/// Runs interrupted by a process exit are lost together with the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryStore {
    async fn insert_run(&self, record: RunRecord) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.runs.contains_key(&record.id) {
            bail!(
                ErrorKind::InvalidState,
                "Run already exists",
                record.id.to_string()
            );
        }

        inner.histories.insert(record.id.clone(), Vec::new());
        inner.runs.insert(record.id.clone(), record);

        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> SyncResult<Option<RunRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner.runs.get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> SyncResult<Vec<RunRecord>> {
        let inner = self.inner.lock().await;

        let mut runs: Vec<RunRecord> = inner
            .runs
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(runs)
    }

    async fn update_run(&self, record: &RunRecord) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(stored) = inner.runs.get_mut(&record.id) else {
            bail!(ErrorKind::RunNotFound, "Run not found", record.id.to_string());
        };

        let cancel_requested = stored.cancel_requested || record.cancel_requested;
        *stored = record.clone();
        stored.cancel_requested = cancel_requested;

        Ok(())
    }

    async fn request_cancel(&self, run_id: &RunId) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(stored) = inner.runs.get_mut(run_id) else {
            bail!(ErrorKind::RunNotFound, "Run not found", run_id.to_string());
        };

        if !stored.is_running() {
            return Ok(false);
        }

        stored.cancel_requested = true;

        Ok(true)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> SyncResult<HistoryEvent> {
        let mut inner = self.inner.lock().await;

        let Some(history) = inner.histories.get_mut(run_id) else {
            bail!(ErrorKind::RunNotFound, "Run not found", run_id.to_string());
        };

        let entry = HistoryEvent {
            sequence: history.len() as u64 + 1,
            recorded_at: Utc::now(),
            event,
        };
        history.push(entry.clone());

        Ok(entry)
    }

    async fn get_events(&self, run_id: &RunId) -> SyncResult<Vec<HistoryEvent>> {
        let inner = self.inner.lock().await;

        Ok(inner.histories.get(run_id).cloned().unwrap_or_default())
    }

    async fn delete_runs(&self, run_ids: &[RunId]) -> SyncResult<u64> {
        let mut inner = self.inner.lock().await;

        let mut deleted = 0;
        for run_id in run_ids {
            inner.histories.remove(run_id);
            if inner.runs.remove(run_id).is_some() {
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

impl ScheduleStore for MemoryStore {
    async fn insert_schedule(&self, schedule: ScheduleConfig) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;

        if inner.schedules.contains_key(&schedule.id) {
            return Ok(false);
        }
        inner.schedules.insert(schedule.id.clone(), schedule);

        Ok(true)
    }

    async fn get_schedule(&self, schedule_id: &ScheduleId) -> SyncResult<Option<ScheduleConfig>> {
        let inner = self.inner.lock().await;

        Ok(inner.schedules.get(schedule_id).cloned())
    }

    async fn list_schedule_ids(&self) -> SyncResult<Vec<ScheduleId>> {
        let inner = self.inner.lock().await;

        Ok(inner.schedules.keys().cloned().collect())
    }

    async fn update_schedule(&self, schedule: &ScheduleConfig) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(stored) = inner.schedules.get_mut(&schedule.id) else {
            bail!(
                ErrorKind::ScheduleNotFound,
                "Schedule not found",
                schedule.id.to_string()
            );
        };
        *stored = schedule.clone();

        Ok(())
    }

    async fn delete_schedule(&self, schedule_id: &ScheduleId) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;

        Ok(inner.schedules.remove(schedule_id).is_some())
    }
}
