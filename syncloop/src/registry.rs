use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{Engine, StartRun};
use crate::error::{ErrorKind, SyncResult};
use crate::executor::StepExecutor;
use crate::state::history::first_failure_message;
use crate::state::run::{RunFilter, RunOutcome, RunRecord, RunStatus, SyncRunPhase};
use crate::state::schedule::ScheduleSummary;
use crate::store::run::RunStore;
use crate::store::schedule::ScheduleStore;
use crate::sync_error;
use crate::types::{ConnectorId, RunId, RunKind, SyncMode, WorkflowKind};

/// Request to start a run on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNowRequest {
    pub table: String,
    pub connector_id: ConnectorId,
    pub mode: SyncMode,
    /// Name of the workflow to run, [`WorkflowKind::CopyTable`] when unset.
    pub workflow_kind: Option<String>,
}

/// Listing view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub workflow_kind: WorkflowKind,
    pub kind: RunKind,
    pub status: RunStatus,
    pub phase: SyncRunPhase,
    pub table: String,
    pub connector_id: ConnectorId,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    /// Schedule that started the run, if it still exists.
    pub schedule: Option<ScheduleSummary>,
}

/// Detailed status of a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusDetail {
    pub summary: RunSummary,
    pub closed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    /// First failure recorded for a failed run.
    pub failure: Option<String>,
    pub history_len: usize,
}

/// Read and control surface over runs.
///
/// Listing is fail-open: store failures are logged and yield partial or empty results, so that
/// the status surface stays available while the store is degraded. Everything else reports
/// errors to the caller.
#[derive(Debug, Clone)]
pub struct RunRegistry<S, E> {
    engine: Engine<S, E>,
}

impl<S, E> RunRegistry<S, E>
where
    S: RunStore + ScheduleStore + Clone + Send + Sync + 'static,
    E: StepExecutor + Clone + Send + Sync + 'static,
{
    pub fn new(engine: Engine<S, E>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine<S, E> {
        &self.engine
    }

    /// Lists the runs matching `filter`, most recently started first.
    pub async fn list_runs(&self, filter: &RunFilter) -> Vec<RunSummary> {
        let runs = match self.engine.store().list_runs(filter).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(error = %err, "failed to list runs");
                return Vec::new();
            }
        };

        let mut summaries = Vec::with_capacity(runs.len());
        for record in runs {
            let phase = record.phase;
            summaries.push(self.summarize(record, phase).await);
        }

        summaries
    }

    /// Returns the detailed status of a run.
    ///
    /// The phase of a run active in this process is read from its worker, so it may be ahead of
    /// the stored record.
    pub async fn get_run_status(&self, run_id: &RunId) -> SyncResult<RunStatusDetail> {
        let record = self.load_run(run_id).await?;
        let phase = if record.is_running() {
            self.engine.current_phase(run_id).await?
        } else {
            record.phase
        };

        let history = self.engine.store().get_events(run_id).await?;
        let failure = if phase.status() == RunStatus::Failed {
            first_failure_message(&history).or_else(|| {
                record
                    .failure
                    .as_ref()
                    .map(|failure| failure.message.clone())
            })
        } else {
            None
        };

        let closed_at = record.closed_at;
        let outcome = record.outcome.clone();

        Ok(RunStatusDetail {
            summary: self.summarize(record, phase).await,
            closed_at,
            outcome,
            failure,
            history_len: history.len(),
        })
    }

    /// Starts a run on demand and returns its id.
    pub async fn run_now(&self, request: RunNowRequest) -> SyncResult<RunId> {
        let workflow_kind = match request.workflow_kind.as_deref() {
            None | Some("") => WorkflowKind::CopyTable,
            Some(name) => name.parse()?,
        };

        let start = StartRun {
            workflow_kind,
            ..StartRun::run_now(request.table, request.connector_id, request.mode)
        };

        self.engine.start_run(start).await
    }

    /// Starts a new run for the table of `run_id`.
    ///
    /// The new run always performs a full sync, whatever the mode of the original run.
    pub async fn retry_run(&self, run_id: &RunId) -> SyncResult<RunId> {
        let original = self.load_run(run_id).await?;

        let start = StartRun {
            workflow_kind: original.attributes.workflow_kind,
            kind: RunKind::Retry,
            table: original.attributes.table,
            connector_id: original.attributes.connector_id,
            mode: SyncMode::Full,
            last_sync_time: None,
            schedule_id: None,
            retry_of: Some(original.id),
        };

        let new_run_id = self.engine.start_run(start).await?;
        info!(%run_id, %new_run_id, "run retried in full mode");

        Ok(new_run_id)
    }

    /// Requests cancellation of a run, returning `false` if it already finished.
    pub async fn cancel_run(&self, run_id: &RunId) -> SyncResult<bool> {
        self.engine.cancel_run(run_id).await
    }

    /// Requests cancellation of every running run and returns how many were signalled.
    ///
    /// A run that cannot be cancelled does not stop the others from being cancelled.
    pub async fn terminate_all_running(&self) -> SyncResult<usize> {
        let runs = self.engine.store().list_runs(&RunFilter::running()).await?;

        let mut cancelled = 0;
        for record in runs {
            match self.engine.cancel_run(&record.id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(err) => warn!(run_id = %record.id, error = %err, "failed to cancel run"),
            }
        }

        info!(cancelled, "terminated all running runs");

        Ok(cancelled)
    }

    /// Deletes failed and cancelled runs together with their history.
    pub async fn purge_terminal_runs(&self) -> SyncResult<u64> {
        let mut run_ids = Vec::new();
        for status in [RunStatus::Failed, RunStatus::Cancelled] {
            let filter = RunFilter {
                status: Some(status),
                ..RunFilter::default()
            };
            let runs = self.engine.store().list_runs(&filter).await?;
            run_ids.extend(runs.into_iter().map(|record| record.id));
        }

        if run_ids.is_empty() {
            return Ok(0);
        }

        let purged = self.engine.store().delete_runs(&run_ids).await?;
        info!(purged, "purged terminal runs");

        Ok(purged)
    }

    async fn summarize(&self, record: RunRecord, phase: SyncRunPhase) -> RunSummary {
        let schedule = match &record.attributes.schedule_id {
            Some(schedule_id) => match self.engine.store().get_schedule(schedule_id).await {
                Ok(schedule) => schedule.map(|schedule| schedule.summary()),
                Err(err) => {
                    warn!(run_id = %record.id, %schedule_id, error = %err, "failed to load schedule of run");
                    None
                }
            },
            None => None,
        };

        RunSummary {
            mode: record.effective_mode(),
            id: record.id,
            workflow_kind: record.attributes.workflow_kind,
            kind: record.attributes.kind,
            status: phase.status(),
            phase,
            table: record.attributes.table,
            connector_id: record.attributes.connector_id,
            started_at: record.started_at,
            schedule,
        }
    }

    async fn load_run(&self, run_id: &RunId) -> SyncResult<RunRecord> {
        self.engine.store().get_run(run_id).await?.ok_or_else(|| {
            sync_error!(ErrorKind::RunNotFound, "Run not found", run_id.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use syncloop_config::shared::EngineConfig;

    use super::*;
    use crate::executor::memory::MemoryExecutor;
    use crate::state::run::{CopyTableParams, RunAttributes};
    use crate::store::both::memory::MemoryStore;

    fn registry(store: MemoryStore) -> RunRegistry<MemoryStore, MemoryExecutor> {
        let engine = Engine::new(EngineConfig::default(), store, MemoryExecutor::new());
        RunRegistry::new(engine)
    }

    fn finished_run(id: &str, table: &str, phase: SyncRunPhase) -> RunRecord {
        let now = Utc::now();
        let mut record = RunRecord::new(
            RunId::new(id),
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
            now,
        );
        record.set_phase(phase, now);
        record
    }

    #[tokio::test]
    async fn unknown_workflow_kind_is_rejected() {
        let registry = registry(MemoryStore::new());

        let err = registry
            .run_now(RunNowRequest {
                table: "orders".to_owned(),
                connector_id: "conn1".to_owned(),
                mode: SyncMode::Full,
                workflow_kind: Some("ReplicateEverythingWorkflow".to_owned()),
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnknownWorkflowKind);
        assert!(registry.list_runs(&RunFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn status_of_unknown_run_is_not_found() {
        let registry = registry(MemoryStore::new());

        let err = registry
            .get_run_status(&RunId::new("missing"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RunNotFound);
    }

    #[tokio::test]
    async fn retry_of_unknown_run_is_not_found() {
        let registry = registry(MemoryStore::new());

        let err = registry.retry_run(&RunId::new("missing")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RunNotFound);
    }

    #[tokio::test]
    async fn listing_filters_by_status() {
        let store = MemoryStore::new();
        store
            .insert_run(finished_run("run-1", "orders", SyncRunPhase::Completed))
            .await
            .unwrap();
        store
            .insert_run(finished_run("run-2", "users", SyncRunPhase::LoadFailed))
            .await
            .unwrap();
        let registry = registry(store);

        let failed = registry
            .list_runs(&RunFilter {
                status: Some(RunStatus::Failed),
                ..RunFilter::default()
            })
            .await;

        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].table, "users");
        assert_eq!(failed[0].phase, SyncRunPhase::LoadFailed);
        assert_eq!(failed[0].schedule, None);
    }

    #[tokio::test]
    async fn purge_keeps_completed_runs() {
        let store = MemoryStore::new();
        for (id, phase) in [
            ("run-1", SyncRunPhase::Completed),
            ("run-2", SyncRunPhase::ExtractFailed),
            ("run-3", SyncRunPhase::Cancelled),
        ] {
            store
                .insert_run(finished_run(id, "orders", phase))
                .await
                .unwrap();
        }
        let registry = registry(store.clone());

        assert_eq!(registry.purge_terminal_runs().await.unwrap(), 2);
        assert_eq!(registry.purge_terminal_runs().await.unwrap(), 0);

        let remaining = registry.list_runs(&RunFilter::default()).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, RunId::new("run-1"));
    }

    #[tokio::test]
    async fn cancelling_a_finished_run_is_a_no_op() {
        let store = MemoryStore::new();
        store
            .insert_run(finished_run("run-1", "orders", SyncRunPhase::Completed))
            .await
            .unwrap();
        let registry = registry(store);

        assert!(!registry.cancel_run(&RunId::new("run-1")).await.unwrap());
        assert_eq!(registry.terminate_all_running().await.unwrap(), 0);
    }
}
