use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use syncloop_config::shared::{EngineConfig, OverlapPolicy};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, SyncResult};
use crate::executor::StepExecutor;
use crate::metrics::{RUN_KIND_LABEL, SYNCLOOP_RUNS_STARTED_TOTAL, WORKFLOW_KIND_LABEL};
use crate::state::run::{CopyTableParams, RunAttributes, RunFilter, RunRecord, SyncRunPhase};
use crate::store::run::RunStore;
use crate::sync_error;
use crate::types::{ConnectorId, RunId, RunKind, ScheduleId, SyncMode, WorkflowKind};
use crate::workers::pool::RunWorkerPool;
use crate::workers::run::RunWorker;

/// Request to start a new run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRun {
    pub workflow_kind: WorkflowKind,
    pub kind: RunKind,
    pub table: String,
    pub connector_id: ConnectorId,
    pub mode: SyncMode,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub schedule_id: Option<ScheduleId>,
    pub retry_of: Option<RunId>,
}

impl StartRun {
    /// Starts a copy table run on demand.
    pub fn run_now(
        table: impl Into<String>,
        connector_id: impl Into<String>,
        mode: SyncMode,
    ) -> Self {
        Self {
            workflow_kind: WorkflowKind::CopyTable,
            kind: RunKind::RunNow,
            table: table.into(),
            connector_id: connector_id.into(),
            mode,
            last_sync_time: None,
            schedule_id: None,
            retry_of: None,
        }
    }

    fn run_id(&self, now: DateTime<Utc>) -> RunId {
        match (self.kind, &self.retry_of) {
            (RunKind::RunNow, _) => RunId::run_now(self.workflow_kind, &self.table, now),
            (RunKind::Scheduled, _) => RunId::scheduled(&self.table, now),
            (RunKind::Retry, Some(original)) => RunId::retry(original, now),
            (RunKind::Retry, None) => RunId::run_now(self.workflow_kind, &self.table, now),
        }
    }
}

/// Starts, cancels and recovers runs.
///
/// The engine is the only component that spawns run workers. It is built once at process start
/// and handed to the schedule manager, the schedule trigger and the run registry.
#[derive(Debug, Clone)]
pub struct Engine<S, E> {
    config: Arc<EngineConfig>,
    store: S,
    executor: E,
    pool: RunWorkerPool,
    shutdown_tx: ShutdownTx,
    run_permit: Arc<Semaphore>,
    /// Serializes the overlap check with the insertion of the new run.
    start_lock: Arc<Mutex<()>>,
}

impl<S, E> Engine<S, E>
where
    S: RunStore + Clone + Send + Sync + 'static,
    E: StepExecutor + Clone + Send + Sync + 'static,
{
    pub fn new(config: EngineConfig, store: S, executor: E) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();
        let run_permit = Arc::new(Semaphore::new(config.max_concurrent_runs as usize));

        Self {
            config: Arc::new(config),
            store,
            executor,
            pool: RunWorkerPool::new(),
            shutdown_tx,
            run_permit,
            start_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Persists a new run and spawns its worker.
    pub async fn start_run(&self, request: StartRun) -> SyncResult<RunId> {
        if self.shutdown_tx.subscribe().is_shutdown() {
            bail!(
                ErrorKind::InvalidState,
                "Engine is shutting down",
                "no new runs are accepted"
            );
        }

        let _guard = self.start_lock.lock().await;

        if self.config.overlap_policy == OverlapPolicy::SkipIfRunning {
            let filter = RunFilter {
                table: Some(request.table.clone()),
                connector_id: Some(request.connector_id.clone()),
                ..RunFilter::running()
            };
            if let Some(active) = self.store.list_runs(&filter).await?.first() {
                return Err(sync_error!(
                    ErrorKind::RunAlreadyActive,
                    "A run for this table is already running",
                    format!(
                        "run {} is running for table {} of connector {}",
                        active.id, request.table, request.connector_id
                    )
                ));
            }
        }

        let now = Utc::now();
        let run_id = request.run_id(now);
        let record = RunRecord::new(
            run_id.clone(),
            RunAttributes {
                workflow_kind: request.workflow_kind,
                kind: request.kind,
                table: request.table.clone(),
                connector_id: request.connector_id.clone(),
                schedule_id: request.schedule_id,
                retry_of: request.retry_of,
            },
            CopyTableParams {
                table: request.table,
                connector_id: request.connector_id,
                mode: request.mode,
                last_sync_time: request.last_sync_time,
            },
            now,
        );

        self.store.insert_run(record.clone()).await?;

        info!(
            %run_id,
            table = %record.attributes.table,
            connector_id = %record.attributes.connector_id,
            kind = %record.attributes.kind,
            mode = %record.params.mode,
            "starting run",
        );
        counter!(
            SYNCLOOP_RUNS_STARTED_TOTAL,
            RUN_KIND_LABEL => record.attributes.kind.as_str(),
            WORKFLOW_KIND_LABEL => record.attributes.workflow_kind.as_str(),
        )
        .increment(1);

        self.spawn_worker(record).await;

        Ok(run_id)
    }

    /// Requests cancellation of a run.
    ///
    /// Returns `false` if the run already finished. The request is persisted first so it
    /// survives a restart, then delivered to the worker if the run is active in this process.
    pub async fn cancel_run(&self, run_id: &RunId) -> SyncResult<bool> {
        if !self.store.request_cancel(run_id).await? {
            info!(%run_id, "run already finished, nothing to cancel");
            return Ok(false);
        }

        let signalled = self.pool.lock().await.cancel_active_worker(run_id);
        info!(%run_id, signalled, "run cancellation requested");

        Ok(true)
    }

    /// Returns the current phase of a run.
    ///
    /// Answered from the worker when the run is active here, from the store otherwise.
    pub async fn current_phase(&self, run_id: &RunId) -> SyncResult<SyncRunPhase> {
        let state = self.pool.lock().await.get_active_worker_state(run_id);
        if let Some(state) = state {
            return Ok(state.lock().await.phase());
        }

        Ok(self.load_run(run_id).await?.phase)
    }

    /// Waits until a run settles and returns its stored record.
    ///
    /// A run settles when it reaches a terminal phase or its worker stops, for example because
    /// of a shutdown.
    pub async fn wait_for_run(&self, run_id: &RunId) -> SyncResult<RunRecord> {
        let state = self.pool.lock().await.get_worker_state(run_id);
        if let Some(state) = state {
            state.wait_until_settled(self.shutdown_tx.subscribe()).await;
        }

        self.load_run(run_id).await
    }

    /// Spawns a worker for every stored run that is still running.
    ///
    /// Returns the number of runs that were resumed.
    pub async fn recover(&self) -> SyncResult<usize> {
        let runs = self.store.list_runs(&RunFilter::running()).await?;

        let mut recovered = 0;
        for record in runs {
            if self.pool.lock().await.has_active_worker(&record.id) {
                continue;
            }

            info!(run_id = %record.id, phase = %record.phase, "recovering run");
            if self.spawn_worker(record).await {
                recovered += 1;
            }
        }

        info!(recovered, "run recovery finished");

        Ok(recovered)
    }

    /// Returns the ids of the runs with a live worker in this process.
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.pool.lock().await.active_run_ids()
    }

    /// Signals shutdown to every worker.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.shutdown() {
            warn!("engine shutdown was already requested");
        }
    }

    /// Waits for every worker to stop.
    pub async fn wait(&self) -> SyncResult<()> {
        self.pool.wait_all().await
    }

    pub async fn shutdown_and_wait(&self) -> SyncResult<()> {
        self.shutdown();
        self.wait().await
    }

    async fn load_run(&self, run_id: &RunId) -> SyncResult<RunRecord> {
        self.store.get_run(run_id).await?.ok_or_else(|| {
            sync_error!(ErrorKind::RunNotFound, "Run not found", run_id.as_str())
        })
    }

    async fn spawn_worker(&self, record: RunRecord) -> bool {
        let worker = RunWorker::new(
            self.config.clone(),
            record,
            self.store.clone(),
            self.executor.clone(),
            self.shutdown_tx.subscribe(),
            self.run_permit.clone(),
        );

        worker.spawn_into_pool(&self.pool).await
    }
}

