use std::any::Any;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, gauge};
use syncloop_config::shared::EngineConfig;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, info};

use crate::concurrency::cancel::{CancelRx, CancelTx, create_cancel_channel};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, SyncResult};
use crate::executor::StepExecutor;
use crate::metrics::{
    OUTCOME_LABEL, RETRY_DIRECTIVE_LABEL, STEP_LABEL, SYNCLOOP_ACTIVE_RUNS,
    SYNCLOOP_RUNS_FINISHED_TOTAL,
};
use crate::state::run::{RunRecord, SyncRunPhase};
use crate::store::run::RunStore;
use crate::sync_error;
use crate::types::RunId;
use crate::workers::policy::build_error_handling_policy;
use crate::workers::pool::RunWorkerPool;
use crate::workflow::copy_table::{CopyTableResult, CopyTableWorkflow};
use crate::workflow::retry::RetryPolicy;

/// Internal state of [`RunWorkerState`].
#[derive(Debug)]
pub struct RunWorkerStateInner {
    run_id: RunId,
    /// Current phase, mirrors the phase persisted in the run store.
    phase: SyncRunPhase,
    /// Set once the worker task stopped, whatever the reason.
    exited: bool,
    phase_change: Arc<Notify>,
}

impl RunWorkerStateInner {
    /// Updates the phase of the run and wakes every waiter.
    pub fn set(&mut self, phase: SyncRunPhase) {
        info!(
            run_id = %self.run_id,
            from_phase = %self.phase,
            to_phase = %phase,
            "run phase changing",
        );

        self.phase = phase;

        // Only current waiters are woken, no permit is stored for future ones.
        self.phase_change.notify_waiters();
    }

    fn mark_exited(&mut self) {
        self.exited = true;
        self.phase_change.notify_waiters();
    }

    pub fn phase(&self) -> SyncRunPhase {
        self.phase
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }
}

/// Shared, queryable state of a run worker.
///
/// Answers the run's current phase without touching the store and lets callers wait for the run
/// to settle.
#[derive(Debug, Clone)]
pub struct RunWorkerState {
    inner: Arc<Mutex<RunWorkerStateInner>>,
}

impl RunWorkerState {
    pub fn new(run_id: RunId, phase: SyncRunPhase) -> Self {
        let inner = RunWorkerStateInner {
            run_id,
            phase,
            exited: false,
            phase_change: Arc::new(Notify::new()),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Waits until the run reaches a terminal phase or its worker exits.
    ///
    /// Returns the last observed phase, or `None` if shutdown was signalled first.
    pub async fn wait_until_settled(&self, mut shutdown_rx: ShutdownRx) -> Option<SyncRunPhase> {
        loop {
            let inner = self.inner.lock().await;

            if inner.phase.is_terminal() || inner.exited {
                return Some(inner.phase);
            }

            // The notified future is created while the lock is held so a change made right after
            // the lock is released is not missed.
            let phase_change = inner.phase_change.clone();
            let phase_change_notified = phase_change.notified();

            drop(inner);

            tokio::select! {
                biased;

                _ = shutdown_rx.wait_for_shutdown() => {
                    return None;
                }

                _ = phase_change_notified => {}
            }
        }
    }
}

impl Deref for RunWorkerState {
    type Target = Mutex<RunWorkerStateInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Handle kept by the pool for every spawned run worker.
#[derive(Debug)]
pub struct RunWorkerHandle {
    state: RunWorkerState,
    cancel_tx: CancelTx,
    abort_handle: AbortHandle,
}

impl RunWorkerHandle {
    pub fn new(state: RunWorkerState, cancel_tx: CancelTx, abort_handle: AbortHandle) -> Self {
        Self {
            state,
            cancel_tx,
            abort_handle,
        }
    }

    pub fn state(&self) -> RunWorkerState {
        self.state.clone()
    }

    /// Delivers the cancellation signal to the worker.
    pub fn cancel(&self) -> bool {
        self.cancel_tx.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished()
    }
}

/// Executes one run in the background.
///
/// Store failures that prevent the workflow from recording progress are retried with the engine
/// retry policy. Replay makes this safe: completed steps are not executed again.
#[derive(Debug)]
pub struct RunWorker<S, E> {
    config: Arc<EngineConfig>,
    record: RunRecord,
    store: S,
    executor: E,
    shutdown_rx: ShutdownRx,
    run_permit: Arc<Semaphore>,
}

impl<S, E> RunWorker<S, E> {
    pub fn new(
        config: Arc<EngineConfig>,
        record: RunRecord,
        store: S,
        executor: E,
        shutdown_rx: ShutdownRx,
        run_permit: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            record,
            store,
            executor,
            shutdown_rx,
            run_permit,
        }
    }
}

impl<S, E> RunWorker<S, E>
where
    S: RunStore + Clone + Send + Sync + 'static,
    E: StepExecutor + Clone + Send + Sync + 'static,
{
    /// Spawns the worker into `pool`.
    ///
    /// Returns `false` if a worker for the same run is still active.
    pub async fn spawn_into_pool(self, pool: &RunWorkerPool) -> bool {
        let run_id = self.record.id.clone();
        let attributes = &self.record.attributes;

        let span = tracing::info_span!(
            "sync_run",
            run_id = %run_id,
            table = %attributes.table,
            connector_id = %attributes.connector_id,
            kind = %attributes.kind,
        );

        let state = RunWorkerState::new(run_id.clone(), self.record.phase);
        let (cancel_tx, cancel_rx) = create_cancel_channel();

        let fut = self
            .guarded_run(state.clone(), cancel_rx)
            .instrument(span);

        let mut pool = pool.lock().await;
        pool.spawn(run_id, state, cancel_tx, fut)
    }

    async fn guarded_run(self, state: RunWorkerState, cancel_rx: CancelRx) -> SyncResult<()> {
        let result = self.run_with_retries(&state, cancel_rx).await;

        let mut inner = state.lock().await;
        inner.mark_exited();

        result
    }

    async fn run_with_retries(
        mut self,
        state: &RunWorkerState,
        cancel_rx: CancelRx,
    ) -> SyncResult<()> {
        debug!("waiting to acquire a run permit");

        let run_permit = self.run_permit.clone();
        let _permit = tokio::select! {
            biased;

            _ = self.shutdown_rx.wait_for_shutdown() => {
                info!("shutting down run worker while waiting for a run permit");
                return Ok(());
            }

            permit = run_permit.acquire() => permit,
        };

        // A panic is turned into an error so the state is still marked exited and waiters are
        // released. The run stays `running` in the store and is resumed by the next recovery.
        gauge!(SYNCLOOP_ACTIVE_RUNS).increment(1.0);
        let result = AssertUnwindSafe(self.run_loop(state, cancel_rx))
            .catch_unwind()
            .await;
        gauge!(SYNCLOOP_ACTIVE_RUNS).decrement(1.0);

        match result {
            Ok(result) => result,
            Err(payload) => {
                let err = sync_error!(
                    ErrorKind::RunWorkerPanic,
                    "Run worker panicked",
                    panic_message(&*payload)
                );
                error!(error = %err, "run worker panicked");

                Err(err)
            }
        }
    }

    async fn run_loop(&mut self, state: &RunWorkerState, cancel_rx: CancelRx) -> SyncResult<()> {
        let retry = RetryPolicy::from(&self.config.retry);
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let mut attempt = 0;

        loop {
            let workflow = CopyTableWorkflow::new(
                self.record.id.clone(),
                self.store.clone(),
                self.executor.clone(),
                state.clone(),
                retry,
                step_timeout,
                cancel_rx.clone(),
                self.shutdown_rx.clone(),
            );

            let err = match workflow.run().await {
                Ok(result) => {
                    Self::report(&result);
                    return Ok(());
                }
                Err(err) => err,
            };

            attempt += 1;
            let policy = build_error_handling_policy(&err);
            error!(attempt, error = %err, "run worker failed");
            counter!(
                SYNCLOOP_RUNS_FINISHED_TOTAL,
                OUTCOME_LABEL => "worker_error",
                RETRY_DIRECTIVE_LABEL => policy.retry_directive().to_string(),
            )
            .increment(1);

            if !policy.should_retry() || !retry.has_attempts_left(attempt) {
                error!(
                    attempt,
                    "run worker gave up, the run stays running until it is recovered"
                );
                return Err(err);
            }

            let delay = retry.delay_for_attempt(attempt);
            info!(?delay, "restarting run worker");

            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("shutting down run worker while waiting to restart");
                    return Ok(());
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn report(result: &CopyTableResult) {
        match result {
            CopyTableResult::Completed(outcome) => info!(
                rows_processed = outcome.rows_processed,
                mode = %outcome.mode,
                no_data = outcome.no_data,
                watermark_updated = outcome.watermark_updated,
                "run completed",
            ),
            CopyTableResult::Failed(failure) => error!(
                step = %failure.step,
                error = %failure.message,
                "run failed",
            ),
            CopyTableResult::Cancelled => info!("run cancelled"),
            CopyTableResult::Interrupted => info!("run interrupted by shutdown"),
            CopyTableResult::AlreadyFinished => debug!("run was already finished"),
        }

        if let CopyTableResult::Failed(failure) = result {
            counter!(
                SYNCLOOP_RUNS_FINISHED_TOTAL,
                OUTCOME_LABEL => result.as_static_str(),
                STEP_LABEL => failure.step.as_str(),
            )
            .increment(1);
        } else {
            counter!(SYNCLOOP_RUNS_FINISHED_TOTAL, OUTCOME_LABEL => result.as_static_str())
                .increment(1);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
