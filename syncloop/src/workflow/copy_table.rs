use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::concurrency::cancel::CancelRx;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, SyncResult};
use crate::executor::{
    ExtractParams, LastSyncTimeParams, LoadParams, StepExecutor, TransformParams,
    UpdateLastSyncTimeParams,
};
use crate::metrics::{
    RETRY_DIRECTIVE_LABEL, STEP_LABEL, SYNCLOOP_STEP_ATTEMPTS_TOTAL, SYNCLOOP_STEP_FAILURES_TOTAL,
};
use crate::state::history::RunEvent;
use crate::state::run::{RunFailure, RunOutcome, RunRecord, SyncRunPhase};
use crate::store::run::RunStore;
use crate::sync_error;
use crate::types::{RunId, StepKind, SyncMode};
use crate::workers::policy::build_error_handling_policy;
use crate::workers::run::RunWorkerState;
use crate::workflow::journal::Journal;
use crate::workflow::retry::RetryPolicy;

/// How a copy table run ended from the point of view of the worker executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyTableResult {
    Completed(RunOutcome),
    Failed(RunFailure),
    Cancelled,
    /// The process is shutting down, the run stays `running` and is resumed on recovery.
    Interrupted,
    /// The run was already closed when the worker loaded it.
    AlreadyFinished,
}

impl CopyTableResult {
    /// Label used for the `outcome` metric label.
    pub fn as_static_str(&self) -> &'static str {
        match self {
            CopyTableResult::Completed(_) => "completed",
            CopyTableResult::Failed(_) => "failed",
            CopyTableResult::Cancelled => "cancelled",
            CopyTableResult::Interrupted => "interrupted",
            CopyTableResult::AlreadyFinished => "already_finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    Shutdown,
}

#[derive(Debug)]
enum StepOutcome<T> {
    Completed(T),
    Failed(StepFailure),
    Interrupted(Interruption),
}

#[derive(Debug)]
struct StepFailure {
    message: String,
    solution: Option<String>,
}

/// Everything the workflow needs besides the step executor.
#[derive(Debug)]
struct RunContext<S> {
    run_id: RunId,
    store: S,
    state: RunWorkerState,
    retry: RetryPolicy,
    step_timeout: Duration,
    cancel_rx: CancelRx,
    shutdown_rx: ShutdownRx,
    cancel_requested: bool,
}

impl<S> RunContext<S>
where
    S: RunStore,
{
    fn is_cancelled(&self) -> bool {
        self.cancel_requested || self.cancel_rx.is_cancelled()
    }

    async fn append(&self, journal: &mut Journal, event: RunEvent) -> SyncResult<()> {
        journal.record(&event);
        self.store.append_event(&self.run_id, event).await?;

        Ok(())
    }

    /// Moves the run to `phase`, persisting the change before exposing it in memory.
    async fn transition(
        &self,
        journal: &mut Journal,
        record: &mut RunRecord,
        phase: SyncRunPhase,
    ) -> SyncResult<()> {
        if record.phase == phase {
            return Ok(());
        }

        self.append(
            journal,
            RunEvent::PhaseChanged {
                from: record.phase,
                to: phase,
            },
        )
        .await?;

        record.set_phase(phase, chrono::Utc::now());
        self.store.update_run(record).await?;

        let mut state = self.state.lock().await;
        state.set(phase);

        Ok(())
    }

    /// Moves the run to the phase of `step` unless the step already settled in an earlier
    /// execution, so a resumed run never moves back to the phase of a replayed step.
    async fn enter_step(
        &self,
        journal: &mut Journal,
        record: &mut RunRecord,
        step: StepKind,
        phase: SyncRunPhase,
    ) -> SyncResult<()> {
        if journal.is_settled(step) {
            return Ok(());
        }

        self.transition(journal, record, phase).await
    }

    /// Executes `step` under the retry policy, or returns its journaled outcome.
    async fn execute<T, F, Fut>(
        &mut self,
        journal: &mut Journal,
        step: StepKind,
        mut invoke: F,
    ) -> SyncResult<StepOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if let Some(result) = journal.completed::<T>(step)? {
            debug!(run_id = %self.run_id, %step, "reusing journaled step result");
            return Ok(StepOutcome::Completed(result));
        }

        if let Some(error) = journal.failed(step) {
            debug!(run_id = %self.run_id, %step, "step already failed permanently");
            return Ok(StepOutcome::Failed(StepFailure {
                message: error.to_owned(),
                solution: None,
            }));
        }

        let mut attempt = journal.failed_attempts(step);
        loop {
            attempt = attempt.saturating_add(1);

            self.append(journal, RunEvent::StepScheduled { step, attempt })
                .await?;
            counter!(SYNCLOOP_STEP_ATTEMPTS_TOTAL, STEP_LABEL => step.as_str()).increment(1);

            let result = tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!(run_id = %self.run_id, %step, attempt, "shutting down while a step attempt is in flight");
                    return Ok(StepOutcome::Interrupted(Interruption::Shutdown));
                }

                result = tokio::time::timeout(self.step_timeout, invoke()) => result,
            };

            let err = match result {
                Ok(Ok(value)) => {
                    let result = serde_json::to_value(&value)?;
                    self.append(journal, RunEvent::StepCompleted { step, result })
                        .await?;

                    return Ok(StepOutcome::Completed(value));
                }
                Ok(Err(err)) => err,
                Err(_) => sync_error!(
                    ErrorKind::StepTimeout,
                    "Step attempt timed out",
                    format!("{step} did not finish within {:?}", self.step_timeout)
                ),
            };

            let policy = build_error_handling_policy(&err);
            let message = err.message();

            warn!(
                run_id = %self.run_id,
                %step,
                attempt,
                retry_directive = %policy.retry_directive(),
                error = %err,
                "step attempt failed",
            );
            counter!(
                SYNCLOOP_STEP_FAILURES_TOTAL,
                STEP_LABEL => step.as_str(),
                RETRY_DIRECTIVE_LABEL => policy.retry_directive().to_string(),
            )
            .increment(1);

            self.append(
                journal,
                RunEvent::StepAttemptFailed {
                    step,
                    attempt,
                    error: message.clone(),
                },
            )
            .await?;

            if !policy.should_retry() || !self.retry.has_attempts_left(attempt) {
                self.append(
                    journal,
                    RunEvent::StepFailed {
                        step,
                        error: message.clone(),
                    },
                )
                .await?;

                return Ok(StepOutcome::Failed(StepFailure {
                    message,
                    solution: policy.solution().map(str::to_owned),
                }));
            }

            let delay = self.retry.delay_for_attempt(attempt);
            info!(run_id = %self.run_id, %step, attempt, ?delay, "retrying step");

            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    return Ok(StepOutcome::Interrupted(Interruption::Shutdown));
                }

                _ = self.cancel_rx.wait_for_cancel() => {
                    return Ok(StepOutcome::Interrupted(Interruption::Cancelled));
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Drives one copy table run through the step executor.
///
/// The run's history is the source of truth: steps that already completed are not executed
/// again, so a run interrupted by a restart continues where it stopped.
#[derive(Debug)]
pub struct CopyTableWorkflow<S, E> {
    context: RunContext<S>,
    executor: E,
}

impl<S, E> CopyTableWorkflow<S, E>
where
    S: RunStore,
    E: StepExecutor,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        store: S,
        executor: E,
        state: RunWorkerState,
        retry: RetryPolicy,
        step_timeout: Duration,
        cancel_rx: CancelRx,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            context: RunContext {
                run_id,
                store,
                state,
                retry,
                step_timeout,
                cancel_rx,
                shutdown_rx,
                cancel_requested: false,
            },
            executor,
        }
    }

    pub async fn run(self) -> SyncResult<CopyTableResult> {
        let CopyTableWorkflow {
            mut context,
            executor,
        } = self;

        let Some(mut record) = context.store.get_run(&context.run_id).await? else {
            return Err(sync_error!(
                ErrorKind::RunNotFound,
                "Run not found",
                context.run_id.as_str()
            ));
        };

        if !record.is_running() {
            info!(run_id = %context.run_id, phase = %record.phase, "run already finished");
            return Ok(CopyTableResult::AlreadyFinished);
        }

        context.cancel_requested = record.cancel_requested;

        let history = context.store.get_events(&context.run_id).await?;
        let mut journal = Journal::from_history(&history);
        if !journal.is_started() {
            context
                .append(
                    &mut journal,
                    RunEvent::RunStarted {
                        params: record.params.clone(),
                    },
                )
                .await?;
        } else {
            info!(run_id = %context.run_id, phase = %record.phase, events = history.len(), "resuming run from history");
        }

        let result =
            Self::run_steps(&mut context, &executor, &mut journal, &mut record).await?;

        match result {
            StepOutcome::Completed(outcome) => {
                context
                    .append(
                        &mut journal,
                        RunEvent::RunCompleted {
                            outcome: outcome.clone(),
                        },
                    )
                    .await?;
                record.outcome = Some(outcome.clone());
                context
                    .transition(&mut journal, &mut record, SyncRunPhase::Completed)
                    .await?;

                Ok(CopyTableResult::Completed(outcome))
            }
            StepOutcome::Failed(_) => match record.failure.clone() {
                Some(failure) => Ok(CopyTableResult::Failed(failure)),
                None => Err(sync_error!(
                    ErrorKind::InvalidState,
                    "Failed run has no recorded failure",
                    context.run_id.as_str()
                )),
            },
            StepOutcome::Interrupted(Interruption::Cancelled) => {
                if !journal.is_cancel_recorded() {
                    context
                        .append(&mut journal, RunEvent::CancelRequested)
                        .await?;
                }
                context
                    .append(&mut journal, RunEvent::RunCancelled)
                    .await?;
                context
                    .transition(&mut journal, &mut record, SyncRunPhase::Cancelled)
                    .await?;

                Ok(CopyTableResult::Cancelled)
            }
            StepOutcome::Interrupted(Interruption::Shutdown) => Ok(CopyTableResult::Interrupted),
        }
    }

    /// Runs the steps in order and returns the outcome the run should be closed with.
    ///
    /// Permanent step failures are recorded here since only this function knows which step
    /// failed.
    async fn run_steps(
        context: &mut RunContext<S>,
        executor: &E,
        journal: &mut Journal,
        record: &mut RunRecord,
    ) -> SyncResult<StepOutcome<RunOutcome>> {
        let params = record.params.clone();
        let mut mode = params.mode;
        let mut last_sync_time = params.last_sync_time;

        if mode.is_incremental() && last_sync_time.is_none() {
            if context.is_cancelled() {
                return Ok(StepOutcome::Interrupted(Interruption::Cancelled));
            }
            context
                .enter_step(
                    journal,
                    record,
                    StepKind::GetLastSyncTime,
                    SyncRunPhase::FetchingLastSyncTime,
                )
                .await?;

            let step_params = LastSyncTimeParams {
                connector_id: params.connector_id.clone(),
                table: params.table.clone(),
            };
            let outcome = context
                .execute(journal, StepKind::GetLastSyncTime, || {
                    executor.get_last_sync_time(step_params.clone())
                })
                .await?;

            match outcome {
                StepOutcome::Completed(info) => last_sync_time = info.last_sync_time,
                StepOutcome::Failed(failure) => {
                    warn!(
                        run_id = %context.run_id,
                        error = %failure.message,
                        "failed to fetch the last sync time, continuing with a full sync",
                    );
                    mode = SyncMode::Full;
                }
                StepOutcome::Interrupted(interruption) => {
                    return Ok(StepOutcome::Interrupted(interruption));
                }
            }
        }

        if context.is_cancelled() {
            return Ok(StepOutcome::Interrupted(Interruption::Cancelled));
        }
        context
            .enter_step(journal, record, StepKind::Extract, SyncRunPhase::Extracting)
            .await?;

        let step_params = ExtractParams {
            table: params.table.clone(),
            connector_id: params.connector_id.clone(),
            mode,
            last_sync_time,
        };
        let extract = match context
            .execute(journal, StepKind::Extract, || {
                executor.extract(step_params.clone())
            })
            .await?
        {
            StepOutcome::Completed(extract) => extract,
            StepOutcome::Failed(failure) => {
                return Self::fail(context, journal, record, StepKind::Extract, failure).await;
            }
            StepOutcome::Interrupted(interruption) => {
                return Ok(StepOutcome::Interrupted(interruption));
            }
        };

        if extract.rows.is_empty() {
            info!(run_id = %context.run_id, table = %params.table, "no data to process");
            context
                .transition(journal, record, SyncRunPhase::NoDataToProcess)
                .await?;

            return Ok(StepOutcome::Completed(RunOutcome {
                rows_processed: 0,
                mode,
                no_data: true,
                watermark_updated: false,
            }));
        }

        if context.is_cancelled() {
            return Ok(StepOutcome::Interrupted(Interruption::Cancelled));
        }
        context
            .enter_step(
                journal,
                record,
                StepKind::Transform,
                SyncRunPhase::Transforming,
            )
            .await?;

        let step_params = TransformParams {
            table: params.table.clone(),
            rows: extract.rows.clone(),
        };
        let transform = match context
            .execute(journal, StepKind::Transform, || {
                executor.transform(step_params.clone())
            })
            .await?
        {
            StepOutcome::Completed(transform) => transform,
            StepOutcome::Failed(failure) => {
                return Self::fail(context, journal, record, StepKind::Transform, failure).await;
            }
            StepOutcome::Interrupted(interruption) => {
                return Ok(StepOutcome::Interrupted(interruption));
            }
        };

        if context.is_cancelled() {
            return Ok(StepOutcome::Interrupted(Interruption::Cancelled));
        }
        context
            .enter_step(journal, record, StepKind::Load, SyncRunPhase::Loading)
            .await?;

        let step_params = LoadParams {
            table: params.table.clone(),
            connector_id: params.connector_id.clone(),
            rows: transform.rows,
        };
        let load = match context
            .execute(journal, StepKind::Load, || executor.load(step_params.clone()))
            .await?
        {
            StepOutcome::Completed(load) => load,
            StepOutcome::Failed(failure) => {
                return Self::fail(context, journal, record, StepKind::Load, failure).await;
            }
            StepOutcome::Interrupted(interruption) => {
                return Ok(StepOutcome::Interrupted(interruption));
            }
        };

        let mut watermark_updated = false;
        let next_watermark = extract
            .max_timestamp
            .filter(|max_timestamp| last_sync_time.is_none_or(|current| *max_timestamp > current));

        if mode.is_incremental()
            && let Some(sync_time) = next_watermark
        {
            if context.is_cancelled() {
                return Ok(StepOutcome::Interrupted(Interruption::Cancelled));
            }
            context
                .enter_step(
                    journal,
                    record,
                    StepKind::UpdateLastSyncTime,
                    SyncRunPhase::UpdatingSyncTime,
                )
                .await?;

            let step_params = UpdateLastSyncTimeParams {
                connector_id: params.connector_id.clone(),
                table: params.table.clone(),
                sync_time,
            };
            match context
                .execute(journal, StepKind::UpdateLastSyncTime, || {
                    executor.update_last_sync_time(step_params.clone())
                })
                .await?
            {
                StepOutcome::Completed(()) => watermark_updated = true,
                StepOutcome::Failed(failure) => {
                    warn!(
                        run_id = %context.run_id,
                        error = %failure.message,
                        "failed to update the last sync time, the next run will copy these rows again",
                    );
                    context
                        .transition(journal, record, SyncRunPhase::SyncTimeUpdateFailed)
                        .await?;
                }
                StepOutcome::Interrupted(interruption) => {
                    return Ok(StepOutcome::Interrupted(interruption));
                }
            }
        } else if mode.is_incremental() {
            debug!(run_id = %context.run_id, "watermark unchanged, skipping last sync time update");
        }

        Ok(StepOutcome::Completed(RunOutcome {
            rows_processed: load.rows_processed,
            mode,
            no_data: false,
            watermark_updated,
        }))
    }

    async fn fail(
        context: &mut RunContext<S>,
        journal: &mut Journal,
        record: &mut RunRecord,
        step: StepKind,
        failure: StepFailure,
    ) -> SyncResult<StepOutcome<RunOutcome>> {
        let Some(phase) = SyncRunPhase::failed_for(step) else {
            return Err(sync_error!(
                ErrorKind::InvalidState,
                "Step failure cannot fail the run",
                step
            ));
        };

        let message = format!("{step} failed: {}", failure.message);
        context
            .append(
                journal,
                RunEvent::RunFailed {
                    phase,
                    error: message.clone(),
                },
            )
            .await?;

        record.failure = Some(RunFailure {
            step,
            message,
            solution: failure.solution.clone(),
        });
        context.transition(journal, record, phase).await?;

        Ok(StepOutcome::Failed(failure))
    }
}
