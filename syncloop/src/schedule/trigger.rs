use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::engine::{Engine, StartRun};
use crate::error::{ErrorKind, SyncResult};
use crate::executor::StepExecutor;
use crate::metrics::{OUTCOME_LABEL, SYNCLOOP_SCHEDULE_FIRES_TOTAL};
use crate::schedule::manager::ScheduleManager;
use crate::store::run::RunStore;
use crate::store::schedule::ScheduleStore;
use crate::sync_error;
use crate::types::{RunKind, ScheduleId, WorkflowKind};

/// Handle of a running [`ScheduleTrigger`].
#[derive(Debug)]
pub struct ScheduleTriggerHandle {
    handle: Option<JoinHandle<SyncResult<()>>>,
}

impl ScheduleTriggerHandle {
    /// Waits for the trigger to stop, which happens on shutdown.
    pub async fn wait(mut self) -> SyncResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            sync_error!(
                ErrorKind::ScheduleTriggerPanic,
                "Schedule trigger panicked",
                err
            )
        })??;

        Ok(())
    }
}

/// Background task firing due schedules.
///
/// Every poll loads the stored schedules and starts a scheduled incremental run for each active
/// schedule whose next firing time has passed. Firings missed while the process was down are
/// collapsed into a single run.
#[derive(Debug)]
pub struct ScheduleTrigger<S, E> {
    engine: Engine<S, E>,
    schedules: ScheduleManager<S>,
    poll_interval: Duration,
    shutdown_rx: ShutdownRx,
}

impl<S, E> ScheduleTrigger<S, E>
where
    S: RunStore + ScheduleStore + Clone + Send + Sync + 'static,
    E: StepExecutor + Clone + Send + Sync + 'static,
{
    /// Creates a trigger sharing `schedules` with the control surface, so firings and schedule
    /// mutations never overwrite each other.
    pub fn new(engine: Engine<S, E>, schedules: ScheduleManager<S>) -> Self {
        let poll_interval = Duration::from_millis(engine.config().schedule_poll_interval_ms);
        let shutdown_rx = engine.shutdown_tx().subscribe();

        Self {
            engine,
            schedules,
            poll_interval,
            shutdown_rx,
        }
    }

    pub fn start(self) -> ScheduleTriggerHandle {
        info!(poll_interval = ?self.poll_interval, "starting schedule trigger");

        let span = tracing::info_span!("schedule_trigger");
        let handle = tokio::spawn(self.run().instrument(span));

        ScheduleTriggerHandle {
            handle: Some(handle),
        }
    }

    async fn run(mut self) -> SyncResult<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("shutting down schedule trigger");
                    return Ok(());
                }

                _ = interval.tick() => {}
            }

            if let Err(err) = self.fire_due(Utc::now()).await {
                error!(error = %err, "failed to fire due schedules");
            }
        }
    }

    /// Fires every schedule due at `now` and returns the number of runs started.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> SyncResult<usize> {
        let mut started = 0;
        for schedule_id in self.engine.store().list_schedule_ids().await? {
            match self.fire(&schedule_id, now).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) => warn!(%schedule_id, error = %err, "failed to fire schedule"),
            }
        }

        Ok(started)
    }

    async fn fire(&self, schedule_id: &ScheduleId, now: DateTime<Utc>) -> SyncResult<bool> {
        // The next firing time is persisted before the run starts so a crash in between skips a
        // firing instead of repeating it.
        let Some(schedule) = self.schedules.advance_due(schedule_id, now).await? else {
            return Ok(false);
        };

        let request = StartRun {
            workflow_kind: WorkflowKind::CopyTable,
            kind: RunKind::Scheduled,
            table: schedule.table,
            connector_id: schedule.connector_id,
            mode: schedule.mode,
            last_sync_time: None,
            schedule_id: Some(schedule.id),
            retry_of: None,
        };

        let run_id = match self.engine.start_run(request).await {
            Ok(run_id) => run_id,
            Err(err) if err.kind() == ErrorKind::RunAlreadyActive => {
                info!(%schedule_id, error = %err, "previous run still active, skipping firing");
                counter!(SYNCLOOP_SCHEDULE_FIRES_TOTAL, OUTCOME_LABEL => "skipped").increment(1);

                return Ok(false);
            }
            Err(err) => {
                counter!(SYNCLOOP_SCHEDULE_FIRES_TOTAL, OUTCOME_LABEL => "failed").increment(1);

                return Err(err);
            }
        };

        debug!(%schedule_id, %run_id, "schedule fired");
        counter!(SYNCLOOP_SCHEDULE_FIRES_TOTAL, OUTCOME_LABEL => "started").increment(1);

        self.schedules.record_run(schedule_id, now, run_id).await?;

        Ok(true)
    }
}
