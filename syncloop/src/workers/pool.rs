use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

use crate::concurrency::cancel::CancelTx;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sync_error;
use crate::types::RunId;
use crate::workers::run::{RunWorkerHandle, RunWorkerState};

/// Internal state of [`RunWorkerPool`].
#[derive(Debug)]
pub struct RunWorkerPoolInner {
    /// Workers indexed by run id. Finished workers stay until the next reap.
    workers: HashMap<RunId, RunWorkerHandle>,
    join_set: JoinSet<(RunId, SyncResult<()>)>,
}

impl RunWorkerPoolInner {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            join_set: JoinSet::new(),
        }
    }

    /// Spawns a worker for `run_id`.
    ///
    /// Returns `false` without spawning if a worker for the run is still running.
    pub fn spawn<F>(
        &mut self,
        run_id: RunId,
        state: RunWorkerState,
        cancel_tx: CancelTx,
        future: F,
    ) -> bool
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        self.reap_finished();

        if let Entry::Occupied(entry) = self.workers.entry(run_id.clone()) {
            if !entry.get().is_finished() {
                warn!(%run_id, "worker already exists in pool and is still running");
                return false;
            }

            entry.remove();
            debug!(%run_id, "replacing finished worker in pool");
        }

        let task_run_id = run_id.clone();
        let abort_handle = self.join_set.spawn(async move {
            let result = future.await;
            (task_run_id, result)
        });

        self.workers.insert(
            run_id.clone(),
            RunWorkerHandle::new(state, cancel_tx, abort_handle),
        );
        debug!(%run_id, "spawned worker in pool");

        true
    }

    /// Returns the state of the worker of `run_id`, including a worker that finished but was not
    /// reaped yet.
    pub fn get_worker_state(&self, run_id: &RunId) -> Option<RunWorkerState> {
        self.workers.get(run_id).map(RunWorkerHandle::state)
    }

    /// Returns the state of the worker of `run_id` while it is still running.
    pub fn get_active_worker_state(&self, run_id: &RunId) -> Option<RunWorkerState> {
        let handle = self.workers.get(run_id)?;
        if handle.is_finished() {
            return None;
        }

        Some(handle.state())
    }

    pub fn has_active_worker(&self, run_id: &RunId) -> bool {
        self.workers
            .get(run_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signals cancellation to the worker of `run_id`, if it is still running.
    pub fn cancel_active_worker(&self, run_id: &RunId) -> bool {
        match self.workers.get(run_id) {
            Some(handle) if !handle.is_finished() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn active_run_ids(&self) -> Vec<RunId> {
        self.workers
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(run_id, _)| run_id.clone())
            .collect()
    }

    /// Collects the results of finished workers and drops their handles, so neither the join
    /// set nor the worker map grows with every run ever started.
    fn reap_finished(&mut self) {
        while let Some(result) = self.join_set.try_join_next() {
            if let Some((run_id, Err(err))) = handle_join_result(result) {
                error!(%run_id, error = %err, "worker completed with error");
            }
        }

        self.evict_finished();
    }

    fn evict_finished(&mut self) {
        self.workers.retain(|run_id, handle| {
            let finished = handle.is_finished();
            if finished {
                debug!(%run_id, "removing finished worker from pool");
            }

            !finished
        });
    }
}

/// Tracks every run worker spawned by the engine.
#[derive(Debug, Clone)]
pub struct RunWorkerPool {
    inner: Arc<Mutex<RunWorkerPoolInner>>,
}

impl RunWorkerPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunWorkerPoolInner::new())),
        }
    }

    /// Waits for every spawned worker to finish and returns the errors they produced.
    ///
    /// The pool lock is only held while polling for finished workers, so workers can still be
    /// spawned while waiting.
    pub async fn wait_all(&self) -> SyncResult<()> {
        let mut errors = Vec::new();

        loop {
            let result = {
                let mut inner = self.inner.lock().await;
                if inner.join_set.is_empty() {
                    break;
                }

                let result = tokio::select! {
                    result = inner.join_set.join_next() => result,
                    _ = tokio::time::sleep(WAIT_ALL_POLL_INTERVAL) => continue,
                };
                inner.evict_finished();

                result
            };

            let Some(result) = result else {
                break;
            };

            let Some((run_id, worker_result)) = handle_join_result(result) else {
                continue;
            };

            if let Err(err) = worker_result {
                error!(%run_id, error = %err, "worker completed with error");
                errors.push(err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

/// How long [`RunWorkerPool::wait_all`] holds the pool lock while waiting for a worker.
const WAIT_ALL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

fn handle_join_result(
    result: Result<(RunId, SyncResult<()>), JoinError>,
) -> Option<(RunId, SyncResult<()>)> {
    match result {
        Ok(result) => Some(result),
        Err(join_err) if join_err.is_cancelled() => {
            debug!("worker task was cancelled");
            None
        }
        Err(join_err) => {
            let err: SyncError = sync_error!(
                ErrorKind::RunWorkerPanic,
                "Run worker panicked",
                join_err
            );
            error!(error = %err, "worker panicked");
            Some((RunId::new("unknown"), Err(err)))
        }
    }
}

impl Default for RunWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for RunWorkerPool {
    type Target = Mutex<RunWorkerPoolInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::cancel::create_cancel_channel;
    use crate::state::run::SyncRunPhase;

    fn state(run_id: &RunId) -> RunWorkerState {
        RunWorkerState::new(run_id.clone(), SyncRunPhase::Starting)
    }

    #[tokio::test]
    async fn running_worker_is_not_replaced() {
        let pool = RunWorkerPool::new();
        let run_id = RunId::new("run-1");
        let (cancel_tx, mut cancel_rx) = create_cancel_channel();

        let spawned = pool.lock().await.spawn(
            run_id.clone(),
            state(&run_id),
            cancel_tx.clone(),
            async move {
                cancel_rx.wait_for_cancel().await;
                Ok(())
            },
        );
        assert!(spawned);

        let (other_tx, _) = create_cancel_channel();
        let spawned_again =
            pool.lock()
                .await
                .spawn(run_id.clone(), state(&run_id), other_tx, async { Ok(()) });
        assert!(!spawned_again);

        assert!(pool.lock().await.has_active_worker(&run_id));
        assert!(pool.lock().await.cancel_active_worker(&run_id));

        pool.wait_all().await.unwrap();
        assert!(!pool.lock().await.has_active_worker(&run_id));
        assert!(pool.lock().await.get_worker_state(&run_id).is_none());
    }

    #[tokio::test]
    async fn finished_workers_are_removed_from_the_pool() {
        let pool = RunWorkerPool::new();

        for i in 0..50 {
            let run_id = RunId::new(format!("run-{i}"));
            let (cancel_tx, _) = create_cancel_channel();
            pool.lock()
                .await
                .spawn(run_id.clone(), state(&run_id), cancel_tx, async { Ok(()) });
        }
        pool.wait_all().await.unwrap();

        let run_id = RunId::new("run-50");
        let (cancel_tx, mut cancel_rx) = create_cancel_channel();
        pool.lock().await.spawn(
            run_id.clone(),
            state(&run_id),
            cancel_tx.clone(),
            async move {
                cancel_rx.wait_for_cancel().await;
                Ok(())
            },
        );

        {
            let inner = pool.lock().await;
            assert_eq!(inner.workers.len(), 1);
            assert_eq!(inner.active_run_ids(), vec![run_id.clone()]);
        }

        cancel_tx.cancel();
        pool.wait_all().await.unwrap();
        assert!(pool.lock().await.workers.is_empty());
    }

    #[tokio::test]
    async fn wait_all_collects_worker_errors() {
        let pool = RunWorkerPool::new();

        for id in ["run-1", "run-2"] {
            let run_id = RunId::new(id);
            let (cancel_tx, _) = create_cancel_channel();
            pool.lock()
                .await
                .spawn(run_id.clone(), state(&run_id), cancel_tx, async {
                    Err(sync_error!(ErrorKind::StoreQueryFailed, "store down"))
                });
        }

        let err = pool.wait_all().await.unwrap_err();
        assert_eq!(err.kinds().len(), 2);
    }
}
