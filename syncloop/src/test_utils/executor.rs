use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, Semaphore};

use crate::error::{ErrorKind, SyncResult};
use crate::executor::memory::MemoryExecutor;
use crate::executor::{
    ExtractParams, ExtractResult, LastSyncInfo, LastSyncTimeParams, LoadParams, LoadResult,
    StepExecutor, TransformParams, TransformResult, UpdateLastSyncTimeParams,
};
use crate::sync_error;
use crate::test_utils::notify::TimedNotify;
use crate::types::StepKind;

#[derive(Debug)]
struct ScriptedFailure {
    kind: ErrorKind,
    message: String,
    /// Remaining invocations that fail, `None` for every invocation.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<StepKind>,
    extract_params: Vec<ExtractParams>,
    failures: HashMap<StepKind, ScriptedFailure>,
    gates: HashMap<StepKind, Arc<Semaphore>>,
    panics: HashSet<StepKind>,
    call_conditions: Vec<(StepKind, u32, Arc<Notify>)>,
}

impl Inner {
    fn check_conditions(&mut self) {
        let calls = &self.calls;
        self.call_conditions.retain(|(step, expected, notify)| {
            let count = calls.iter().filter(|call| *call == step).count() as u32;
            let should_retain = count < *expected;
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });
    }
}

/// Step executor for tests that delegates to a [`MemoryExecutor`] and can be scripted.
///
/// Steps can be made to fail a number of times or forever, to panic, and can be blocked until
/// released so a test can act while a run is parked inside a step. Every invocation is recorded,
/// including the ones that fail, together with the parameters of every extract.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    executor: MemoryExecutor,
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedExecutor {
    pub fn new(executor: MemoryExecutor) -> Self {
        Self {
            executor,
            inner: Arc::default(),
        }
    }

    /// Returns the wrapped executor, for seeding source rows and inspecting the destination.
    pub fn executor(&self) -> &MemoryExecutor {
        &self.executor
    }

    /// Makes the next `times` invocations of `step` fail with an error of `kind`.
    pub async fn fail_step(&self, step: StepKind, kind: ErrorKind, message: &str, times: u32) {
        let mut inner = self.inner.lock().await;
        inner.failures.insert(
            step,
            ScriptedFailure {
                kind,
                message: message.to_owned(),
                remaining: Some(times),
            },
        );
    }

    /// Makes every invocation of `step` fail with an error of `kind`.
    pub async fn fail_step_always(&self, step: StepKind, kind: ErrorKind, message: &str) {
        let mut inner = self.inner.lock().await;
        inner.failures.insert(
            step,
            ScriptedFailure {
                kind,
                message: message.to_owned(),
                remaining: None,
            },
        );
    }

    /// Makes every invocation of `step` panic.
    pub async fn panic_on_step(&self, step: StepKind) {
        let mut inner = self.inner.lock().await;
        inner.panics.insert(step);
    }

    /// Makes invocations of `step` wait until [`ScriptedExecutor::release_step`] is called.
    pub async fn block_step(&self, step: StepKind) {
        let mut inner = self.inner.lock().await;
        inner.gates.insert(step, Arc::new(Semaphore::new(0)));
    }

    /// Lets blocked and future invocations of `step` through.
    pub async fn release_step(&self, step: StepKind) {
        let mut inner = self.inner.lock().await;
        if let Some(gate) = inner.gates.remove(&step) {
            gate.close();
        }
    }

    /// Returns a notification that fires once `step` was invoked `times` times in total.
    pub async fn notify_on_step_calls(&self, step: StepKind, times: u32) -> TimedNotify {
        let notify = Arc::new(Notify::new());

        let mut inner = self.inner.lock().await;
        inner.call_conditions.push((step, times, notify.clone()));
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Returns every invocation in order.
    pub async fn calls(&self) -> Vec<StepKind> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns the parameters of every extract invocation in order.
    pub async fn extract_params(&self) -> Vec<ExtractParams> {
        self.inner.lock().await.extract_params.clone()
    }

    pub async fn call_count(&self, step: StepKind) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| **call == step)
            .count()
    }

    /// Records an invocation of `step` and applies its script.
    async fn invoke(&self, step: StepKind) -> SyncResult<()> {
        let (failure, gate, panics) = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(step);
            inner.check_conditions();

            let failure = match inner.failures.get_mut(&step) {
                Some(failure) => match failure.remaining {
                    None => Some(sync_error!(
                        failure.kind,
                        "Scripted step failure",
                        failure.message.clone()
                    )),
                    Some(0) => None,
                    Some(remaining) => {
                        failure.remaining = Some(remaining - 1);
                        Some(sync_error!(
                            failure.kind,
                            "Scripted step failure",
                            failure.message.clone()
                        ))
                    }
                },
                None => None,
            };

            (
                failure,
                inner.gates.get(&step).cloned(),
                inner.panics.contains(&step),
            )
        };

        if panics {
            panic!("scripted panic in {step}");
        }

        if let Some(gate) = gate {
            // The gate is closed on release, which wakes every waiter with an error.
            let _ = gate.acquire().await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl StepExecutor for ScriptedExecutor {
    async fn get_last_sync_time(&self, params: LastSyncTimeParams) -> SyncResult<LastSyncInfo> {
        self.invoke(StepKind::GetLastSyncTime).await?;
        self.executor.get_last_sync_time(params).await
    }

    async fn extract(&self, params: ExtractParams) -> SyncResult<ExtractResult> {
        self.inner.lock().await.extract_params.push(params.clone());
        self.invoke(StepKind::Extract).await?;
        self.executor.extract(params).await
    }

    async fn transform(&self, params: TransformParams) -> SyncResult<TransformResult> {
        self.invoke(StepKind::Transform).await?;
        self.executor.transform(params).await
    }

    async fn load(&self, params: LoadParams) -> SyncResult<LoadResult> {
        self.invoke(StepKind::Load).await?;
        self.executor.load(params).await
    }

    async fn update_last_sync_time(&self, params: UpdateLastSyncTimeParams) -> SyncResult<()> {
        self.invoke(StepKind::UpdateLastSyncTime).await?;
        self.executor.update_last_sync_time(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let executor = ScriptedExecutor::default();
        executor
            .fail_step(StepKind::Load, ErrorKind::DestinationError, "disk full", 2)
            .await;

        assert!(executor.invoke(StepKind::Load).await.is_err());
        assert!(executor.invoke(StepKind::Load).await.is_err());
        assert!(executor.invoke(StepKind::Load).await.is_ok());
        assert_eq!(executor.call_count(StepKind::Load).await, 3);
    }

    #[tokio::test]
    async fn blocked_step_waits_for_release() {
        let executor = ScriptedExecutor::default();
        executor.block_step(StepKind::Extract).await;
        let called = executor.notify_on_step_calls(StepKind::Extract, 1).await;

        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.invoke(StepKind::Extract).await }
        });

        called.notified().await;
        assert!(!task.is_finished());

        executor.release_step(StepKind::Extract).await;
        assert!(task.await.unwrap().is_ok());
    }
}
