use std::future::Future;

use crate::error::SyncResult;
use crate::state::history::{HistoryEvent, RunEvent};
use crate::state::run::{RunFilter, RunRecord};
use crate::types::RunId;

/// Durable storage of run records and their histories.
///
/// Implementations must be safe to share between the engine, run workers and the control
/// surface. Each run's history has a single writer, the worker executing the run.
pub trait RunStore {
    /// Inserts a new run record.
    ///
    /// Fails with [`crate::error::ErrorKind::InvalidState`] if a run with the same id exists.
    fn insert_run(&self, record: RunRecord) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns the run with id `run_id`, if any.
    fn get_run(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = SyncResult<Option<RunRecord>>> + Send;

    /// Returns the runs matching `filter`, most recently started first.
    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl Future<Output = SyncResult<Vec<RunRecord>>> + Send;

    /// Replaces a stored run record.
    ///
    /// The stored `cancel_requested` flag is never cleared by an update, so a cancellation
    /// requested concurrently with the update is not lost.
    fn update_run(&self, record: &RunRecord) -> impl Future<Output = SyncResult<()>> + Send;

    /// Marks a run as cancel requested.
    ///
    /// Returns `false` if the run has already finished. Fails with
    /// [`crate::error::ErrorKind::RunNotFound`] for unknown runs.
    fn request_cancel(&self, run_id: &RunId) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Appends an event to the history of a run and returns the recorded entry.
    fn append_event(
        &self,
        run_id: &RunId,
        event: RunEvent,
    ) -> impl Future<Output = SyncResult<HistoryEvent>> + Send;

    /// Returns the full history of a run in order.
    fn get_events(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = SyncResult<Vec<HistoryEvent>>> + Send;

    /// Deletes runs together with their histories and returns how many were deleted.
    fn delete_runs(&self, run_ids: &[RunId]) -> impl Future<Output = SyncResult<u64>> + Send;
}
