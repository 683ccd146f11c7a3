use std::future::Future;

use crate::error::SyncResult;
use crate::state::schedule::ScheduleConfig;
use crate::types::ScheduleId;

/// Durable storage of schedules.
pub trait ScheduleStore {
    /// Inserts a new schedule.
    ///
    /// Returns `false` without modifying anything if the id is already taken.
    fn insert_schedule(
        &self,
        schedule: ScheduleConfig,
    ) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Returns the schedule with id `schedule_id`, if any.
    fn get_schedule(
        &self,
        schedule_id: &ScheduleId,
    ) -> impl Future<Output = SyncResult<Option<ScheduleConfig>>> + Send;

    /// Returns the ids of every stored schedule.
    fn list_schedule_ids(&self) -> impl Future<Output = SyncResult<Vec<ScheduleId>>> + Send;

    /// Replaces a stored schedule.
    ///
    /// Fails with [`crate::error::ErrorKind::ScheduleNotFound`] if it does not exist.
    fn update_schedule(
        &self,
        schedule: &ScheduleConfig,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Deletes a schedule, returning `false` if it did not exist.
    fn delete_schedule(
        &self,
        schedule_id: &ScheduleId,
    ) -> impl Future<Output = SyncResult<bool>> + Send;
}
