use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::types::{ConnectorId, Row, SyncMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncTimeParams {
    pub connector_id: ConnectorId,
    pub table: String,
}

/// The persisted watermark of a (connector, table) pair, `None` if it was never synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncInfo {
    pub last_sync_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractParams {
    pub table: String,
    pub connector_id: ConnectorId,
    pub mode: SyncMode,
    /// Rows at or before this instant are skipped in incremental mode.
    pub last_sync_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractResult {
    pub rows: Vec<Row>,
    pub row_count: u64,
    /// Largest change timestamp among the extracted rows, the next watermark candidate.
    pub max_timestamp: Option<DateTime<Utc>>,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformParams {
    pub table: String,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    pub rows: Vec<Row>,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadParams {
    pub table: String,
    pub connector_id: ConnectorId,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub rows_processed: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLastSyncTimeParams {
    pub connector_id: ConnectorId,
    pub table: String,
    pub sync_time: DateTime<Utc>,
}

/// Performs the named steps of a copy table run.
///
/// Every method may be invoked several times for the same run: once per retry attempt, and again
/// after a restart if the process died before the step result was journaled. Implementations must
/// make repeated invocations safe, in particular [`StepExecutor::load`] should upsert and
/// [`StepExecutor::update_last_sync_time`] must never move a watermark backwards.
///
/// Failures are classified by their [`crate::error::ErrorKind`] to decide whether the engine
/// retries them.
pub trait StepExecutor {
    /// Returns the watermark recorded for a (connector, table) pair.
    fn get_last_sync_time(
        &self,
        params: LastSyncTimeParams,
    ) -> impl Future<Output = SyncResult<LastSyncInfo>> + Send;

    /// Reads rows from the source.
    fn extract(
        &self,
        params: ExtractParams,
    ) -> impl Future<Output = SyncResult<ExtractResult>> + Send;

    /// Converts extracted rows into their destination shape.
    fn transform(
        &self,
        params: TransformParams,
    ) -> impl Future<Output = SyncResult<TransformResult>> + Send;

    /// Writes transformed rows to the destination.
    fn load(&self, params: LoadParams) -> impl Future<Output = SyncResult<LoadResult>> + Send;

    /// Persists a new watermark for a (connector, table) pair.
    fn update_last_sync_time(
        &self,
        params: UpdateLastSyncTimeParams,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
