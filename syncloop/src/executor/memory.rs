use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::executor::{
    ExtractParams, ExtractResult, LastSyncInfo, LastSyncTimeParams, LoadParams, LoadResult,
    StepExecutor, TransformParams, TransformResult, UpdateLastSyncTimeParams,
};
use crate::types::{ConnectorId, Row};

/// Column holding the change timestamp of a source row, as an RFC 3339 string.
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Column used as the upsert key when loading rows.
pub const PRIMARY_KEY_COLUMN: &str = "id";

type PairKey = (ConnectorId, String);

#[derive(Debug, Default)]
struct Inner {
    sources: HashMap<PairKey, Vec<Row>>,
    destination: HashMap<String, Vec<Row>>,
    watermarks: HashMap<PairKey, DateTime<Utc>>,
}

/// In-process step executor used for development and tests.
///
/// Source tables are seeded with [`MemoryExecutor::insert_source_rows`], loaded rows end up in an
/// in-memory destination keyed by table name, and watermarks are kept per (connector, table).
///
/// Extraction filters on [`UPDATED_AT_COLUMN`]. Rows without a parsable timestamp are only copied
/// by full syncs. Transformation lower-cases column names. Loading upserts on
/// [`PRIMARY_KEY_COLUMN`] and appends rows that lack it.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends rows to a source table, creating it if needed.
    pub async fn insert_source_rows(&self, connector_id: &str, table: &str, rows: Vec<Row>) {
        let mut inner = self.inner.lock().await;
        inner
            .sources
            .entry((connector_id.to_owned(), table.to_owned()))
            .or_default()
            .extend(rows);
    }

    /// Returns a copy of the rows loaded into a destination table.
    pub async fn destination_rows(&self, table: &str) -> Vec<Row> {
        let inner = self.inner.lock().await;
        inner.destination.get(table).cloned().unwrap_or_default()
    }

    /// Returns the watermark of a (connector, table) pair.
    pub async fn watermark(&self, connector_id: &str, table: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner
            .watermarks
            .get(&(connector_id.to_owned(), table.to_owned()))
            .copied()
    }
}

impl StepExecutor for MemoryExecutor {
    async fn get_last_sync_time(&self, params: LastSyncTimeParams) -> SyncResult<LastSyncInfo> {
        let inner = self.inner.lock().await;
        let last_sync_time = inner
            .watermarks
            .get(&(params.connector_id, params.table))
            .copied();

        Ok(LastSyncInfo { last_sync_time })
    }

    async fn extract(&self, params: ExtractParams) -> SyncResult<ExtractResult> {
        let inner = self.inner.lock().await;

        let Some(source_rows) = inner
            .sources
            .get(&(params.connector_id.clone(), params.table.clone()))
        else {
            bail!(
                ErrorKind::InvalidData,
                "Source table does not exist",
                format!("{}.{}", params.connector_id, params.table)
            );
        };

        let lower_bound = params
            .mode
            .is_incremental()
            .then_some(params.last_sync_time)
            .flatten();

        let mut rows = Vec::new();
        let mut max_timestamp: Option<DateTime<Utc>> = None;
        for row in source_rows {
            let updated_at = row_timestamp(row);
            let selected = match (lower_bound, updated_at) {
                (Some(bound), Some(updated_at)) => updated_at > bound,
                (Some(_), None) => false,
                (None, _) => true,
            };

            if !selected {
                continue;
            }

            if let Some(updated_at) = updated_at {
                max_timestamp = max_timestamp.max(Some(updated_at));
            }
            rows.push(row.clone());
        }

        let checksum = checksum(&rows)?;
        debug!(
            table = %params.table,
            mode = %params.mode,
            rows = rows.len(),
            "extracted rows from memory source"
        );

        Ok(ExtractResult {
            row_count: rows.len() as u64,
            rows,
            max_timestamp,
            checksum,
        })
    }

    async fn transform(&self, params: TransformParams) -> SyncResult<TransformResult> {
        let rows: Vec<Row> = params
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(column, value)| (column.to_lowercase(), value))
                    .collect()
            })
            .collect();

        Ok(TransformResult {
            row_count: rows.len() as u64,
            rows,
        })
    }

    async fn load(&self, params: LoadParams) -> SyncResult<LoadResult> {
        let mut inner = self.inner.lock().await;
        let table_rows = inner.destination.entry(params.table.clone()).or_default();

        let rows_processed = params.rows.len() as u64;
        for row in params.rows {
            let existing = row.get(PRIMARY_KEY_COLUMN).and_then(|key| {
                table_rows
                    .iter()
                    .position(|loaded| loaded.get(PRIMARY_KEY_COLUMN) == Some(key))
            });

            match existing {
                Some(index) => table_rows[index] = row,
                None => table_rows.push(row),
            }
        }

        info!(table = %params.table, rows_processed, "loaded rows into memory destination");

        Ok(LoadResult {
            rows_processed,
            success: true,
        })
    }

    async fn update_last_sync_time(&self, params: UpdateLastSyncTimeParams) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        let watermark = inner
            .watermarks
            .entry((params.connector_id, params.table))
            .or_insert(params.sync_time);

        // Watermarks only move forward.
        if params.sync_time > *watermark {
            *watermark = params.sync_time;
        }

        Ok(())
    }
}

fn row_timestamp(row: &Row) -> Option<DateTime<Utc>> {
    let value = row.get(UPDATED_AT_COLUMN)?.as_str()?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

/// FNV-1a over the JSON encoding of the rows.
fn checksum(rows: &[Row]) -> SyncResult<String> {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let encoded = serde_json::to_vec(rows)?;
    let hash = encoded.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    });

    Ok(format!("{hash:016x}"))
}
