use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, PgPool, Row};
use syncloop_config::shared::{IntoConnectOptions, PgConnectionConfig};
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::state::history::{HistoryEvent, RunEvent};
use crate::state::run::{RunFilter, RunRecord};
use crate::state::schedule::ScheduleConfig;
use crate::store::run::RunStore;
use crate::store::schedule::ScheduleStore;
use crate::types::{RunId, ScheduleId};

/// Schema holding the store tables and the migration metadata.
pub const SYNCLOOP_SCHEMA: &str = "syncloop";

/// Maximum number of connections in the pool.
const MAX_POOL_CONNECTIONS: u32 = 4;

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates a lazily connected pool whose sessions resolve unqualified names in [`SYNCLOOP_SCHEMA`].
///
/// No connection is opened until the first query runs.
fn create_database_pool(config: &PgConnectionConfig) -> PgPool {
    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(MAX_POOL_CONNECTIONS)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("set search_path = 'syncloop';").await?;

                Ok(())
            })
        })
        .connect_lazy_with(config.with_db())
}

/// Postgres backed store for runs, their histories and schedules.
///
/// The full record is stored as `jsonb` in a `metadata` column, and the fields used for filtering
/// are duplicated into regular columns. The `cancel_requested` column is authoritative over the
/// copy inside `metadata`, which lets cancellation be a single column update.
///
/// Tables must exist before use, see [`crate::migrations::apply_store_migrations`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(config: &PgConnectionConfig) -> Self {
        Self {
            pool: create_database_pool(config),
        }
    }

    /// Wraps an existing pool. Its sessions must use [`SYNCLOOP_SCHEMA`] as search path.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> SyncResult<RunRecord> {
    let Json(mut record): Json<RunRecord> = row.try_get("metadata")?;
    record.cancel_requested = row.try_get("cancel_requested")?;

    Ok(record)
}

fn history_event_from_row(row: &PgRow) -> SyncResult<HistoryEvent> {
    let sequence: i64 = row.try_get("sequence")?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;
    let Json(event): Json<RunEvent> = row.try_get("event")?;

    Ok(HistoryEvent {
        sequence: sequence as u64,
        recorded_at,
        event,
    })
}

impl RunStore for PostgresStore {
    async fn insert_run(&self, record: RunRecord) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            insert into runs
                (id, workflow_kind, table_name, connector_id, schedule_id, status, phase,
                 started_at, updated_at, closed_at, cancel_requested, metadata)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            on conflict (id) do nothing
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.attributes.workflow_kind.as_str())
        .bind(&record.attributes.table)
        .bind(&record.attributes.connector_id)
        .bind(record.attributes.schedule_id.as_ref().map(ScheduleId::as_str))
        .bind(record.status.as_static_str())
        .bind(record.phase.as_static_str())
        .bind(record.started_at)
        .bind(record.updated_at)
        .bind(record.closed_at)
        .bind(record.cancel_requested)
        .bind(Json(&record))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!(
                ErrorKind::InvalidState,
                "Run already exists",
                record.id.to_string()
            );
        }

        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> SyncResult<Option<RunRecord>> {
        let row = sqlx::query("select cancel_requested, metadata from runs where id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> SyncResult<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            select cancel_requested, metadata
            from runs
            where ($1::text is null or workflow_kind = $1)
              and ($2::text is null or status = $2)
              and ($3::text is null or table_name = $3)
              and ($4::text is null or connector_id = $4)
              and ($5::text is null or schedule_id = $5)
            order by started_at desc, id desc
            "#,
        )
        .bind(filter.workflow_kind.map(|kind| kind.as_str()))
        .bind(filter.status.map(|status| status.as_static_str()))
        .bind(filter.table.as_deref())
        .bind(filter.connector_id.as_deref())
        .bind(filter.schedule_id.as_ref().map(ScheduleId::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn update_run(&self, record: &RunRecord) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            update runs
            set status = $2,
                phase = $3,
                updated_at = $4,
                closed_at = $5,
                cancel_requested = cancel_requested or $6,
                metadata = $7
            where id = $1
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.status.as_static_str())
        .bind(record.phase.as_static_str())
        .bind(record.updated_at)
        .bind(record.closed_at)
        .bind(record.cancel_requested)
        .bind(Json(record))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!(ErrorKind::RunNotFound, "Run not found", record.id.to_string());
        }

        Ok(())
    }

    async fn request_cancel(&self, run_id: &RunId) -> SyncResult<bool> {
        let row = sqlx::query(
            r#"
            with target as (
                select id, status from runs where id = $1
            ), flagged as (
                update runs set cancel_requested = true
                where id = $1 and status = 'running'
                returning id
            )
            select
                exists (select 1 from target) as found,
                exists (select 1 from flagged) as flagged
            "#,
        )
        .bind(run_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let found: bool = row.try_get("found")?;
        if !found {
            bail!(ErrorKind::RunNotFound, "Run not found", run_id.to_string());
        }

        Ok(row.try_get("flagged")?)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> SyncResult<HistoryEvent> {
        let row = sqlx::query(
            r#"
            insert into run_events (run_id, sequence, recorded_at, event)
            select $1, coalesce(max(sequence), 0) + 1, now(), $2
            from run_events
            where run_id = $1
            returning sequence, recorded_at, event
            "#,
        )
        .bind(run_id.as_str())
        .bind(Json(&event))
        .fetch_one(&self.pool)
        .await;

        let row = match row {
            Ok(row) => row,
            Err(sqlx::Error::Database(err)) if err.is_foreign_key_violation() => {
                bail!(ErrorKind::RunNotFound, "Run not found", run_id.to_string());
            }
            Err(err) => return Err(err.into()),
        };

        debug!(run_id = %run_id, "appended run history event");

        history_event_from_row(&row)
    }

    async fn get_events(&self, run_id: &RunId) -> SyncResult<Vec<HistoryEvent>> {
        let rows = sqlx::query(
            r#"
            select sequence, recorded_at, event
            from run_events
            where run_id = $1
            order by sequence
            "#,
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_event_from_row).collect()
    }

    async fn delete_runs(&self, run_ids: &[RunId]) -> SyncResult<u64> {
        let ids: Vec<&str> = run_ids.iter().map(RunId::as_str).collect();

        // History rows go with their run through `on delete cascade`.
        let result = sqlx::query("delete from runs where id = any($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

impl ScheduleStore for PostgresStore {
    async fn insert_schedule(&self, schedule: ScheduleConfig) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            insert into schedules (id, connector_id, table_name, is_active, created_at, metadata)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (id) do nothing
            "#,
        )
        .bind(schedule.id.as_str())
        .bind(&schedule.connector_id)
        .bind(&schedule.table)
        .bind(schedule.is_active)
        .bind(schedule.created_at)
        .bind(Json(&schedule))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_schedule(&self, schedule_id: &ScheduleId) -> SyncResult<Option<ScheduleConfig>> {
        let row = sqlx::query("select metadata from schedules where id = $1")
            .bind(schedule_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(schedule): Json<ScheduleConfig> = row.try_get("metadata")?;

        Ok(Some(schedule))
    }

    async fn list_schedule_ids(&self) -> SyncResult<Vec<ScheduleId>> {
        let rows = sqlx::query("select id from schedules order by id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Ok(ScheduleId::new(row.try_get::<String, _>("id")?)))
            .collect()
    }

    async fn update_schedule(&self, schedule: &ScheduleConfig) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            update schedules
            set is_active = $2,
                metadata = $3
            where id = $1
            "#,
        )
        .bind(schedule.id.as_str())
        .bind(schedule.is_active)
        .bind(Json(schedule))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!(
                ErrorKind::ScheduleNotFound,
                "Schedule not found",
                schedule.id.to_string()
            );
        }

        Ok(())
    }

    async fn delete_schedule(&self, schedule_id: &ScheduleId) -> SyncResult<bool> {
        let result = sqlx::query("delete from schedules where id = $1")
            .bind(schedule_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
