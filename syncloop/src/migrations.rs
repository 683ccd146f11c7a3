use sqlx::{Executor, postgres::PgPoolOptions};
use syncloop_config::shared::{IntoConnectOptions, PgConnectionConfig};
use tracing::info;

/// Applies the store migrations inside the `syncloop` schema.
///
/// The schema is created if needed and used as search path, so both the store tables and the
/// `_sqlx_migrations` metadata table land in it instead of `public`.
pub async fn apply_store_migrations(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::migrate::MigrateError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists syncloop;").await?;
                conn.execute("set search_path = 'syncloop';").await?;

                Ok(())
            })
        })
        .connect_with(connection_config.with_db())
        .await?;

    info!("applying store migrations");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;

    info!("store migrations successfully applied");

    Ok(())
}
