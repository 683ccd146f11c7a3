use syncloop::engine::Engine;
use syncloop::executor::StepExecutor;
use syncloop::executor::memory::MemoryExecutor;
use syncloop::migrations::apply_store_migrations;
use syncloop::schedule::manager::ScheduleManager;
use syncloop::schedule::trigger::ScheduleTrigger;
use syncloop::store::both::memory::MemoryStore;
use syncloop::store::both::postgres::PostgresStore;
use syncloop::store::run::RunStore;
use syncloop::store::schedule::ScheduleStore;
use syncloop_config::shared::{
    EngineConfig, ExecutorConfig, PgConnectionConfig, RetryConfig, StoreConfig, WorkerConfig,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use crate::error::WorkerResult;

/// Starts the worker with the provided configuration and runs it until a termination signal.
///
/// The store and executor are built once here and handed to the engine, which in turn is shared
/// by the schedule trigger.
pub async fn start_worker_with_config(config: WorkerConfig) -> WorkerResult<()> {
    info!("starting sync worker");

    log_config(&config);

    match &config.store {
        StoreConfig::Memory => {
            warn!("using the memory store, runs will not survive a restart");
            let store = MemoryStore::new();
            let executor = init_executor(&config.executor);

            run_worker(config.engine, store, executor).await?;
        }
        StoreConfig::Postgres { connection } => {
            apply_store_migrations(connection).await?;
            let store = PostgresStore::new(connection);
            let executor = init_executor(&config.executor);

            run_worker(config.engine, store, executor).await?;
        }
    }

    info!("sync worker stopped");

    Ok(())
}

fn init_executor(config: &ExecutorConfig) -> MemoryExecutor {
    match config {
        ExecutorConfig::Memory => MemoryExecutor::new(),
    }
}

/// Recovers interrupted runs, fires schedules and waits for shutdown.
#[tracing::instrument(skip_all)]
async fn run_worker<S, E>(engine_config: EngineConfig, store: S, executor: E) -> WorkerResult<()>
where
    S: RunStore + ScheduleStore + Clone + Send + Sync + 'static,
    E: StepExecutor + Clone + Send + Sync + 'static,
{
    let engine = Engine::new(engine_config, store.clone(), executor);

    let recovered = engine.recover().await?;
    info!(recovered, "resumed interrupted runs");

    let trigger = ScheduleTrigger::new(engine.clone(), ScheduleManager::new(store)).start();

    // Listens for termination signals and triggers shutdown.
    let shutdown_tx = engine.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        match wait_for_termination_signal().await {
            Ok(signal_name) => info!(signal = signal_name, "shutting down sync worker"),
            Err(err) => error!(error = %err, "failed to listen for termination signals, shutting down"),
        }

        shutdown_tx.shutdown();
    });

    // The trigger only stops on shutdown, unless it failed.
    let trigger_result = trigger.wait().await;
    if trigger_result.is_err() {
        engine.shutdown();
    }

    let engine_result = engine.wait().await;

    // If the engine stopped on its own the signal listener is still running.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    trigger_result?;
    engine_result?;

    Ok(())
}

/// Waits for SIGINT or SIGTERM and returns the name of the received signal.
async fn wait_for_termination_signal() -> std::io::Result<&'static str> {
    // SIGTERM is sent by orchestrators before killing the process. Runs interrupted by a kill are
    // resumed by the next worker, but finishing the in-flight step attempt is cheaper.
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("sigint")
        }
        _ = sigterm.recv() => Ok("sigterm"),
    }
}

fn log_config(config: &WorkerConfig) {
    log_engine_config(&config.engine);
    log_store_config(&config.store);
    debug!(executor = ?config.executor, "step executor config");
}

fn log_engine_config(config: &EngineConfig) {
    debug!(
        step_timeout_ms = config.step_timeout_ms,
        max_concurrent_runs = config.max_concurrent_runs,
        overlap_policy = ?config.overlap_policy,
        schedule_poll_interval_ms = config.schedule_poll_interval_ms,
        "engine config"
    );
    log_retry_config(&config.retry);
}

fn log_retry_config(config: &RetryConfig) {
    debug!(
        initial_interval_ms = config.initial_interval_ms,
        backoff_coefficient = config.backoff_coefficient,
        max_interval_ms = config.max_interval_ms,
        max_attempts = config.max_attempts,
        "retry config"
    );
}

fn log_store_config(config: &StoreConfig) {
    match config {
        StoreConfig::Memory => debug!("using memory store config"),
        StoreConfig::Postgres { connection } => log_pg_connection_config(connection),
    }
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "store postgres connection config",
    );
}
