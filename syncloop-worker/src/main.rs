//! Sync worker binary.
//!
//! Executes table sync runs and fires their schedules. Interrupted runs are resumed on start, and
//! SIGINT or SIGTERM stop the worker after the in-flight step attempts return.

use std::process::ExitCode;

use syncloop_config::shared::WorkerConfig;
use syncloop_telemetry::metrics::init_metrics;
use syncloop_telemetry::tracing::init_tracing_with_project;
use tracing::error;

use crate::config::load_worker_config;
use crate::core::start_worker_with_config;
use crate::error::{WorkerError, WorkerResult};

mod config;
mod core;
mod error;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err.render_report());
            ExitCode::FAILURE
        }
    }
}

fn run() -> WorkerResult<()> {
    let worker_config = load_worker_config()?;

    let _log_flusher =
        init_tracing_with_project(env!("CARGO_BIN_NAME"), worker_config.project_ref())
            .map_err(WorkerError::config)?;

    init_metrics(worker_config.project_ref.as_deref()).map_err(WorkerError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(worker_config))
}

async fn async_main(worker_config: WorkerConfig) -> WorkerResult<()> {
    if let Err(err) = start_worker_with_config(worker_config).await {
        error!(error = %err, category = err.category(), "sync worker failed");
        return Err(err);
    }

    Ok(())
}
