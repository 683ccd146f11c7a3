use syncloop_config::load_config;
use syncloop_config::shared::WorkerConfig;

use crate::error::{WorkerError, WorkerResult};

/// Loads and validates the worker configuration.
pub fn load_worker_config() -> WorkerResult<WorkerConfig> {
    let config = load_config::<WorkerConfig>().map_err(WorkerError::config)?;
    config.validate().map_err(WorkerError::config)?;

    Ok(config)
}
