use serde::Deserialize;

use crate::Config;
use crate::shared::{EngineConfig, ExecutorConfig, StoreConfig, ValidationError};

/// Complete configuration of the worker process.
///
/// Does not implement [`serde::Serialize`] so that connection secrets cannot leak through
/// serialized forms.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Run and schedule store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Step executor wiring.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Optional project reference attached to logs and metrics.
    #[serde(default)]
    pub project_ref: Option<String>,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.engine.validate()?;
        self.store.validate()
    }

    pub fn project_ref(&self) -> Option<String> {
        self.project_ref.clone()
    }
}

impl Config for WorkerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
