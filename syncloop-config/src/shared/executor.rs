use serde::{Deserialize, Serialize};

/// Step executor used by the worker process.
///
/// The extract, transform and load mechanics live outside of the orchestration engine, the
/// worker only needs to know which implementation to wire in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// In-process executor keeping source and destination tables in memory.
    #[default]
    Memory,
}
