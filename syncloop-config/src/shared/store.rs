use serde::{Deserialize, Serialize};

use crate::shared::{PgConnectionConfig, ValidationError};

/// Backend holding runs, their history and schedules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    /// Volatile in-memory store, runs do not survive a restart.
    #[default]
    Memory,
    /// Durable Postgres store.
    Postgres {
        /// Connection to the database holding the `syncloop` schema.
        connection: PgConnectionConfig,
    },
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Postgres { connection } => connection.validate(),
        }
    }
}
