use serde_json::json;
use syncloop::engine::Engine;
use syncloop::executor::memory::MemoryExecutor;
use syncloop::registry::{RunNowRequest, RunRegistry};
use syncloop::state::run::RunRecord;
use syncloop::store::both::memory::MemoryStore;
use syncloop::test_utils::executor::ScriptedExecutor;
use syncloop::types::{Row, RunId, SyncMode};
use syncloop_config::shared::{EngineConfig, OverlapPolicy, RetryConfig};

pub const CONNECTOR_ID: &str = "conn1";

/// Engine settings with millisecond backoff so retries do not slow tests down.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            initial_interval_ms: 1,
            backoff_coefficient: 2.0,
            max_interval_ms: 10,
            max_attempts: 3,
        },
        schedule_poll_interval_ms: 10,
        ..EngineConfig::default()
    }
}

pub fn row(id: i64, updated_at: &str) -> Row {
    let mut row = Row::new();
    row.insert("ID".to_owned(), json!(id));
    row.insert("updated_at".to_owned(), json!(updated_at));
    row
}

pub struct TestEngine {
    pub registry: RunRegistry<MemoryStore, ScriptedExecutor>,
    pub store: MemoryStore,
    pub executor: ScriptedExecutor,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(test_engine_config())
    }

    pub fn with_overlap_policy(overlap_policy: OverlapPolicy) -> Self {
        Self::with_config(EngineConfig {
            overlap_policy,
            ..test_engine_config()
        })
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_parts(
            config,
            MemoryStore::new(),
            ScriptedExecutor::new(MemoryExecutor::new()),
        )
    }

    /// Builds an engine over existing state, as a restarted process would.
    pub fn with_parts(config: EngineConfig, store: MemoryStore, executor: ScriptedExecutor) -> Self {
        let engine = Engine::new(config, store.clone(), executor.clone());

        Self {
            registry: RunRegistry::new(engine),
            store,
            executor,
        }
    }

    pub fn engine(&self) -> &Engine<MemoryStore, ScriptedExecutor> {
        self.registry.engine()
    }

    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.executor
            .executor()
            .insert_source_rows(CONNECTOR_ID, table, rows)
            .await;
    }

    pub async fn run_now(&self, table: &str, mode: SyncMode) -> RunId {
        self.registry
            .run_now(RunNowRequest {
                table: table.to_owned(),
                connector_id: CONNECTOR_ID.to_owned(),
                mode,
                workflow_kind: None,
            })
            .await
            .unwrap()
    }

    /// Starts a run and waits for it to settle.
    pub async fn run_to_end(&self, table: &str, mode: SyncMode) -> RunRecord {
        let run_id = self.run_now(table, mode).await;
        self.engine().wait_for_run(&run_id).await.unwrap()
    }
}
