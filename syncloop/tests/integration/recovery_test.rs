use syncloop::error::ErrorKind;
use syncloop::executor::memory::MemoryExecutor;
use syncloop::registry::RunNowRequest;
use syncloop::state::history::RunEvent;
use syncloop::state::run::{RunStatus, SyncRunPhase};
use syncloop::store::both::memory::MemoryStore;
use syncloop::store::run::RunStore;
use syncloop::test_utils::executor::ScriptedExecutor;
use syncloop::types::{StepKind, SyncMode};
use syncloop_telemetry::tracing::init_test_tracing;

use crate::common::{CONNECTOR_ID, TestEngine, row, test_engine_config};

/// Starts a full run on `orders` and shuts the engine down while the run is parked in `step`.
async fn interrupt_run_in(
    step: StepKind,
    store: &MemoryStore,
    memory: &MemoryExecutor,
) -> TestEngine {
    let engine = TestEngine::with_parts(
        test_engine_config(),
        store.clone(),
        ScriptedExecutor::new(memory.clone()),
    );
    engine
        .seed(
            "orders",
            vec![
                row(1, "2024-01-01T00:00:00Z"),
                row(2, "2024-01-02T00:00:00Z"),
            ],
        )
        .await;
    engine.executor.block_step(step).await;
    let step_called = engine.executor.notify_on_step_calls(step, 1).await;

    engine.run_now("orders", SyncMode::Full).await;
    step_called.notified().await;

    engine.engine().shutdown_and_wait().await.unwrap();

    engine
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_run_resumes_after_its_last_completed_step() {
    init_test_tracing();

    let store = MemoryStore::new();
    let memory = MemoryExecutor::new();
    let first = interrupt_run_in(StepKind::Load, &store, &memory).await;

    let runs = first.registry.list_runs(&Default::default()).await;
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].id.clone();

    let record = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(record.phase, SyncRunPhase::Loading);
    assert_eq!(record.status, RunStatus::Running);

    let second = TestEngine::with_parts(
        test_engine_config(),
        store.clone(),
        ScriptedExecutor::new(memory.clone()),
    );
    assert_eq!(second.engine().recover().await.unwrap(), 1);

    let record = second.engine().wait_for_run(&run_id).await.unwrap();
    assert_eq!(record.phase, SyncRunPhase::Completed);
    assert_eq!(record.outcome.unwrap().rows_processed, 2);

    // Extract and transform results were replayed from the history.
    assert_eq!(second.executor.calls().await, vec![StepKind::Load]);

    // Replayed steps do not move the run back to their phases.
    let phases: Vec<_> = store
        .get_events(&run_id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|entry| match entry.event {
            RunEvent::PhaseChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            SyncRunPhase::Extracting,
            SyncRunPhase::Transforming,
            SyncRunPhase::Loading,
            SyncRunPhase::Completed,
        ]
    );
    assert_eq!(memory.destination_rows("orders").await.len(), 2);

    // Nothing is left to recover.
    assert_eq!(second.engine().recover().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_requested_while_down_is_honoured_on_recovery() {
    init_test_tracing();

    let store = MemoryStore::new();
    let memory = MemoryExecutor::new();
    let first = interrupt_run_in(StepKind::Transform, &store, &memory).await;
    let run_id = first.registry.list_runs(&Default::default()).await[0]
        .id
        .clone();

    let second = TestEngine::with_parts(
        test_engine_config(),
        store.clone(),
        ScriptedExecutor::new(memory.clone()),
    );
    assert!(second.registry.cancel_run(&run_id).await.unwrap());
    assert_eq!(second.engine().recover().await.unwrap(), 1);

    let record = second.engine().wait_for_run(&run_id).await.unwrap();
    assert_eq!(record.phase, SyncRunPhase::Cancelled);
    assert!(second.executor.calls().await.is_empty());
    assert!(memory.destination_rows("orders").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn shut_down_engine_rejects_new_runs() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine.engine().shutdown_and_wait().await.unwrap();

    let err = engine
        .registry
        .run_now(RunNowRequest {
            table: "orders".to_owned(),
            connector_id: CONNECTOR_ID.to_owned(),
            mode: SyncMode::Full,
            workflow_kind: None,
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_step_releases_waiters_and_is_resumed_on_recovery() {
    init_test_tracing();

    let store = MemoryStore::new();
    let memory = MemoryExecutor::new();
    let first = TestEngine::with_parts(
        test_engine_config(),
        store.clone(),
        ScriptedExecutor::new(memory.clone()),
    );
    first
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    first.executor.panic_on_step(StepKind::Transform).await;

    let run_id = first.run_now("orders", SyncMode::Full).await;

    let record = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        first.engine().wait_for_run(&run_id),
    )
    .await
    .expect("waiting for a panicked run should not hang")
    .unwrap();
    assert_eq!(record.phase, SyncRunPhase::Transforming);
    assert_eq!(record.status, RunStatus::Running);

    let err = first.engine().wait().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::RunWorkerPanic));

    let second = TestEngine::with_parts(
        test_engine_config(),
        store.clone(),
        ScriptedExecutor::new(memory.clone()),
    );
    assert_eq!(second.engine().recover().await.unwrap(), 1);

    let record = second.engine().wait_for_run(&run_id).await.unwrap();
    assert_eq!(record.phase, SyncRunPhase::Completed);
    assert_eq!(
        second.executor.calls().await,
        vec![StepKind::Transform, StepKind::Load]
    );
}
