use syncloop::error::ErrorKind;
use syncloop::registry::RunNowRequest;
use syncloop::state::history::RunEvent;
use syncloop::state::run::{RunFilter, RunStatus, SyncRunPhase};
use syncloop::store::run::RunStore;
use syncloop::types::{RunKind, StepKind, SyncMode};
use syncloop_config::shared::OverlapPolicy;
use syncloop_telemetry::tracing::init_test_tracing;

use crate::common::{CONNECTOR_ID, TestEngine, row};

#[tokio::test(flavor = "multi_thread")]
async fn retry_always_runs_a_full_sync() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine
        .executor
        .fail_step(StepKind::Load, ErrorKind::NonRetryable, "constraint violation", 1)
        .await;

    let failed = engine.run_to_end("orders", SyncMode::Incremental).await;
    assert_eq!(failed.phase, SyncRunPhase::LoadFailed);

    let retry_id = engine.registry.retry_run(&failed.id).await.unwrap();
    assert!(retry_id.as_str().starts_with(&format!("retry-{}-", failed.id)));

    let retried = engine.engine().wait_for_run(&retry_id).await.unwrap();
    assert_eq!(retried.phase, SyncRunPhase::Completed);
    assert_eq!(retried.params.mode, SyncMode::Full);
    assert_eq!(retried.attributes.kind, RunKind::Retry);
    assert_eq!(retried.attributes.retry_of, Some(failed.id));
    assert_eq!(retried.attributes.table, "orders");
    assert_eq!(retried.outcome.unwrap().mode, SyncMode::Full);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_is_observed_at_the_next_step_boundary() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine.executor.block_step(StepKind::Extract).await;
    let extract_called = engine
        .executor
        .notify_on_step_calls(StepKind::Extract, 1)
        .await;

    let run_id = engine.run_now("orders", SyncMode::Full).await;
    extract_called.notified().await;

    assert!(engine.registry.cancel_run(&run_id).await.unwrap());
    engine.executor.release_step(StepKind::Extract).await;

    let record = engine.engine().wait_for_run(&run_id).await.unwrap();
    assert_eq!(record.phase, SyncRunPhase::Cancelled);
    assert_eq!(record.status, RunStatus::Cancelled);
    assert!(record.cancel_requested);

    // The in-flight extract finished, nothing after it ran.
    assert_eq!(engine.executor.call_count(StepKind::Transform).await, 0);
    assert_eq!(engine.executor.call_count(StepKind::Load).await, 0);

    let history = engine.store.get_events(&run_id).await.unwrap();
    assert!(
        history
            .iter()
            .any(|entry| matches!(entry.event, RunEvent::CancelRequested))
    );
    assert!(matches!(
        history.last().map(|entry| &entry.event),
        Some(RunEvent::PhaseChanged {
            to: SyncRunPhase::Cancelled,
            ..
        })
    ));

    // Cancelling again is a no-op.
    assert!(!engine.registry.cancel_run(&run_id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn terminate_all_cancels_every_running_run() {
    init_test_tracing();

    let engine = TestEngine::new();
    for table in ["orders", "users"] {
        engine
            .seed(table, vec![row(1, "2024-01-01T00:00:00Z")])
            .await;
    }
    engine.executor.block_step(StepKind::Extract).await;
    let extracts_called = engine
        .executor
        .notify_on_step_calls(StepKind::Extract, 2)
        .await;

    let orders = engine.run_now("orders", SyncMode::Full).await;
    let users = engine.run_now("users", SyncMode::Full).await;
    extracts_called.notified().await;

    assert_eq!(engine.registry.terminate_all_running().await.unwrap(), 2);
    engine.executor.release_step(StepKind::Extract).await;

    for run_id in [orders, users] {
        let record = engine.engine().wait_for_run(&run_id).await.unwrap();
        assert_eq!(record.phase, SyncRunPhase::Cancelled);
    }

    let cancelled = engine
        .registry
        .list_runs(&RunFilter {
            status: Some(RunStatus::Cancelled),
            ..RunFilter::default()
        })
        .await;
    assert_eq!(cancelled.len(), 2);
    assert_eq!(engine.registry.purge_terminal_runs().await.unwrap(), 2);
    assert!(engine.registry.list_runs(&RunFilter::default()).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn running_phase_is_reported_live() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine.executor.block_step(StepKind::Load).await;
    let load_called = engine.executor.notify_on_step_calls(StepKind::Load, 1).await;

    let run_id = engine.run_now("orders", SyncMode::Full).await;
    load_called.notified().await;

    let status = engine.registry.get_run_status(&run_id).await.unwrap();
    assert_eq!(status.summary.phase, SyncRunPhase::Loading);
    assert_eq!(status.summary.status, RunStatus::Running);
    assert_eq!(status.summary.kind, RunKind::RunNow);
    assert_eq!(status.summary.connector_id, CONNECTOR_ID);
    assert_eq!(status.failure, None);
    assert!(status.history_len > 0);

    engine.executor.release_step(StepKind::Load).await;
    let record = engine.engine().wait_for_run(&run_id).await.unwrap();
    assert_eq!(record.phase, SyncRunPhase::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_if_running_rejects_overlapping_runs() {
    init_test_tracing();

    let engine = TestEngine::with_overlap_policy(OverlapPolicy::SkipIfRunning);
    for table in ["orders", "users"] {
        engine
            .seed(table, vec![row(1, "2024-01-01T00:00:00Z")])
            .await;
    }
    engine.executor.block_step(StepKind::Extract).await;

    let first = engine.run_now("orders", SyncMode::Full).await;

    let err = engine
        .registry
        .run_now(RunNowRequest {
            table: "orders".to_owned(),
            connector_id: CONNECTOR_ID.to_owned(),
            mode: SyncMode::Incremental,
            workflow_kind: Some("CopyTableWorkflow".to_owned()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RunAlreadyActive);

    // Other tables are not affected.
    let other = engine.run_now("users", SyncMode::Full).await;

    engine.executor.release_step(StepKind::Extract).await;
    for run_id in [&first, &other] {
        let record = engine.engine().wait_for_run(run_id).await.unwrap();
        assert_eq!(record.phase, SyncRunPhase::Completed);
    }

    // Once the first run finished the table accepts runs again.
    let record = engine.run_to_end("orders", SyncMode::Full).await;
    assert_eq!(record.phase, SyncRunPhase::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_runs_are_allowed_by_default() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine.executor.block_step(StepKind::Extract).await;
    let extracts_called = engine
        .executor
        .notify_on_step_calls(StepKind::Extract, 2)
        .await;

    let first = engine.run_now("orders", SyncMode::Full).await;
    let second = engine.run_now("orders", SyncMode::Full).await;
    extracts_called.notified().await;
    assert_ne!(first, second);

    engine.executor.release_step(StepKind::Extract).await;
    for run_id in [&first, &second] {
        let record = engine.engine().wait_for_run(run_id).await.unwrap();
        assert_eq!(record.phase, SyncRunPhase::Completed);
    }

    // Loads upsert on the primary key, so the overlap does not duplicate rows.
    assert_eq!(
        engine.executor.executor().destination_rows("orders").await.len(),
        1
    );
}
