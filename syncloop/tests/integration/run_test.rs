use chrono::{DateTime, Utc};
use syncloop::error::ErrorKind;
use syncloop::state::history::RunEvent;
use syncloop::state::run::{RunStatus, SyncRunPhase};
use syncloop::store::run::RunStore;
use syncloop::types::{StepKind, SyncMode};
use syncloop_telemetry::tracing::init_test_tracing;

use crate::common::{CONNECTOR_ID, TestEngine, row};

fn timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test(flavor = "multi_thread")]
async fn full_run_copies_every_row() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed(
            "orders",
            vec![
                row(1, "2024-01-01T00:00:00Z"),
                row(2, "2024-01-02T00:00:00Z"),
            ],
        )
        .await;

    let record = engine.run_to_end("orders", SyncMode::Full).await;

    assert_eq!(record.phase, SyncRunPhase::Completed);
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.closed_at.is_some());
    let outcome = record.outcome.unwrap();
    assert_eq!(outcome.rows_processed, 2);
    assert_eq!(outcome.mode, SyncMode::Full);
    assert!(!outcome.watermark_updated);

    // Full runs neither read nor move the watermark.
    assert_eq!(
        engine.executor.calls().await,
        vec![StepKind::Extract, StepKind::Transform, StepKind::Load]
    );
    let loaded = engine.executor.executor().destination_rows("orders").await;
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().all(|row| row.contains_key("id")));
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_runs_resume_from_the_watermark() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed(
            "orders",
            vec![
                row(1, "2024-01-01T00:00:00Z"),
                row(2, "2024-01-02T00:00:00Z"),
            ],
        )
        .await;

    let first = engine.run_to_end("orders", SyncMode::Incremental).await;
    let outcome = first.outcome.unwrap();
    assert_eq!(outcome.rows_processed, 2);
    assert_eq!(outcome.mode, SyncMode::Incremental);
    assert!(outcome.watermark_updated);
    assert_eq!(
        engine
            .executor
            .executor()
            .watermark(CONNECTOR_ID, "orders")
            .await,
        Some(timestamp("2024-01-02T00:00:00Z"))
    );

    engine
        .seed("orders", vec![row(3, "2024-01-03T00:00:00Z")])
        .await;

    let second = engine.run_to_end("orders", SyncMode::Incremental).await;
    let outcome = second.outcome.unwrap();
    assert_eq!(outcome.rows_processed, 1);
    assert!(outcome.watermark_updated);
    assert_eq!(
        engine
            .executor
            .executor()
            .watermark(CONNECTOR_ID, "orders")
            .await,
        Some(timestamp("2024-01-03T00:00:00Z"))
    );
    assert_eq!(
        engine.executor.executor().destination_rows("orders").await.len(),
        3
    );

    let extracts = engine.executor.extract_params().await;
    assert_eq!(extracts.len(), 2);
    assert_eq!(extracts[0].mode, SyncMode::Incremental);
    assert_eq!(extracts[0].last_sync_time, None);
    assert_eq!(extracts[1].mode, SyncMode::Incremental);
    assert_eq!(
        extracts[1].last_sync_time,
        Some(timestamp("2024-01-02T00:00:00Z"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_extract_skips_transform_and_load() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine.seed("orders", Vec::new()).await;

    let record = engine.run_to_end("orders", SyncMode::Full).await;

    assert_eq!(record.phase, SyncRunPhase::Completed);
    let outcome = record.outcome.unwrap();
    assert_eq!(outcome.rows_processed, 0);
    assert!(outcome.no_data);
    assert_eq!(engine.executor.call_count(StepKind::Transform).await, 0);
    assert_eq!(engine.executor.call_count(StepKind::Load).await, 0);

    let history = engine.store.get_events(&record.id).await.unwrap();
    assert!(history.iter().any(|entry| matches!(
        entry.event,
        RunEvent::PhaseChanged {
            to: SyncRunPhase::NoDataToProcess,
            ..
        }
    )));
}

#[tokio::test(flavor = "multi_thread")]
async fn load_failing_every_attempt_fails_the_run() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine
        .executor
        .fail_step_always(
            StepKind::Load,
            ErrorKind::DestinationConnectionFailed,
            "destination unreachable",
        )
        .await;

    let record = engine.run_to_end("orders", SyncMode::Full).await;

    assert_eq!(record.phase, SyncRunPhase::LoadFailed);
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(engine.executor.call_count(StepKind::Load).await, 3);

    let failure = record.failure.unwrap();
    assert_eq!(failure.step, StepKind::Load);
    assert!(failure.message.ends_with("destination unreachable"));
    assert!(failure.solution.is_some());

    let status = engine.registry.get_run_status(&record.id).await.unwrap();
    assert_eq!(status.summary.phase, SyncRunPhase::LoadFailed);
    assert_eq!(status.failure, Some(failure.message));
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_load_failure_is_retried() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine
        .executor
        .fail_step(StepKind::Load, ErrorKind::DestinationError, "deadlock", 2)
        .await;

    let record = engine.run_to_end("orders", SyncMode::Full).await;

    assert_eq!(record.phase, SyncRunPhase::Completed);
    assert_eq!(engine.executor.call_count(StepKind::Load).await, 3);

    let history = engine.store.get_events(&record.id).await.unwrap();
    let failed_attempts = history
        .iter()
        .filter(|entry| matches!(entry.event, RunEvent::StepAttemptFailed { .. }))
        .count();
    assert_eq!(failed_attempts, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_data_is_not_retried() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine
        .executor
        .fail_step_always(StepKind::Extract, ErrorKind::InvalidData, "bad column type")
        .await;

    let record = engine.run_to_end("orders", SyncMode::Full).await;

    assert_eq!(record.phase, SyncRunPhase::ExtractFailed);
    assert_eq!(engine.executor.call_count(StepKind::Extract).await, 1);
    assert_eq!(engine.executor.call_count(StepKind::Transform).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_watermark_degrades_to_full_sync() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine
        .executor
        .fail_step_always(
            StepKind::GetLastSyncTime,
            ErrorKind::SourceConnectionFailed,
            "watermark table unavailable",
        )
        .await;

    let record = engine.run_to_end("orders", SyncMode::Incremental).await;

    assert_eq!(record.phase, SyncRunPhase::Completed);
    assert_eq!(record.params.mode, SyncMode::Incremental);
    let outcome = record.outcome.unwrap();
    assert_eq!(outcome.mode, SyncMode::Full);
    assert!(!outcome.watermark_updated);
    assert_eq!(engine.executor.call_count(StepKind::UpdateLastSyncTime).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_watermark_update_still_completes_the_run() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine
        .executor
        .fail_step_always(
            StepKind::UpdateLastSyncTime,
            ErrorKind::DestinationQueryFailed,
            "watermark write rejected",
        )
        .await;

    let record = engine.run_to_end("orders", SyncMode::Incremental).await;

    assert_eq!(record.phase, SyncRunPhase::Completed);
    assert_eq!(record.failure, None);
    let outcome = record.outcome.unwrap();
    assert_eq!(outcome.rows_processed, 1);
    assert!(!outcome.watermark_updated);
    assert_eq!(
        engine
            .executor
            .executor()
            .watermark(CONNECTOR_ID, "orders")
            .await,
        None
    );

    let history = engine.store.get_events(&record.id).await.unwrap();
    assert!(history.iter().any(|entry| matches!(
        entry.event,
        RunEvent::PhaseChanged {
            to: SyncRunPhase::SyncTimeUpdateFailed,
            ..
        }
    )));
}
