use chrono::TimeDelta;
use syncloop::error::ErrorKind;
use syncloop::schedule::manager::{CreateSchedule, ScheduleManager};
use syncloop::schedule::trigger::ScheduleTrigger;
use syncloop::state::run::{RunFilter, SyncRunPhase};
use syncloop::types::{RunKind, StepKind, SyncMode};
use syncloop_config::shared::OverlapPolicy;
use syncloop_telemetry::tracing::init_test_tracing;

use crate::common::{CONNECTOR_ID, TestEngine, row};

fn orders_schedule(cron_expression: &str) -> CreateSchedule {
    CreateSchedule {
        connector_id: CONNECTOR_ID.to_owned(),
        table: "orders".to_owned(),
        cron_expression: cron_expression.to_owned(),
        is_active: true,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn due_schedule_starts_an_incremental_run() {
    init_test_tracing();

    let engine = TestEngine::new();
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    let schedules = ScheduleManager::new(engine.store.clone());
    let trigger = ScheduleTrigger::new(engine.engine().clone(), schedules.clone());

    let schedule = schedules
        .create_schedule(orders_schedule("*/5 * * * *"))
        .await
        .unwrap();
    assert!(schedule.id.as_str().starts_with("schedule-conn1-orders-"));

    let listed = schedules.list_schedules().await;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_active);
    assert_eq!(listed[0].cron_expression, "*/5 * * * *");

    let next_run_time = schedule.next_run_time.unwrap();
    assert_eq!(
        trigger
            .fire_due(next_run_time - TimeDelta::seconds(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(trigger.fire_due(next_run_time).await.unwrap(), 1);
    // The firing moved the schedule forward.
    assert_eq!(trigger.fire_due(next_run_time).await.unwrap(), 0);

    let fired = schedules.get_schedule(&schedule.id).await.unwrap();
    assert_eq!(fired.last_run_time, Some(next_run_time));
    assert_eq!(
        fired.next_run_time,
        Some(next_run_time + TimeDelta::minutes(5))
    );

    let run_id = fired.last_run_id.unwrap();
    assert!(run_id.as_str().starts_with("scheduled-orders-"));
    let record = engine.engine().wait_for_run(&run_id).await.unwrap();
    assert_eq!(record.phase, SyncRunPhase::Completed);
    assert_eq!(record.attributes.kind, RunKind::Scheduled);
    assert_eq!(record.params.mode, SyncMode::Incremental);
    assert_eq!(record.attributes.schedule_id, Some(schedule.id.clone()));

    let runs = engine
        .registry
        .list_runs(&RunFilter {
            schedule_id: Some(schedule.id.clone()),
            ..RunFilter::default()
        })
        .await;
    assert_eq!(runs.len(), 1);
    let summary = runs[0].schedule.as_ref().unwrap();
    assert_eq!(summary.id, schedule.id);
    assert_eq!(summary.last_run_time, Some(next_run_time));
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_schedule_does_not_fire() {
    init_test_tracing();

    let engine = TestEngine::new();
    let schedules = ScheduleManager::new(engine.store.clone());
    let trigger = ScheduleTrigger::new(engine.engine().clone(), schedules.clone());

    let schedule = schedules
        .create_schedule(orders_schedule("0 * * * *"))
        .await
        .unwrap();
    let due = schedule.next_run_time.unwrap();

    let paused = schedules.pause_schedule(&schedule.id, None).await.unwrap();
    assert!(!paused.is_active);
    assert_eq!(paused.cron_expression, "0 * * * *");
    assert_eq!(trigger.fire_due(due).await.unwrap(), 0);

    // A paused schedule does not block a new one for the same table.
    let replacement = schedules
        .create_schedule(orders_schedule("*/5 * * * *"))
        .await
        .unwrap();
    let err = schedules
        .create_schedule(orders_schedule("*/10 * * * *"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateSchedule);

    schedules.delete_schedule(&replacement.id).await.unwrap();
    let unpaused = schedules
        .unpause_schedule(&schedule.id, Some("back on"))
        .await
        .unwrap();
    assert!(unpaused.is_active);
    assert_eq!(unpaused.note, "back on");
    assert_eq!(unpaused.cron_expression, "0 * * * *");
    assert!(engine.registry.list_runs(&RunFilter::default()).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn fire_is_skipped_while_the_previous_run_is_active() {
    init_test_tracing();

    let engine = TestEngine::with_overlap_policy(OverlapPolicy::SkipIfRunning);
    engine
        .seed("orders", vec![row(1, "2024-01-01T00:00:00Z")])
        .await;
    engine
        .executor
        .block_step(StepKind::GetLastSyncTime)
        .await;
    let schedules = ScheduleManager::new(engine.store.clone());
    let trigger = ScheduleTrigger::new(engine.engine().clone(), schedules.clone());

    let schedule = schedules
        .create_schedule(orders_schedule("* * * * *"))
        .await
        .unwrap();
    let first_due = schedule.next_run_time.unwrap();

    assert_eq!(trigger.fire_due(first_due).await.unwrap(), 1);
    assert_eq!(
        trigger
            .fire_due(first_due + TimeDelta::minutes(1))
            .await
            .unwrap(),
        0
    );

    let fired = schedules.get_schedule(&schedule.id).await.unwrap();
    assert_eq!(fired.last_run_time, Some(first_due));
    assert_eq!(
        fired.next_run_time,
        Some(first_due + TimeDelta::minutes(2))
    );

    engine
        .executor
        .release_step(StepKind::GetLastSyncTime)
        .await;
    let record = engine
        .engine()
        .wait_for_run(&fired.last_run_id.unwrap())
        .await
        .unwrap();
    assert_eq!(record.phase, SyncRunPhase::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_stops_on_shutdown() {
    init_test_tracing();

    let engine = TestEngine::new();
    let schedules = ScheduleManager::new(engine.store.clone());
    let handle = ScheduleTrigger::new(engine.engine().clone(), schedules).start();

    engine.engine().shutdown();
    handle.wait().await.unwrap();
}
