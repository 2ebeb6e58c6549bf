//! Timer workflow behavior: countdown pause arithmetic, pomodoro cycle
//! accounting, stopwatch elapsed tracking.

use std::sync::Arc;
use std::time::Duration;

use houseflow::providers::in_memory::InMemoryProvider;
use houseflow::runtime::{Runtime, RuntimeOptions, WorkflowStatus};
use houseflow::workflows::activities::{ACTIVITY_COMPLETE_TIMER, ACTIVITY_SEND_NOTIFICATION, ACTIVITY_START_TIMER};
use houseflow::workflows::timer::{TimerParams, TimerSettings, TimerType};
use houseflow::workflows::{
    self, timer_workflow_id, SIGNAL_PAUSE_TIMER, SIGNAL_RESUME_TIMER, SIGNAL_STOP_TIMER,
};
use houseflow::Client;

mod common;
use common::RecordingBackend;

const WAIT: Duration = Duration::from_secs(15);

async fn start_runtime(backend: Arc<RecordingBackend>) -> (Arc<Runtime>, Client) {
    let store = Arc::new(InMemoryProvider::default());
    let rt = Runtime::start_with_store(
        store.clone(),
        Arc::new(workflows::activity_registry(backend)),
        workflows::workflow_registry(),
        RuntimeOptions::default(),
    )
    .await;
    (rt, Client::new(store))
}

fn countdown_params(timer_id: &str, duration_ms: u64) -> TimerParams {
    TimerParams {
        timer_id: timer_id.to_string(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        name: "Tea".into(),
        timer_type: TimerType::Countdown,
        duration_ms,
        settings: TimerSettings {
            notify_on_start: true,
            notify_on_finish: true,
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn countdown_pause_extends_the_deadline_not_the_elapsed_time() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = timer_workflow_id("tea-1");

    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_TIMER, &countdown_params("tea-1", 800))
        .await
        .unwrap();

    // Pause partway through, resume after a bit; the countdown must absorb
    // the paused span and still credit only the configured duration.
    tokio::time::sleep(Duration::from_millis(250)).await;
    client.signal_workflow(&wid, SIGNAL_PAUSE_TIMER, "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.signal_workflow(&wid, SIGNAL_RESUME_TIMER, "").await.unwrap();

    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));

    // start + finish only; pause notifications are off.
    assert_eq!(backend.count(ACTIVITY_SEND_NOTIFICATION), 2);
    assert_eq!(
        backend.notification_titles(),
        vec!["Timer Started".to_string(), "Timer Completed".to_string()]
    );

    assert_eq!(backend.count(ACTIVITY_START_TIMER), 1);
    let complete = backend
        .calls()
        .into_iter()
        .find(|c| c.activity == ACTIVITY_COMPLETE_TIMER)
        .expect("CompleteTimer must run");
    // detail = "{timer}:{status}:{elapsed}:{paused}"
    let parts: Vec<&str> = complete.detail.split(':').collect();
    assert_eq!(parts[1], "completed");
    assert_eq!(parts[2], "800", "elapsed is the logical duration, not wall time");
    let paused: u64 = parts[3].parse().unwrap();
    assert!((150..=1500).contains(&paused), "paused span recorded, got {paused}");
    rt.shutdown().await;
}

#[tokio::test]
async fn countdown_stop_records_partial_elapsed() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = timer_workflow_id("tea-2");

    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_TIMER, &countdown_params("tea-2", 60_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.signal_workflow(&wid, SIGNAL_STOP_TIMER, "").await.unwrap();

    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));
    let complete = backend
        .calls()
        .into_iter()
        .find(|c| c.activity == ACTIVITY_COMPLETE_TIMER)
        .unwrap();
    let parts: Vec<&str> = complete.detail.split(':').collect();
    assert_eq!(parts[1], "stopped");
    let elapsed: u64 = parts[2].parse().unwrap();
    assert!(elapsed < 60_000, "stopped early, elapsed was {elapsed}");
    rt.shutdown().await;
}

#[tokio::test]
async fn pomodoro_omits_the_break_after_the_final_cycle() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = timer_workflow_id("pomo-1");

    let params = TimerParams {
        timer_id: "pomo-1".into(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        name: "Focus".into(),
        timer_type: TimerType::Pomodoro,
        duration_ms: 0,
        settings: TimerSettings {
            work_duration_ms: 40,
            short_break_ms: 20,
            long_break_ms: 30,
            break_interval: 4,
            repetitions: 4,
            ..Default::default()
        },
    };
    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_TIMER, &params)
        .await
        .unwrap();
    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    let WorkflowStatus::Completed { output } = status else {
        panic!("expected completion")
    };
    assert!(output.contains("\"completedCycles\":4"), "got {output}");

    // Four work-period notices plus exactly three break notices: the break
    // that would follow cycle four never happens, so the long break (due at
    // completed_cycles % 4 == 0) is omitted.
    let period_notices = backend.count(ACTIVITY_SEND_NOTIFICATION);
    assert_eq!(period_notices, 7);
    rt.shutdown().await;
}

#[tokio::test]
async fn stopwatch_reports_elapsed_minus_paused() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = timer_workflow_id("watch-1");

    let params = TimerParams {
        timer_id: "watch-1".into(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        name: "Run".into(),
        timer_type: TimerType::Stopwatch,
        duration_ms: 0,
        settings: TimerSettings::default(),
    };
    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_TIMER, &params)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.signal_workflow(&wid, SIGNAL_PAUSE_TIMER, "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.signal_workflow(&wid, SIGNAL_RESUME_TIMER, "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.signal_workflow(&wid, SIGNAL_STOP_TIMER, "").await.unwrap();

    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));
    let complete = backend
        .calls()
        .into_iter()
        .find(|c| c.activity == ACTIVITY_COMPLETE_TIMER)
        .unwrap();
    let parts: Vec<&str> = complete.detail.split(':').collect();
    assert_eq!(parts[1], "stopped");
    let elapsed: u64 = parts[2].parse().unwrap();
    let paused: u64 = parts[3].parse().unwrap();
    assert!(paused >= 100, "paused span must be tracked, got {paused}");
    assert!(elapsed >= 100, "active span must be tracked, got {elapsed}");
    rt.shutdown().await;
}

#[tokio::test]
async fn every_activity_sees_a_distinct_idempotency_key() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = timer_workflow_id("tea-3");

    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_TIMER, &countdown_params("tea-3", 50))
        .await
        .unwrap();
    client.wait_for_workflow(&wid, WAIT).await.unwrap();

    let calls = backend.calls();
    let keys: Vec<&str> = calls.iter().map(|c| c.idempotency_key.as_str()).collect();
    let distinct: std::collections::HashSet<&&str> = keys.iter().collect();
    assert_eq!(keys.len(), distinct.len(), "keys must differ per activity: {keys:?}");
    assert!(keys.iter().all(|k| k.starts_with(&format!("{wid}/"))));
    rt.shutdown().await;
}
