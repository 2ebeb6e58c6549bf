//! Laundry workflow behavior: phase ordering, auto-start, reminder loops.

use std::sync::Arc;
use std::time::Duration;

use houseflow::providers::in_memory::InMemoryProvider;
use houseflow::runtime::{Runtime, RuntimeOptions, WorkflowStatus};
use houseflow::workflows::activities::{
    ACTIVITY_COMPLETE_LAUNDRY, ACTIVITY_SEND_NOTIFICATION, ACTIVITY_START_LAUNDRY,
};
use houseflow::workflows::laundry::{LaundryParams, LaundrySettings};
use houseflow::workflows::{self, laundry_workflow_id, SIGNAL_START_DRY, SIGNAL_WASH_COMPLETE};
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

#[tokio::test]
async fn full_cycle_emits_notifications_in_phase_order() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = laundry_workflow_id("load-1");

    let params = LaundryParams {
        laundry_id: "load-1".into(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        load_type: "normal".into(),
        wash_time_ms: 120,
        dry_time_ms: 150,
        settings: LaundrySettings {
            auto_start: true,
            auto_start_delay_ms: 80,
            notify_on_start: true,
            notify_on_wash_done: true,
            notify_on_dry_done: true,
            ..Default::default()
        },
    };
    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_LAUNDRY, &params)
        .await
        .unwrap();
    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));

    assert_eq!(
        backend.notification_titles(),
        vec![
            "Laundry Started".to_string(),
            "Wash Cycle Complete".to_string(),
            "Dry Cycle Started".to_string(),
            "Laundry Complete".to_string(),
        ]
    );
    // StartLaundry precedes everything; CompleteLaundry closes the cycle.
    let order = backend.call_order();
    assert_eq!(order.first().map(String::as_str), Some(ACTIVITY_START_LAUNDRY));
    assert_eq!(order.last().map(String::as_str), Some(ACTIVITY_COMPLETE_LAUNDRY));

    let complete = backend
        .calls()
        .into_iter()
        .find(|c| c.activity == ACTIVITY_COMPLETE_LAUNDRY)
        .unwrap();
    // detail = "{id}:{wash}:{dry}:{total}"
    let parts: Vec<&str> = complete.detail.split(':').collect();
    let wash: u64 = parts[1].parse().unwrap();
    let dry: u64 = parts[2].parse().unwrap();
    let total: u64 = parts[3].parse().unwrap();
    assert!(wash >= 100, "wash span measured, got {wash}");
    assert!(dry >= 120, "dry span measured, got {dry}");
    assert!(total >= wash + dry, "total covers both phases plus the move");
    rt.shutdown().await;
}

#[tokio::test]
async fn zero_dry_time_skips_the_dry_phase() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = laundry_workflow_id("load-2");

    let params = LaundryParams {
        laundry_id: "load-2".into(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        load_type: "quick".into(),
        wash_time_ms: 80,
        dry_time_ms: 0,
        settings: LaundrySettings {
            notify_on_start: true,
            notify_on_wash_done: true,
            notify_on_dry_done: true,
            ..Default::default()
        },
    };
    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_LAUNDRY, &params)
        .await
        .unwrap();
    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));
    assert_eq!(
        backend.notification_titles(),
        vec!["Laundry Started".to_string(), "Wash Cycle Complete".to_string()],
        "no dry-phase notifications when dry_time is zero"
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn wash_complete_signal_beats_the_wash_timer() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = laundry_workflow_id("load-3");

    let params = LaundryParams {
        laundry_id: "load-3".into(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        load_type: "heavy".into(),
        wash_time_ms: 60_000,
        dry_time_ms: 0,
        settings: LaundrySettings::default(),
    };
    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_LAUNDRY, &params)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.signal_workflow(&wid, SIGNAL_WASH_COMPLETE, "").await.unwrap();
    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));
    rt.shutdown().await;
}

#[tokio::test]
async fn start_dry_signal_suppresses_remaining_wash_reminders() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = laundry_workflow_id("load-4");

    let params = LaundryParams {
        laundry_id: "load-4".into(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        load_type: "normal".into(),
        wash_time_ms: 50,
        dry_time_ms: 60,
        settings: LaundrySettings {
            auto_start: false,
            notify_reminders: true,
            reminder_interval_ms: 200,
            max_reminders: 2,
            ..Default::default()
        },
    };
    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_LAUNDRY, &params)
        .await
        .unwrap();

    // Wash finishes at ~50ms; the first reminder lands at ~250ms. Sending
    // start_dry between the first and second reminder suppresses the second.
    tokio::time::sleep(Duration::from_millis(380)).await;
    client.signal_workflow(&wid, SIGNAL_START_DRY, "").await.unwrap();
    // The collect-phase reminder loop is also live (same settings); let the
    // dry cycle finish and the workflow complete on reminder exhaustion.
    let status = client.wait_for_workflow(&wid, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));

    let reminders = backend
        .notification_titles()
        .into_iter()
        .filter(|t| t == "Laundry Reminder")
        .count();
    // One wash reminder (the second was suppressed) plus at most the two
    // collect reminders.
    assert!(
        (1..=3).contains(&reminders),
        "second wash reminder suppressed, got {reminders} reminder notifications"
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn reminders_stop_after_max_when_no_signal_arrives() {
    let backend = Arc::new(RecordingBackend::new());
    let (rt, client) = start_runtime(backend.clone()).await;
    let wid = laundry_workflow_id("load-5");

    let params = LaundryParams {
        laundry_id: "load-5".into(),
        user_id: "user-1".into(),
        household_id: "house-1".into(),
        load_type: "normal".into(),
        wash_time_ms: 40,
        dry_time_ms: 60_000,
        settings: LaundrySettings {
            auto_start: false,
            notify_reminders: true,
            reminder_interval_ms: 120,
            max_reminders: 2,
            ..Default::default()
        },
    };
    client
        .start_workflow_typed(&wid, workflows::WORKFLOW_LAUNDRY, &params)
        .await
        .unwrap();

    // No start_dry ever arrives: exactly two wash reminders fire, then the
    // workflow keeps waiting for the move-to-dryer signal.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let reminders = backend
        .notification_titles()
        .into_iter()
        .filter(|t| t == "Laundry Reminder")
        .count();
    assert_eq!(reminders, 2, "reminder loop must stop at max_reminders");
    assert!(matches!(
        client.get_workflow_status(&wid).await.unwrap(),
        WorkflowStatus::Running
    ));
    rt.shutdown().await;
}
