//! Shared test fixtures: a recording household backend that counts calls and
//! remembers idempotency keys.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;

use houseflow::workflows::activities::*;
use houseflow::workflows::HouseholdBackend;

#[derive(Debug, Clone)]
pub struct Call {
    pub activity: String,
    pub idempotency_key: String,
    pub detail: String,
}

/// Backend that records every invocation in order. `check_task_completion`
/// consults the set populated by [`RecordingBackend::mark_task_completed`].
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<Call>>,
    completed_tasks: Mutex<HashSet<String>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, activity: &str, key: &str, detail: impl Into<String>) {
        self.calls.lock().unwrap().push(Call {
            activity: activity.to_string(),
            idempotency_key: key.to_string(),
            detail: detail.into(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Activity names in invocation order.
    pub fn call_order(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.activity).collect()
    }

    pub fn count(&self, activity: &str) -> usize {
        self.calls().iter().filter(|c| c.activity == activity).count()
    }

    /// Notification titles in send order.
    pub fn notification_titles(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.activity == ACTIVITY_SEND_NOTIFICATION)
            .map(|c| c.detail)
            .collect()
    }

    /// Distinct idempotency keys seen for one activity name.
    pub fn distinct_keys(&self, activity: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.activity == activity)
            .map(|c| c.idempotency_key.clone())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn mark_task_completed(&self, occurrence_id: &str) {
        self.completed_tasks.lock().unwrap().insert(occurrence_id.to_string());
    }
}

#[async_trait::async_trait]
impl HouseholdBackend for RecordingBackend {
    async fn start_timer(&self, key: &str, req: StartTimerRequest) -> Result<(), String> {
        self.record(ACTIVITY_START_TIMER, key, req.timer_id);
        Ok(())
    }

    async fn complete_timer(&self, key: &str, req: CompleteTimerRequest) -> Result<(), String> {
        self.record(
            ACTIVITY_COMPLETE_TIMER,
            key,
            format!("{}:{}:{}:{}", req.timer_id, req.status, req.elapsed_ms, req.paused_ms),
        );
        Ok(())
    }

    async fn start_laundry(&self, key: &str, req: StartLaundryRequest) -> Result<(), String> {
        self.record(ACTIVITY_START_LAUNDRY, key, req.laundry_id);
        Ok(())
    }

    async fn complete_laundry(&self, key: &str, req: CompleteLaundryRequest) -> Result<(), String> {
        self.record(
            ACTIVITY_COMPLETE_LAUNDRY,
            key,
            format!("{}:{}:{}:{}", req.laundry_id, req.wash_ms, req.dry_ms, req.total_ms),
        );
        Ok(())
    }

    async fn send_notification(&self, key: &str, req: NotificationRequest) -> Result<(), String> {
        self.record(ACTIVITY_SEND_NOTIFICATION, key, req.title);
        Ok(())
    }

    async fn update_task(&self, key: &str, req: UpdateTaskRequest) -> Result<(), String> {
        self.record(ACTIVITY_UPDATE_TASK, key, req.task_id);
        Ok(())
    }

    async fn update_device_state(&self, key: &str, req: UpdateDeviceStateRequest) -> Result<(), String> {
        self.record(ACTIVITY_UPDATE_DEVICE_STATE, key, req.device_id);
        Ok(())
    }

    async fn log_activity(&self, key: &str, data: serde_json::Value) -> Result<(), String> {
        self.record(ACTIVITY_LOG_ACTIVITY, key, data.to_string());
        Ok(())
    }

    async fn send_webhook(&self, key: &str, req: WebhookRequest) -> Result<(), String> {
        self.record(ACTIVITY_SEND_WEBHOOK, key, req.url);
        Ok(())
    }

    async fn create_task_occurrence(&self, key: &str, req: CreateTaskOccurrenceRequest) -> Result<(), String> {
        self.record(
            ACTIVITY_CREATE_TASK_OCCURRENCE,
            key,
            format!("{}:{}", req.occurrence_id, req.assigned_to.clone().unwrap_or_default()),
        );
        Ok(())
    }

    async fn check_task_completion(&self, key: &str, req: CheckTaskCompletionRequest) -> Result<bool, String> {
        self.record(ACTIVITY_CHECK_TASK_COMPLETION, key, req.occurrence_id.clone());
        Ok(self.completed_tasks.lock().unwrap().contains(&req.occurrence_id))
    }
}
