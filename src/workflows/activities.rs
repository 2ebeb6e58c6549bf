//! Activity contracts for the household workflows.
//!
//! Every activity is delivered **at-least-once** and keyed by
//! `(workflow_id, activity_id)` — exposed as [`crate::ActivityContext::idempotency_key`].
//! Implementations of [`HouseholdBackend`] must make each operation idempotent
//! over that key: a retried attempt with the same key must not double-write
//! rows, double-send pushes, or double-count statistics.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::runtime::registry::ActivityRegistry;
use crate::ActivityContext;

// Activity names, as scheduled by workflow code.
pub const ACTIVITY_START_TIMER: &str = "StartTimer";
pub const ACTIVITY_COMPLETE_TIMER: &str = "CompleteTimer";
pub const ACTIVITY_START_LAUNDRY: &str = "StartLaundry";
pub const ACTIVITY_COMPLETE_LAUNDRY: &str = "CompleteLaundry";
pub const ACTIVITY_SEND_NOTIFICATION: &str = "SendNotification";
pub const ACTIVITY_UPDATE_TASK: &str = "UpdateTask";
pub const ACTIVITY_UPDATE_DEVICE_STATE: &str = "UpdateDeviceState";
pub const ACTIVITY_LOG_ACTIVITY: &str = "LogActivity";
pub const ACTIVITY_SEND_WEBHOOK: &str = "SendWebhook";
pub const ACTIVITY_CREATE_TASK_OCCURRENCE: &str = "CreateTaskOccurrence";
pub const ACTIVITY_CHECK_TASK_COMPLETION: &str = "CheckTaskCompletion";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartTimerRequest {
    pub timer_id: String,
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTimerRequest {
    pub timer_id: String,
    pub user_id: String,
    pub elapsed_ms: u64,
    pub paused_ms: u64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartLaundryRequest {
    pub laundry_id: String,
    pub user_id: String,
    pub household_id: String,
    pub load_type: String,
    pub settings: super::laundry::LaundrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteLaundryRequest {
    pub laundry_id: String,
    pub user_id: String,
    pub wash_ms: u64,
    pub dry_ms: u64,
    pub total_ms: u64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub user_id: String,
    pub household_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    pub task_id: String,
    pub user_id: String,
    pub household_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeviceStateRequest {
    pub device_id: String,
    pub user_id: String,
    pub household_id: String,
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub url: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskOccurrenceRequest {
    pub task_id: String,
    pub occurrence_id: String,
    pub name: String,
    pub description: String,
    pub user_id: String,
    pub household_id: String,
    pub due_date_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckTaskCompletionRequest {
    pub occurrence_id: String,
}

/// External collaborator seam: the relational store, notifier and webhook
/// plumbing behind the activities. The engine passes the idempotency key
/// (`workflow_id/activity_id`) to every call; implementations own making the
/// effect idempotent over it.
#[async_trait::async_trait]
pub trait HouseholdBackend: Send + Sync {
    async fn start_timer(&self, idempotency_key: &str, req: StartTimerRequest) -> Result<(), String>;
    async fn complete_timer(&self, idempotency_key: &str, req: CompleteTimerRequest) -> Result<(), String>;
    async fn start_laundry(&self, idempotency_key: &str, req: StartLaundryRequest) -> Result<(), String>;
    async fn complete_laundry(&self, idempotency_key: &str, req: CompleteLaundryRequest) -> Result<(), String>;
    async fn send_notification(&self, idempotency_key: &str, req: NotificationRequest) -> Result<(), String>;
    async fn update_task(&self, idempotency_key: &str, req: UpdateTaskRequest) -> Result<(), String>;
    async fn update_device_state(&self, idempotency_key: &str, req: UpdateDeviceStateRequest)
        -> Result<(), String>;
    async fn log_activity(&self, idempotency_key: &str, data: serde_json::Value) -> Result<(), String>;
    async fn send_webhook(&self, idempotency_key: &str, req: WebhookRequest) -> Result<(), String>;
    async fn create_task_occurrence(
        &self,
        idempotency_key: &str,
        req: CreateTaskOccurrenceRequest,
    ) -> Result<(), String>;
    async fn check_task_completion(
        &self,
        idempotency_key: &str,
        req: CheckTaskCompletionRequest,
    ) -> Result<bool, String>;
}

/// Build the activity registry over a backend.
pub fn registry(backend: Arc<dyn HouseholdBackend>) -> ActivityRegistry {
    let b = backend.clone();
    let builder = ActivityRegistry::builder().register_typed(
        ACTIVITY_START_TIMER,
        move |ctx: ActivityContext, req: StartTimerRequest| {
            let b = b.clone();
            async move {
                ctx.trace_info(format!("starting timer {}", req.timer_id));
                b.start_timer(&ctx.idempotency_key(), req).await
            }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_COMPLETE_TIMER,
        move |ctx: ActivityContext, req: CompleteTimerRequest| {
            let b = b.clone();
            async move {
                ctx.trace_info(format!("completing timer {} ({})", req.timer_id, req.status));
                b.complete_timer(&ctx.idempotency_key(), req).await
            }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_START_LAUNDRY,
        move |ctx: ActivityContext, req: StartLaundryRequest| {
            let b = b.clone();
            async move { b.start_laundry(&ctx.idempotency_key(), req).await }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_COMPLETE_LAUNDRY,
        move |ctx: ActivityContext, req: CompleteLaundryRequest| {
            let b = b.clone();
            async move { b.complete_laundry(&ctx.idempotency_key(), req).await }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_SEND_NOTIFICATION,
        move |ctx: ActivityContext, req: NotificationRequest| {
            let b = b.clone();
            async move {
                ctx.trace_info(format!("sending notification '{}'", req.title));
                b.send_notification(&ctx.idempotency_key(), req).await
            }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_UPDATE_TASK,
        move |ctx: ActivityContext, req: UpdateTaskRequest| {
            let b = b.clone();
            async move { b.update_task(&ctx.idempotency_key(), req).await }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_UPDATE_DEVICE_STATE,
        move |ctx: ActivityContext, req: UpdateDeviceStateRequest| {
            let b = b.clone();
            async move { b.update_device_state(&ctx.idempotency_key(), req).await }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_LOG_ACTIVITY,
        move |ctx: ActivityContext, data: serde_json::Value| {
            let b = b.clone();
            async move { b.log_activity(&ctx.idempotency_key(), data).await }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_SEND_WEBHOOK,
        move |ctx: ActivityContext, req: WebhookRequest| {
            let b = b.clone();
            async move { b.send_webhook(&ctx.idempotency_key(), req).await }
        },
    );
    let b = backend.clone();
    let builder = builder.register_typed(
        ACTIVITY_CREATE_TASK_OCCURRENCE,
        move |ctx: ActivityContext, req: CreateTaskOccurrenceRequest| {
            let b = b.clone();
            async move {
                ctx.trace_info(format!("creating occurrence {}", req.occurrence_id));
                b.create_task_occurrence(&ctx.idempotency_key(), req).await
            }
        },
    );
    let b = backend;
    builder
        .register_typed(
            ACTIVITY_CHECK_TASK_COMPLETION,
            move |ctx: ActivityContext, req: CheckTaskCompletionRequest| {
                let b = b.clone();
                async move { b.check_task_completion(&ctx.idempotency_key(), req).await }
            },
        )
        .build()
}
