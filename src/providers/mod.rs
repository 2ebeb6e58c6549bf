//! Storage abstraction for durable workflow execution.
//!
//! A provider owns persistence and queueing; the runtime owns every
//! orchestration decision. Providers store events and work items as opaque
//! data, manage peek-lock leases, and make `ack_workflow_task` the atomic
//! commit boundary for a workflow turn. They never create events, never
//! inspect event contents to make decisions, and never generate event ids —
//! the runtime computes all of that and hands it down.

use crate::{Event, RetryPolicy};
use std::time::Duration;

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;

/// Identity of a queued activity task, used to purge work for workflows that
/// reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTaskId {
    pub workflow_id: String,
    pub activity_id: u64,
}

/// Durable header kept beside each workflow's event segment.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowHeader {
    pub workflow_id: String,
    pub workflow_type: String,
    /// "Running" | "Completed" | "Failed" | "Canceled".
    pub status: String,
    pub run_id: String,
    pub task_queue: String,
    pub created_at_ms: u64,
    pub last_event_id: u64,
}

impl WorkflowHeader {
    pub fn is_terminal(&self) -> bool {
        self.status != "Running"
    }
}

/// A locked batch of work for one workflow instance.
///
/// The provider guarantees that while the lease is live no other worker can
/// fetch this instance; `ack_workflow_task` (with a matching cursor) or
/// `abandon_workflow_task` releases it. All visible messages for the instance
/// are drained into one batch, which is what coalesces bursts of appends into
/// a single workflow task.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub workflow_id: String,
    /// Empty string until the first turn persists a header.
    pub workflow_type: String,
    /// Task queue the instance runs on.
    pub task_queue: String,
    /// Complete history, ordered by event_id.
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lease_token: String,
    /// Times this batch has been fetched (poison detection).
    pub attempt: u32,
}

/// Run state computed by the runtime for the provider to persist blindly.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    /// New status, or None to keep the current one.
    pub status: Option<String>,
    /// Terminal output or error display, when status is terminal.
    pub output: Option<String>,
    /// Set on the first turn of a new workflow.
    pub workflow_type: Option<String>,
    pub run_id: Option<String>,
    pub task_queue: Option<String>,
}

/// Messages that flow through provider-managed queues.
///
/// Routing: `ActivityExecute` goes to the activity queue, `TimerSchedule` to
/// the timer queue, everything else to the workflow queue of the target
/// instance. `TimerFired` items may be enqueued with delayed visibility when
/// the provider supports it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub enum WorkItem {
    StartWorkflow {
        workflow_id: String,
        workflow_type: String,
        input: String,
        task_queue: String,
        parent_workflow_id: Option<String>,
        parent_event_id: Option<u64>,
    },
    ActivityExecute {
        workflow_id: String,
        /// event_id of the ActivityScheduled event.
        activity_id: u64,
        name: String,
        input: String,
        policy: RetryPolicy,
        attempt: u32,
        task_queue: String,
        /// Absolute schedule-to-close deadline (ms since epoch), when set.
        deadline_ms: Option<u64>,
    },
    /// Worker began an attempt; recorded as an informational history event.
    ActivityStarted {
        workflow_id: String,
        activity_id: u64,
        attempt: u32,
    },
    ActivityCompleted {
        workflow_id: String,
        activity_id: u64,
        output: String,
    },
    /// Raw failure report from a worker. The workflow dispatcher applies the
    /// retry policy: it either records a pending retry or the terminal failure.
    ActivityFailed {
        workflow_id: String,
        activity_id: u64,
        attempt: u32,
        details: crate::ErrorDetails,
    },
    TimerSchedule {
        workflow_id: String,
        /// event_id of the TimerScheduled event.
        timer_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        workflow_id: String,
        timer_id: u64,
        fire_at_ms: u64,
    },
    SignalWorkflow {
        workflow_id: String,
        name: String,
        payload: String,
    },
    ChildCompleted {
        parent_workflow_id: String,
        /// event_id of the parent's ChildWorkflowScheduled event.
        child_event_id: u64,
        output: String,
    },
    ChildFailed {
        parent_workflow_id: String,
        child_event_id: u64,
        details: crate::ErrorDetails,
    },
    CancelWorkflow {
        workflow_id: String,
        reason: String,
    },
    /// Hard stop: terminal event appended directly, cleanup bypassed.
    TerminateWorkflow {
        workflow_id: String,
        reason: String,
    },
}

impl WorkItem {
    /// The workflow instance whose queue this item belongs on.
    pub fn target_workflow_id(&self) -> &str {
        match self {
            WorkItem::StartWorkflow { workflow_id, .. }
            | WorkItem::ActivityExecute { workflow_id, .. }
            | WorkItem::ActivityStarted { workflow_id, .. }
            | WorkItem::ActivityCompleted { workflow_id, .. }
            | WorkItem::ActivityFailed { workflow_id, .. }
            | WorkItem::TimerSchedule { workflow_id, .. }
            | WorkItem::TimerFired { workflow_id, .. }
            | WorkItem::SignalWorkflow { workflow_id, .. }
            | WorkItem::CancelWorkflow { workflow_id, .. }
            | WorkItem::TerminateWorkflow { workflow_id, .. } => workflow_id,
            WorkItem::ChildCompleted { parent_workflow_id, .. }
            | WorkItem::ChildFailed { parent_workflow_id, .. } => parent_workflow_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartWorkflow { .. } => "StartWorkflow",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityStarted { .. } => "ActivityStarted",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerSchedule { .. } => "TimerSchedule",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::SignalWorkflow { .. } => "SignalWorkflow",
            WorkItem::ChildCompleted { .. } => "ChildCompleted",
            WorkItem::ChildFailed { .. } => "ChildFailed",
            WorkItem::CancelWorkflow { .. } => "CancelWorkflow",
            WorkItem::TerminateWorkflow { .. } => "TerminateWorkflow",
        }
    }
}

/// Storage provider contract.
///
/// # Peek-lock
///
/// Every dequeue is peek-lock: the item stays invisible under a lease token
/// until acked (deleted) or abandoned/expired (visible again). This gives
/// at-least-once delivery across worker crashes.
///
/// # Atomic ack
///
/// `ack_workflow_task` commits one workflow turn: history append, run
/// metadata, new queue items, canceled-activity purge, and lease release must
/// succeed or fail together. The append is additionally gated on
/// `expected_last_event_id`; a mismatch returns a conflict error and commits
/// nothing — that is what serializes workflow progress even if a stale lease
/// holder comes back from the dead.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str {
        "unknown"
    }

    /// Whether `enqueue_workflow_item` honors `visible_in` natively. When
    /// false the runtime runs its in-process timer service for timer delays.
    fn supports_delayed_visibility(&self) -> bool {
        false
    }

    // ===== workflow queue =====

    /// Enqueue a message for a workflow instance, optionally invisible for
    /// `visible_in`.
    async fn enqueue_workflow_item(
        &self,
        item: WorkItem,
        visible_in: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Lease the next workflow batch: pick an instance with visible messages
    /// and no live lease, lock it, drain all its visible messages, and return
    /// them with the full history.
    async fn fetch_workflow_task(
        &self,
        queues: &[String],
        lease: Duration,
    ) -> Result<Option<WorkflowTask>, ProviderError>;

    /// Commit a workflow turn. Returns the new last_event_id. Fails with a
    /// conflict error when `expected_last_event_id` does not match the stored
    /// cursor (stale lease).
    #[allow(clippy::too_many_arguments)]
    async fn ack_workflow_task(
        &self,
        lease_token: &str,
        expected_last_event_id: u64,
        history_delta: Vec<Event>,
        activity_items: Vec<(WorkItem, Option<Duration>)>,
        timer_items: Vec<WorkItem>,
        workflow_items: Vec<WorkItem>,
        metadata: RunMetadata,
        canceled_activities: Vec<ActivityTaskId>,
    ) -> Result<u64, ProviderError>;

    /// Release a lease without committing; messages become visible again
    /// after `delay` (immediately when None).
    async fn abandon_workflow_task(
        &self,
        lease_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    // ===== activity queue =====

    async fn fetch_activity_task(
        &self,
        queues: &[String],
        lease: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Extend a live activity lease (heartbeat-driven renewal).
    async fn renew_activity_lease(&self, lease_token: &str, lease: Duration) -> Result<(), ProviderError>;

    async fn ack_activity_task(&self, lease_token: &str) -> Result<(), ProviderError>;

    // ===== timer queue =====

    /// Dequeue the nearest-deadline pending timer (peek-lock). Consumed by
    /// the in-process timer service.
    async fn dequeue_timer_task(&self) -> Result<Option<(WorkItem, String)>, ProviderError>;

    async fn ack_timer_task(&self, lease_token: &str) -> Result<(), ProviderError>;

    // ===== history =====

    /// Full ordered history for a workflow (empty when unknown).
    async fn read(&self, workflow_id: &str) -> Result<Vec<Event>, ProviderError>;

    /// Ordered slice of history: events with `from_event_id <= event_id` and,
    /// when `to_event_id` is Some, `event_id <= to_event_id`.
    async fn read_range(
        &self,
        workflow_id: &str,
        from_event_id: u64,
        to_event_id: Option<u64>,
    ) -> Result<Vec<Event>, ProviderError> {
        let events = self.read(workflow_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.event_id >= from_event_id && to_event_id.map(|t| e.event_id <= t).unwrap_or(true))
            .collect())
    }

    async fn describe(&self, workflow_id: &str) -> Result<Option<WorkflowHeader>, ProviderError>;

    async fn list_workflows(&self) -> Result<Vec<String>, ProviderError>;

    /// Retention enforcement: drop history and header of terminal workflows
    /// whose last event predates `cutoff_ms`. Returns how many were removed.
    async fn truncate_completed_before(&self, cutoff_ms: u64) -> Result<u64, ProviderError>;

    /// Remove one workflow's history and header. Callers must only purge
    /// terminal workflows; this is what frees an id for reuse.
    async fn purge_workflow(&self, workflow_id: &str) -> Result<(), ProviderError>;
}
