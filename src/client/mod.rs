//! Client facade for workflow control-plane operations.
//!
//! The client communicates with the runtime only through the shared provider,
//! so it can live in any process — including one without a running runtime.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::providers::{Provider, ProviderError, WorkItem, WorkflowHeader};
use crate::runtime::WorkflowStatus;
use crate::{codec, CANCELED_ERROR_PREFIX, DEFAULT_TASK_QUEUE};

/// Client-side errors: provider failures plus validation outcomes.
#[derive(Debug, Clone)]
pub enum ClientError {
    Provider(ProviderError),
    /// An active run already exists and the reuse policy forbids another.
    AlreadyExists { workflow_id: String },
    /// Signal/cancel target does not exist (strict mode only).
    NotFound { workflow_id: String },
    InvalidInput { message: String },
    Timeout,
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Provider(e) => e.is_retryable(),
            ClientError::Timeout => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "{e}"),
            ClientError::AlreadyExists { workflow_id } => {
                write!(f, "workflow {workflow_id} already has an active run")
            }
            ClientError::NotFound { workflow_id } => write!(f, "workflow {workflow_id} not found"),
            ClientError::InvalidInput { message } => write!(f, "invalid input: {message}"),
            ClientError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Whether `start_workflow` may reuse a workflow id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowIdReusePolicy {
    /// Reject when any run (active or terminal) exists under the id.
    RejectDuplicate,
    /// Reject only while a run is active; terminal ids may start fresh.
    #[default]
    AllowIfTerminated,
}

/// Start options beyond type/id/input.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub task_queue: String,
    pub reuse_policy: WorkflowIdReusePolicy,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            reuse_policy: WorkflowIdReusePolicy::default(),
        }
    }
}

// Polling backoff for wait_for_workflow.
const INITIAL_POLL_DELAY_MS: u64 = 5;
const MAX_POLL_DELAY_MS: u64 = 100;
const POLL_DELAY_MULTIPLIER: u64 = 2;

/// Control-plane client: start, signal, cancel, terminate, describe, wait.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
    /// When true, signals/cancels to unknown workflows return `NotFound`
    /// instead of being dropped.
    strict_signals: bool,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self {
            store,
            strict_signals: false,
        }
    }

    /// Opt into errors (rather than silent no-ops) when signaling unknown or
    /// terminated workflows.
    pub fn with_strict_signals(mut self, strict: bool) -> Self {
        self.strict_signals = strict;
        self
    }

    /// Start a workflow with default options. Workflow ids follow the
    /// `{type}-{domain_id}` convention (e.g. `timer-<uuid>`).
    pub async fn start_workflow(
        &self,
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_workflow_with_options(workflow_id, workflow_type, input, StartOptions::default())
            .await
    }

    pub async fn start_workflow_with_options(
        &self,
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: impl Into<String>,
        options: StartOptions,
    ) -> Result<(), ClientError> {
        let workflow_id = workflow_id.into();
        if let Some(header) = self.store.describe(&workflow_id).await? {
            let reject = match options.reuse_policy {
                WorkflowIdReusePolicy::RejectDuplicate => true,
                WorkflowIdReusePolicy::AllowIfTerminated => !header.is_terminal(),
            };
            if reject {
                return Err(ClientError::AlreadyExists { workflow_id });
            }
            // Reusing a terminated id: the old run's history must go, or the
            // dispatcher would drop the fresh start as a message for a
            // terminal workflow.
            self.store.purge_workflow(&workflow_id).await?;
        }
        let item = WorkItem::StartWorkflow {
            workflow_id,
            workflow_type: workflow_type.into(),
            input: input.into(),
            task_queue: options.task_queue,
            parent_workflow_id: None,
            parent_event_id: None,
        };
        self.store.enqueue_workflow_item(item, None).await.map_err(ClientError::from)
    }

    /// Typed start: input serialized as JSON.
    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = codec::encode(input).map_err(|e| ClientError::InvalidInput {
            message: format!("encode: {e}"),
        })?;
        self.start_workflow(workflow_id, workflow_type, payload).await
    }

    pub async fn start_workflow_typed_with_options<In: Serialize>(
        &self,
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: &In,
        options: StartOptions,
    ) -> Result<(), ClientError> {
        let payload = codec::encode(input).map_err(|e| ClientError::InvalidInput {
            message: format!("encode: {e}"),
        })?;
        self.start_workflow_with_options(workflow_id, workflow_type, payload, options)
            .await
    }

    /// Deliver a signal to a workflow's named FIFO channel. Appends a
    /// `SignalReceived` event in history order; by default a no-op when the
    /// workflow is unknown or already terminal.
    pub async fn signal_workflow(
        &self,
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        let workflow_id = workflow_id.into();
        match self.store.describe(&workflow_id).await? {
            Some(header) if !header.is_terminal() => {}
            Some(_) | None => {
                if self.strict_signals {
                    return Err(ClientError::NotFound { workflow_id });
                }
                warn!(workflow_id, "signal target unknown or terminal; dropping");
                return Ok(());
            }
        }
        let item = WorkItem::SignalWorkflow {
            workflow_id,
            name: name.into(),
            payload: payload.into(),
        };
        self.store.enqueue_workflow_item(item, None).await.map_err(ClientError::from)
    }

    pub async fn signal_workflow_typed<T: Serialize>(
        &self,
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        payload: &T,
    ) -> Result<(), ClientError> {
        let encoded = codec::encode(payload).map_err(|e| ClientError::InvalidInput {
            message: format!("encode: {e}"),
        })?;
        self.signal_workflow(workflow_id, name, encoded).await
    }

    /// Request cooperative cancellation: pending awaits resolve with a
    /// canceled error on the next turn; the workflow may run cleanup before
    /// terminating.
    pub async fn cancel_workflow(
        &self,
        workflow_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        let workflow_id = workflow_id.into();
        match self.store.describe(&workflow_id).await? {
            Some(header) if !header.is_terminal() => {}
            Some(_) | None => {
                if self.strict_signals {
                    return Err(ClientError::NotFound { workflow_id });
                }
                return Ok(());
            }
        }
        let item = WorkItem::CancelWorkflow {
            workflow_id,
            reason: reason.into(),
        };
        self.store.enqueue_workflow_item(item, None).await.map_err(ClientError::from)
    }

    /// Hard stop: appends the terminal event directly, bypassing workflow
    /// cleanup.
    pub async fn terminate_workflow(
        &self,
        workflow_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        let item = WorkItem::TerminateWorkflow {
            workflow_id: workflow_id.into(),
            reason: reason.into(),
        };
        self.store.enqueue_workflow_item(item, None).await.map_err(ClientError::from)
    }

    /// Durable header for a workflow, if it exists.
    pub async fn describe_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowHeader>, ClientError> {
        Ok(self.store.describe(workflow_id).await?)
    }

    /// Current status, derived from the header and terminal event.
    pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, ClientError> {
        let Some(header) = self.store.describe(workflow_id).await? else {
            return Ok(WorkflowStatus::NotFound);
        };
        if !header.is_terminal() {
            return Ok(WorkflowStatus::Running);
        }
        // Terminal detail comes from the last event of the history.
        let history = self.store.read(workflow_id).await?;
        let status = match history.iter().rev().find(|e| e.is_terminal()).map(|e| &e.kind) {
            Some(crate::EventKind::WorkflowCompleted { output }) => WorkflowStatus::Completed {
                output: output.clone(),
            },
            Some(crate::EventKind::WorkflowFailed { details }) => WorkflowStatus::Failed {
                error: details.display_message(),
            },
            Some(crate::EventKind::WorkflowCanceled { reason }) => WorkflowStatus::Canceled {
                reason: reason.clone(),
            },
            _ => match header.status.as_str() {
                "Completed" => WorkflowStatus::Completed {
                    output: header.status.clone(),
                },
                "Canceled" => WorkflowStatus::Canceled {
                    reason: String::new(),
                },
                _ => WorkflowStatus::Failed {
                    error: header.status.clone(),
                },
            },
        };
        Ok(status)
    }

    /// Poll until the workflow reaches a terminal status or `timeout` passes.
    /// Backoff grows 5 → 100 ms.
    pub async fn wait_for_workflow(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = INITIAL_POLL_DELAY_MS;
        loop {
            match self.get_workflow_status(workflow_id).await? {
                WorkflowStatus::Running | WorkflowStatus::NotFound => {}
                terminal => return Ok(terminal),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay = (delay * POLL_DELAY_MULTIPLIER).min(MAX_POLL_DELAY_MS);
        }
    }

    /// Full ordered event history (empty when unknown).
    pub async fn read_history(&self, workflow_id: &str) -> Result<Vec<crate::Event>, ClientError> {
        Ok(self.store.read(workflow_id).await?)
    }

    /// Convenience: did the workflow end as canceled?
    pub async fn is_canceled(&self, workflow_id: &str) -> Result<bool, ClientError> {
        match self.get_workflow_status(workflow_id).await? {
            WorkflowStatus::Canceled { .. } => Ok(true),
            WorkflowStatus::Failed { error } => Ok(error.starts_with(CANCELED_ERROR_PREFIX)),
            _ => Ok(false),
        }
    }
}
