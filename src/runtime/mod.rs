//! In-process runtime: worker pools over a shared provider.
//!
//! The runtime spawns a pool of workflow dispatchers (replay + turn commits),
//! a pool of activity workers (side effects with retries, timeouts and
//! heartbeats), the timer service, and a retention janitor. All coordination
//! happens through the provider; the runtime holds no workflow state of its
//! own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::providers::in_memory::InMemoryProvider;
use crate::providers::Provider;
use crate::{ActivityContext, RetryPolicy, WorkflowContext};

pub mod dispatchers;
pub mod registry;
pub mod replay;
pub mod timers;

use registry::{ActivityRegistry, WorkflowRegistry};

/// High-level workflow status derived from the persisted header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    Canceled { reason: String },
}

/// Trait implemented by workflow handlers invoked by the runtime.
#[async_trait::async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait::async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
#[async_trait::async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait::async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Visibility timeout for workflow task leases.
    pub workflow_task_lease: Duration,
    /// Visibility timeout for activity task leases (renewed by heartbeats).
    pub activity_task_lease: Duration,
    /// Per-attempt execution timeout when the activity's policy sets none.
    pub default_start_to_close_timeout: Duration,
    /// When set, an activity whose last heartbeat is older than this is
    /// failed with a retryable timeout.
    pub heartbeat_timeout: Option<Duration>,
    /// Policy applied by `schedule_activity` when no policy is given.
    pub default_retry_policy: RetryPolicy,
    /// Terminal workflows older than this are truncated by the janitor.
    pub history_retention_for_completed: Duration,
    pub retention_sweep_interval: Duration,
    pub workflow_worker_count: usize,
    pub activity_worker_count: usize,
    /// Task queues this runtime's workers serve.
    pub task_queues: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workflow_task_lease: Duration::from_secs(60),
            activity_task_lease: Duration::from_secs(300),
            default_start_to_close_timeout: Duration::from_secs(60),
            heartbeat_timeout: None,
            default_retry_policy: RetryPolicy::default(),
            history_retention_for_completed: Duration::from_secs(7 * 24 * 3600),
            retention_sweep_interval: Duration::from_secs(3600),
            workflow_worker_count: 2,
            activity_worker_count: 4,
            task_queues: vec![crate::DEFAULT_TASK_QUEUE.to_string()],
        }
    }
}

/// In-process execution engine. Dropping the handle does not stop the workers;
/// call [`Runtime::shutdown`].
pub struct Runtime {
    joins: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    workflows: WorkflowRegistry,
    options: RuntimeOptions,
    /// One cancellation token per workflow with in-flight activities.
    cancellations: std::sync::Mutex<HashMap<String, tokio_util::sync::CancellationToken>>,
}

impl Runtime {
    pub(crate) const POLLER_IDLE_SLEEP: Duration = Duration::from_millis(10);

    /// Start a runtime over a fresh in-memory provider.
    pub async fn start(
        activities: Arc<ActivityRegistry>,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::default());
        Self::start_with_store(store, activities, workflows, options).await
    }

    /// Start a runtime over an explicit provider.
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activities: Arc<ActivityRegistry>,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none is set; repeated calls are fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            joins: tokio::sync::Mutex::new(Vec::new()),
            store,
            workflows,
            options,
            cancellations: std::sync::Mutex::new(HashMap::new()),
        });

        let mut joins = Vec::new();
        for i in 0..runtime.options.workflow_worker_count {
            joins.push(dispatchers::workflow::spawn(runtime.clone(), format!("wf-worker-{i}")));
        }
        for i in 0..runtime.options.activity_worker_count {
            joins.push(dispatchers::worker::spawn(
                runtime.clone(),
                activities.clone(),
                format!("act-worker-{i}"),
            ));
        }
        joins.push(timers::spawn(runtime.clone()));
        joins.push(runtime.clone().spawn_retention_janitor());
        runtime.joins.lock().await.extend(joins);
        runtime
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.store.clone()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub(crate) fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// Shared cancellation token for a workflow's in-flight activities.
    pub(crate) fn cancellation_for(&self, workflow_id: &str) -> tokio_util::sync::CancellationToken {
        self.cancellations
            .lock()
            .expect("cancellation map mutex poisoned")
            .entry(workflow_id.to_string())
            .or_default()
            .clone()
    }

    /// Trigger and forget the token once a workflow reaches a terminal state.
    pub(crate) fn cancel_inflight_activities(&self, workflow_id: &str) {
        if let Some(token) = self
            .cancellations
            .lock()
            .expect("cancellation map mutex poisoned")
            .remove(workflow_id)
        {
            token.cancel();
        }
    }

    /// Synchronous read-only query: replays the workflow's history (appending
    /// nothing) and returns the value last published under `name` with
    /// [`WorkflowContext::expose_query`]. `Ok(None)` when the workflow never
    /// exposed that name.
    pub async fn query_workflow(&self, workflow_id: &str, name: &str) -> Result<Option<String>, String> {
        let header = self
            .store
            .describe(workflow_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("workflow not found: {workflow_id}"))?;
        let handler = self
            .workflows
            .get(&header.workflow_type)
            .ok_or_else(|| format!("unregistered workflow type: {}", header.workflow_type))?;
        let history = self.store.read(workflow_id).await.map_err(|e| e.to_string())?;
        let ctx = replay::replay_for_query(
            workflow_id,
            &header.workflow_type,
            history,
            handler,
            self.options.default_retry_policy.clone(),
        )
        .map_err(|e| e.display_message())?;
        Ok(ctx.query_value(name))
    }

    fn spawn_retention_janitor(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.options.retention_sweep_interval).await;
                let cutoff = crate::now_ms()
                    .saturating_sub(self.options.history_retention_for_completed.as_millis() as u64);
                match self.store.truncate_completed_before(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(removed = n, "retention janitor truncated completed workflows"),
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
            }
        })
    }

    /// Abort background workers. In-flight turns lose their leases and are
    /// re-delivered after expiry, so shutdown is safe at any point.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }
}
