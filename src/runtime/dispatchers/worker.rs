//! Activity worker: executes side-effecting handlers off the workflow thread.
//!
//! Each attempt runs under a start-to-close timeout and an optional heartbeat
//! watchdog; heartbeats renew the provider lease so long-running activities
//! survive their visibility timeout. Results flow back to the workflow queue
//! as completion/failure items; the workflow dispatcher owns retry policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::WorkItem;
use crate::runtime::{registry::ActivityRegistry, Runtime};
use crate::{now_ms, ActivityContext, ConfigErrorKind, ErrorDetails};

pub(crate) fn spawn(runtime: Arc<Runtime>, activities: Arc<ActivityRegistry>, worker_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let fetched = runtime
                .store()
                .fetch_activity_task(&runtime.options().task_queues, runtime.options().activity_task_lease)
                .await;
            match fetched {
                Ok(Some((item, lease_token))) => {
                    if let WorkItem::ActivityExecute {
                        workflow_id,
                        activity_id,
                        name,
                        input,
                        policy,
                        attempt,
                        deadline_ms,
                        ..
                    } = item
                    {
                        execute(
                            &runtime,
                            &activities,
                            &worker_id,
                            &lease_token,
                            workflow_id,
                            activity_id,
                            name,
                            input,
                            policy,
                            attempt,
                            deadline_ms,
                        )
                        .await;
                    } else {
                        warn!(worker_id, kind = item.kind(), "unexpected item on activity queue");
                        let _ = runtime.store().ack_activity_task(&lease_token).await;
                    }
                }
                Ok(None) => tokio::time::sleep(Runtime::POLLER_IDLE_SLEEP).await,
                Err(e) => {
                    warn!(worker_id, error = %e, "fetch_activity_task failed");
                    tokio::time::sleep(Runtime::POLLER_IDLE_SLEEP).await;
                }
            }
        }
    })
}

enum AttemptEnd {
    Finished(Result<String, String>),
    TimedOut(&'static str),
    Canceled,
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    runtime: &Arc<Runtime>,
    activities: &Arc<ActivityRegistry>,
    worker_id: &str,
    lease_token: &str,
    workflow_id: String,
    activity_id: u64,
    name: String,
    input: String,
    policy: crate::RetryPolicy,
    attempt: u32,
    deadline_ms: Option<u64>,
) {
    let report = |item: WorkItem| {
        let runtime = runtime.clone();
        let lease_token = lease_token.to_string();
        async move {
            // Ack only after the result is safely enqueued; otherwise the
            // lease expires and the attempt re-runs (at-least-once).
            if runtime.store().enqueue_workflow_item(item, None).await.is_ok() {
                let _ = runtime.store().ack_activity_task(&lease_token).await;
            } else {
                warn!("failed to enqueue activity result; leaving lease to expire for redelivery");
            }
        }
    };

    // Schedule-to-close budget exhausted before this attempt even started.
    if deadline_ms.map(|d| now_ms() >= d).unwrap_or(false) {
        let details = ErrorDetails::Application {
            kind: crate::AppErrorKind::TimedOut,
            message: "schedule-to-close deadline exceeded".into(),
            retryable: false,
        };
        report(WorkItem::ActivityFailed {
            workflow_id,
            activity_id,
            attempt,
            details,
        })
        .await;
        return;
    }

    let Some(handler) = activities.get(&name) else {
        debug!(worker_id, workflow_id, activity_id, name, "unregistered activity");
        report(WorkItem::ActivityFailed {
            workflow_id,
            activity_id,
            attempt,
            details: ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredHandler,
                resource: name,
                message: None,
            },
        })
        .await;
        return;
    };

    // Record the attempt in history (observability only).
    let _ = runtime
        .store()
        .enqueue_workflow_item(
            WorkItem::ActivityStarted {
                workflow_id: workflow_id.clone(),
                activity_id,
                attempt,
            },
            None,
        )
        .await;

    let cancellation = runtime.cancellation_for(&workflow_id);
    let ctx = ActivityContext::new(
        workflow_id.clone(),
        activity_id,
        name.clone(),
        attempt,
        worker_id.to_string(),
        cancellation,
    );

    let start_to_close = policy
        .start_to_close_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(runtime.options().default_start_to_close_timeout);
    let heartbeat_timeout = runtime.options().heartbeat_timeout;
    let heartbeat_notify = ctx.heartbeat_notify();

    debug!(worker_id, workflow_id, activity_id, name, attempt, "executing activity");

    let invoke = handler.invoke(ctx.clone(), input);
    tokio::pin!(invoke);
    let timeout = tokio::time::sleep(start_to_close);
    tokio::pin!(timeout);

    let end = loop {
        // Heartbeat watchdog: stale heartbeats fail the attempt with a
        // retryable timeout. Disabled when no timeout is configured.
        let watchdog = async {
            match heartbeat_timeout {
                Some(hb) => {
                    loop {
                        let elapsed = now_ms().saturating_sub(ctx.last_heartbeat_ms());
                        let remaining = hb.as_millis() as u64 - elapsed.min(hb.as_millis() as u64);
                        if remaining == 0 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(remaining.max(10))).await;
                    }
                }
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            result = &mut invoke => break AttemptEnd::Finished(result),
            _ = &mut timeout => break AttemptEnd::TimedOut("start-to-close timeout elapsed"),
            _ = watchdog => break AttemptEnd::TimedOut("heartbeat expired"),
            _ = ctx.cancelled() => break AttemptEnd::Canceled,
            _ = heartbeat_notify.notified() => {
                // Liveness signal: extend the lease so slow activities are not
                // re-delivered mid-flight.
                let _ = runtime
                    .store()
                    .renew_activity_lease(lease_token, runtime.options().activity_task_lease)
                    .await;
            }
        }
    };

    match end {
        AttemptEnd::Finished(Ok(output)) => {
            report(WorkItem::ActivityCompleted {
                workflow_id,
                activity_id,
                output,
            })
            .await;
        }
        AttemptEnd::Finished(Err(message)) => {
            report(WorkItem::ActivityFailed {
                workflow_id,
                activity_id,
                attempt,
                details: ErrorDetails::activity_error(message),
            })
            .await;
        }
        AttemptEnd::TimedOut(reason) => {
            debug!(worker_id, workflow_id, activity_id, attempt, reason, "activity attempt timed out");
            report(WorkItem::ActivityFailed {
                workflow_id,
                activity_id,
                attempt,
                details: ErrorDetails::timed_out(reason),
            })
            .await;
        }
        AttemptEnd::Canceled => {
            // The owning workflow is terminal; a canceled activity is not
            // retried and its result would be dropped anyway.
            debug!(worker_id, workflow_id, activity_id, "activity canceled");
            let _ = runtime.store().ack_activity_task(lease_token).await;
        }
    }
}
