//! Workflow dispatcher: leases batches, runs deterministic turns, commits
//! atomically.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{WorkItem, WorkflowTask};
use crate::runtime::replay::{self, TurnInput};
use crate::runtime::Runtime;

pub(crate) fn spawn(runtime: Arc<Runtime>, worker_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let fetched = runtime
                .store()
                .fetch_workflow_task(&runtime.options().task_queues, runtime.options().workflow_task_lease)
                .await;
            match fetched {
                Ok(Some(task)) => process(&runtime, &worker_id, task).await,
                Ok(None) => tokio::time::sleep(Runtime::POLLER_IDLE_SLEEP).await,
                Err(e) => {
                    warn!(worker_id, error = %e, "fetch_workflow_task failed");
                    tokio::time::sleep(Runtime::POLLER_IDLE_SLEEP).await;
                }
            }
        }
    })
}

async fn process(runtime: &Arc<Runtime>, worker_id: &str, task: WorkflowTask) {
    let workflow_id = task.workflow_id.clone();
    let lease_token = task.lease_token.clone();

    // Type comes from the header, or from the start message on first contact.
    let workflow_type = if !task.workflow_type.is_empty() {
        task.workflow_type.clone()
    } else {
        task.messages
            .iter()
            .find_map(|m| match m {
                WorkItem::StartWorkflow { workflow_type, .. } => Some(workflow_type.clone()),
                _ => None,
            })
            .unwrap_or_default()
    };

    let Some(handler) = runtime.workflows().get(&workflow_type) else {
        // Unregistered type: leave the batch for a worker that knows it (or a
        // redeploy). The lease delay keeps this from spinning.
        warn!(
            worker_id,
            workflow_id,
            workflow_type,
            "no handler registered for workflow type; abandoning task"
        );
        let _ = runtime
            .store()
            .abandon_workflow_task(&lease_token, Some(runtime.options().workflow_task_lease))
            .await;
        return;
    };

    let expected_last_event_id = task.history.last().map(|e| e.event_id).unwrap_or(0);
    debug!(
        worker_id,
        workflow_id,
        workflow_type,
        messages = task.messages.len(),
        history_len = task.history.len(),
        "processing workflow task"
    );

    let input = TurnInput {
        workflow_id: workflow_id.clone(),
        workflow_type,
        task_queue: task.task_queue.clone(),
        history: task.history,
        messages: task.messages,
        default_retry_policy: runtime.options().default_retry_policy.clone(),
    };

    match replay::execute_turn(input, handler) {
        Ok(outcome) => {
            let terminal = outcome.terminal;
            let ack = runtime
                .store()
                .ack_workflow_task(
                    &lease_token,
                    expected_last_event_id,
                    outcome.history_delta,
                    outcome.activity_items,
                    outcome.timer_items,
                    outcome.workflow_items,
                    outcome.metadata,
                    outcome.canceled_activities,
                )
                .await;
            match ack {
                Ok(_) => {
                    if terminal {
                        runtime.cancel_inflight_activities(&workflow_id);
                    }
                }
                Err(e) if e.is_conflict() => {
                    // Another worker advanced the history first; our turn is
                    // discarded and the surviving messages re-fetched.
                    debug!(worker_id, workflow_id, error = %e, "turn lost optimistic concurrency race");
                    let _ = runtime.store().abandon_workflow_task(&lease_token, None).await;
                }
                Err(e) => {
                    warn!(worker_id, workflow_id, error = %e, "ack_workflow_task failed; abandoning");
                    let _ = runtime
                        .store()
                        .abandon_workflow_task(&lease_token, Some(Runtime::POLLER_IDLE_SLEEP))
                        .await;
                }
            }
        }
        Err(details) => {
            // Replay nondeterminism (or corrupted history): the workflow is
            // stuck until a code fix ships. Surface loudly and retry later.
            error!(
                worker_id,
                workflow_id,
                category = details.category(),
                "fatal turn error: {}",
                details.display_message()
            );
            let _ = runtime
                .store()
                .abandon_workflow_task(&lease_token, Some(runtime.options().workflow_task_lease))
                .await;
        }
    }
}
