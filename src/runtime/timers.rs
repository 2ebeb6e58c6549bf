//! Timer service: drives pending durable timers to their fire time.
//!
//! Pulls `TimerSchedule` tasks from the provider's timer queue into a
//! min-heap ordered by fire time, sleeps until the nearest deadline, then
//! enqueues `TimerFired` to the owning workflow's queue and acks the timer
//! task. Providers with native delayed visibility get the fired item enqueued
//! immediately with a visibility delay instead.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::now_ms;
use crate::providers::WorkItem;

use super::Runtime;

struct PendingTimer {
    workflow_id: String,
    timer_id: u64,
    fire_at_ms: u64,
    ack_token: String,
}

pub(crate) fn spawn(runtime: Arc<Runtime>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut heap: BinaryHeap<Reverse<(u64, u64)>> = BinaryHeap::new();
        let mut pending: std::collections::HashMap<u64, PendingTimer> = std::collections::HashMap::new();
        let mut next_slot: u64 = 0;
        loop {
            // Intake: drain everything currently visible on the timer queue.
            loop {
                match runtime.store().dequeue_timer_task().await {
                    Ok(Some((
                        WorkItem::TimerSchedule {
                            workflow_id,
                            timer_id,
                            fire_at_ms,
                        },
                        ack_token,
                    ))) => {
                        if runtime.store().supports_delayed_visibility() {
                            let delay = fire_at_ms.saturating_sub(now_ms());
                            let fired = WorkItem::TimerFired {
                                workflow_id,
                                timer_id,
                                fire_at_ms,
                            };
                            let visible_in = (delay > 0).then(|| Duration::from_millis(delay));
                            if runtime.store().enqueue_workflow_item(fired, visible_in).await.is_ok() {
                                let _ = runtime.store().ack_timer_task(&ack_token).await;
                            }
                            continue;
                        }
                        let slot = next_slot;
                        next_slot += 1;
                        heap.push(Reverse((fire_at_ms, slot)));
                        pending.insert(
                            slot,
                            PendingTimer {
                                workflow_id,
                                timer_id,
                                fire_at_ms,
                                ack_token,
                            },
                        );
                    }
                    Ok(Some((other, ack_token))) => {
                        warn!(kind = other.kind(), "unexpected item on timer queue; acking");
                        let _ = runtime.store().ack_timer_task(&ack_token).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "dequeue_timer_task failed");
                        break;
                    }
                }
            }

            // Fire everything due. Ack only after the fired item is enqueued.
            let now = now_ms();
            while let Some(Reverse((fire_at, slot))) = heap.peek().copied() {
                if fire_at > now {
                    break;
                }
                heap.pop();
                let Some(timer) = pending.remove(&slot) else {
                    continue;
                };
                let fired = WorkItem::TimerFired {
                    workflow_id: timer.workflow_id.clone(),
                    timer_id: timer.timer_id,
                    fire_at_ms: timer.fire_at_ms,
                };
                match runtime.store().enqueue_workflow_item(fired, None).await {
                    Ok(()) => {
                        let _ = runtime.store().ack_timer_task(&timer.ack_token).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to enqueue TimerFired; will retry");
                        heap.push(Reverse((fire_at, slot)));
                        pending.insert(slot, timer);
                        break;
                    }
                }
            }

            // Sleep until the nearest deadline, bounded by the intake poll.
            let sleep_ms = heap
                .peek()
                .map(|Reverse((fire_at, _))| fire_at.saturating_sub(now_ms()).max(1))
                .unwrap_or(Runtime::POLLER_IDLE_SLEEP.as_millis() as u64)
                .min(Runtime::POLLER_IDLE_SLEEP.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    })
}
