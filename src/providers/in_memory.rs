//! In-memory provider: the default store for tests and examples.
//!
//! Everything lives behind one async mutex. Queues are simple vectors with
//! `visible_at` stamps and peek-lock tokens; instance-level locks serialize
//! workflow batches; the append path enforces the event-id cursor the same
//! way a durable provider must.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{ActivityTaskId, Provider, ProviderError, RunMetadata, WorkItem, WorkflowHeader, WorkflowTask};
use crate::{now_ms, Event};

#[derive(Debug, Clone)]
struct QueuedMessage {
    item: WorkItem,
    visible_at_ms: u64,
    lock_token: Option<String>,
    locked_until_ms: u64,
}

impl QueuedMessage {
    fn new(item: WorkItem, visible_in: Option<Duration>) -> Self {
        Self {
            item,
            visible_at_ms: now_ms() + visible_in.map(|d| d.as_millis() as u64).unwrap_or(0),
            lock_token: None,
            locked_until_ms: 0,
        }
    }

    fn available(&self, now: u64) -> bool {
        self.visible_at_ms <= now && (self.lock_token.is_none() || self.locked_until_ms <= now)
    }
}

#[derive(Debug, Clone)]
struct InstanceLock {
    token: String,
    until_ms: u64,
}

#[derive(Default)]
struct State {
    histories: HashMap<String, Vec<Event>>,
    headers: HashMap<String, WorkflowHeader>,
    workflow_q: Vec<QueuedMessage>,
    activity_q: Vec<QueuedMessage>,
    timer_q: Vec<QueuedMessage>,
    instance_locks: HashMap<String, InstanceLock>,
}

impl State {
    fn last_event_id(&self, workflow_id: &str) -> u64 {
        self.histories
            .get(workflow_id)
            .and_then(|h| h.last())
            .map(|e| e.event_id)
            .unwrap_or(0)
    }

    /// Task queue an instance's workflow messages belong to: the persisted
    /// header wins, otherwise the pending StartWorkflow item names it.
    fn instance_queue(&self, workflow_id: &str) -> Option<String> {
        if let Some(h) = self.headers.get(workflow_id) {
            return Some(h.task_queue.clone());
        }
        self.workflow_q.iter().find_map(|m| match &m.item {
            WorkItem::StartWorkflow {
                workflow_id: wid,
                task_queue,
                ..
            } if wid == workflow_id => Some(task_queue.clone()),
            _ => None,
        })
    }
}

/// Provider keeping all state in process memory. No durability; used by tests
/// and `Runtime::start`.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued (visible or leased) items per queue; test helper.
    pub async fn queue_depths(&self) -> (usize, usize, usize) {
        let s = self.state.lock().await;
        (s.workflow_q.len(), s.activity_q.len(), s.timer_q.len())
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn enqueue_workflow_item(
        &self,
        item: WorkItem,
        visible_in: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        s.workflow_q.push(QueuedMessage::new(item, visible_in));
        Ok(())
    }

    async fn fetch_workflow_task(
        &self,
        queues: &[String],
        lease: Duration,
    ) -> Result<Option<WorkflowTask>, ProviderError> {
        let now = now_ms();
        let lease_ms = lease.as_millis() as u64;
        let mut s = self.state.lock().await;

        // Pick the first instance with an available message, no live lock,
        // and a task queue this worker serves.
        let candidate = s.workflow_q.iter().find_map(|m| {
            if !m.available(now) {
                return None;
            }
            let wid = m.item.target_workflow_id().to_string();
            let locked = s
                .instance_locks
                .get(&wid)
                .map(|l| l.until_ms > now)
                .unwrap_or(false);
            if locked {
                return None;
            }
            match s.instance_queue(&wid) {
                Some(q) if queues.contains(&q) => Some((wid, q)),
                _ => None,
            }
        });
        let Some((workflow_id, task_queue)) = candidate else {
            return Ok(None);
        };

        let token = new_token();
        s.instance_locks.insert(
            workflow_id.clone(),
            InstanceLock {
                token: token.clone(),
                until_ms: now + lease_ms,
            },
        );

        // Lock and collect every visible message of the instance (coalescing).
        let mut messages = Vec::new();
        for m in s.workflow_q.iter_mut() {
            if m.item.target_workflow_id() == workflow_id && m.available(now) {
                m.lock_token = Some(token.clone());
                m.locked_until_ms = now + lease_ms;
                messages.push(m.item.clone());
            }
        }

        let history = s.histories.get(&workflow_id).cloned().unwrap_or_default();
        let workflow_type = s
            .headers
            .get(&workflow_id)
            .map(|h| h.workflow_type.clone())
            .unwrap_or_default();
        Ok(Some(WorkflowTask {
            workflow_id,
            workflow_type,
            task_queue,
            history,
            messages,
            lease_token: token,
            attempt: 1,
        }))
    }

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
    ) -> Result<u64, ProviderError> {
        let now = now_ms();
        let mut s = self.state.lock().await;

        let workflow_id = s
            .instance_locks
            .iter()
            .find(|(_, l)| l.token == lease_token)
            .map(|(wid, _)| wid.clone())
            .ok_or_else(|| ProviderError::concurrent("ack_workflow_task", "lease token is no longer held"))?;

        if s.last_event_id(&workflow_id) != expected_last_event_id {
            // Stale lease: another worker advanced the history. Drop the lock
            // and leave its messages for the current holder.
            s.instance_locks.remove(&workflow_id);
            return Err(ProviderError::concurrent(
                "ack_workflow_task",
                format!(
                    "expected cursor {expected_last_event_id}, found {}",
                    s.last_event_id(&workflow_id)
                ),
            ));
        }

        // Contiguity check mirrors what the durable providers enforce.
        let mut next = expected_last_event_id + 1;
        for e in &history_delta {
            if e.event_id != next {
                return Err(ProviderError::permanent(
                    "ack_workflow_task",
                    format!("event id gap: expected {next}, got {}", e.event_id),
                ));
            }
            next += 1;
        }

        let new_last = history_delta.last().map(|e| e.event_id).unwrap_or(expected_last_event_id);
        let created_at = history_delta.first().map(|e| e.timestamp_ms).unwrap_or(now);
        s.histories.entry(workflow_id.clone()).or_default().extend(history_delta);

        let header = s.headers.entry(workflow_id.clone()).or_insert_with(|| WorkflowHeader {
            workflow_id: workflow_id.clone(),
            workflow_type: metadata.workflow_type.clone().unwrap_or_default(),
            status: "Running".to_string(),
            run_id: metadata.run_id.clone().unwrap_or_default(),
            task_queue: metadata.task_queue.clone().unwrap_or_else(|| crate::DEFAULT_TASK_QUEUE.into()),
            created_at_ms: created_at,
            last_event_id: 0,
        });
        header.last_event_id = new_last;
        if let Some(status) = &metadata.status {
            header.status = status.clone();
        }
        if let Some(t) = &metadata.workflow_type {
            if header.workflow_type.is_empty() {
                header.workflow_type = t.clone();
            }
        }
        if let Some(r) = &metadata.run_id {
            if header.run_id.is_empty() {
                header.run_id = r.clone();
            }
        }

        // Delete acked messages and release the instance lock.
        s.workflow_q.retain(|m| m.lock_token.as_deref() != Some(lease_token));
        s.instance_locks.remove(&workflow_id);

        for (item, delay) in activity_items {
            s.activity_q.push(QueuedMessage::new(item, delay));
        }
        for item in timer_items {
            s.timer_q.push(QueuedMessage::new(item, None));
        }
        for item in workflow_items {
            s.workflow_q.push(QueuedMessage::new(item, None));
        }
        for canceled in &canceled_activities {
            s.activity_q.retain(|m| match &m.item {
                WorkItem::ActivityExecute {
                    workflow_id: wid,
                    activity_id,
                    ..
                } => !(wid == &canceled.workflow_id && *activity_id == canceled.activity_id),
                _ => true,
            });
        }
        Ok(new_last)
    }

    async fn abandon_workflow_task(
        &self,
        lease_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let now = now_ms();
        let delay_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        let mut s = self.state.lock().await;
        for m in s.workflow_q.iter_mut() {
            if m.lock_token.as_deref() == Some(lease_token) {
                m.lock_token = None;
                m.locked_until_ms = 0;
                m.visible_at_ms = now + delay_ms;
            }
        }
        s.instance_locks.retain(|_, l| l.token != lease_token);
        Ok(())
    }

    async fn fetch_activity_task(
        &self,
        queues: &[String],
        lease: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let now = now_ms();
        let mut s = self.state.lock().await;
        for m in s.activity_q.iter_mut() {
            if !m.available(now) {
                continue;
            }
            let serves = match &m.item {
                WorkItem::ActivityExecute { task_queue, .. } => queues.contains(task_queue),
                _ => false,
            };
            if !serves {
                continue;
            }
            let token = new_token();
            m.lock_token = Some(token.clone());
            m.locked_until_ms = now + lease.as_millis() as u64;
            return Ok(Some((m.item.clone(), token)));
        }
        Ok(None)
    }

    async fn renew_activity_lease(&self, lease_token: &str, lease: Duration) -> Result<(), ProviderError> {
        let now = now_ms();
        let mut s = self.state.lock().await;
        for m in s.activity_q.iter_mut() {
            if m.lock_token.as_deref() == Some(lease_token) {
                m.locked_until_ms = now + lease.as_millis() as u64;
                return Ok(());
            }
        }
        Err(ProviderError::permanent("renew_activity_lease", "unknown lease token"))
    }

    async fn ack_activity_task(&self, lease_token: &str) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        s.activity_q.retain(|m| m.lock_token.as_deref() != Some(lease_token));
        Ok(())
    }

    async fn dequeue_timer_task(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let now = now_ms();
        let mut s = self.state.lock().await;
        // Nearest deadline first.
        let mut best: Option<(usize, u64)> = None;
        for (i, m) in s.timer_q.iter().enumerate() {
            if !m.available(now) {
                continue;
            }
            if let WorkItem::TimerSchedule { fire_at_ms, .. } = &m.item {
                if best.map(|(_, f)| *fire_at_ms < f).unwrap_or(true) {
                    best = Some((i, *fire_at_ms));
                }
            }
        }
        let Some((i, _)) = best else { return Ok(None) };
        let token = new_token();
        let m = &mut s.timer_q[i];
        m.lock_token = Some(token.clone());
        // Timer leases are held until fire; effectively unbounded.
        m.locked_until_ms = u64::MAX;
        Ok(Some((m.item.clone(), token)))
    }

    async fn ack_timer_task(&self, lease_token: &str) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        s.timer_q.retain(|m| m.lock_token.as_deref() != Some(lease_token));
        Ok(())
    }

    async fn read(&self, workflow_id: &str) -> Result<Vec<Event>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.histories.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn describe(&self, workflow_id: &str) -> Result<Option<WorkflowHeader>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.headers.get(workflow_id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<String>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.headers.keys().cloned().collect())
    }

    async fn truncate_completed_before(&self, cutoff_ms: u64) -> Result<u64, ProviderError> {
        let mut s = self.state.lock().await;
        let stale: Vec<String> = s
            .headers
            .iter()
            .filter(|(wid, h)| {
                h.is_terminal()
                    && s.histories
                        .get(*wid)
                        .and_then(|hist| hist.last())
                        .map(|e| e.timestamp_ms < cutoff_ms)
                        .unwrap_or(false)
            })
            .map(|(wid, _)| wid.clone())
            .collect();
        for wid in &stale {
            s.histories.remove(wid);
            s.headers.remove(wid);
        }
        Ok(stale.len() as u64)
    }

    async fn purge_workflow(&self, workflow_id: &str) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        s.histories.remove(workflow_id);
        s.headers.remove(workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn started(workflow_id: &str, event_id: u64) -> Event {
        Event::new(
            event_id,
            workflow_id,
            None,
            now_ms(),
            EventKind::WorkflowStarted {
                workflow_type: "Test".into(),
                input: String::new(),
                task_queue: crate::DEFAULT_TASK_QUEUE.into(),
                run_id: "run-1".into(),
                seed: 7,
                parent_workflow_id: None,
                parent_event_id: None,
            },
        )
    }

    #[tokio::test]
    async fn stale_cursor_is_rejected_as_conflict() {
        let p = InMemoryProvider::new();
        p.enqueue_workflow_item(
            WorkItem::StartWorkflow {
                workflow_id: "w1".into(),
                workflow_type: "Test".into(),
                input: String::new(),
                task_queue: crate::DEFAULT_TASK_QUEUE.into(),
                parent_workflow_id: None,
                parent_event_id: None,
            },
            None,
        )
        .await
        .unwrap();
        let queues = vec![crate::DEFAULT_TASK_QUEUE.to_string()];
        let task = p
            .fetch_workflow_task(&queues, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let err = p
            .ack_workflow_task(
                &task.lease_token,
                5, // wrong: history is empty
                vec![started("w1", 6)],
                vec![],
                vec![],
                vec![],
                RunMetadata::default(),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn batch_coalesces_all_visible_messages_for_one_instance() {
        let p = InMemoryProvider::new();
        let start = WorkItem::StartWorkflow {
            workflow_id: "w1".into(),
            workflow_type: "Test".into(),
            input: String::new(),
            task_queue: crate::DEFAULT_TASK_QUEUE.into(),
            parent_workflow_id: None,
            parent_event_id: None,
        };
        p.enqueue_workflow_item(start, None).await.unwrap();
        p.enqueue_workflow_item(
            WorkItem::SignalWorkflow {
                workflow_id: "w1".into(),
                name: "go".into(),
                payload: "1".into(),
            },
            None,
        )
        .await
        .unwrap();
        let queues = vec![crate::DEFAULT_TASK_QUEUE.to_string()];
        let task = p
            .fetch_workflow_task(&queues, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.messages.len(), 2);
        // Instance is locked: nothing else to fetch.
        assert!(p
            .fetch_workflow_task(&queues, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delayed_items_stay_invisible() {
        let p = InMemoryProvider::new();
        p.enqueue_workflow_item(
            WorkItem::SignalWorkflow {
                workflow_id: "w1".into(),
                name: "go".into(),
                payload: String::new(),
            },
            Some(Duration::from_secs(60)),
        )
        .await
        .unwrap();
        let queues = vec![crate::DEFAULT_TASK_QUEUE.to_string()];
        assert!(p
            .fetch_workflow_task(&queues, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }
}
