//! Filesystem provider: per-workflow append-only segments with fsync-gated
//! commits.
//!
//! Layout under the root directory:
//! - `{workflow_id}.events.jsonl` — the event segment, one JSON event per line
//! - `{workflow_id}.header.json`  — `WorkflowHeader` sidecar
//! - `queue.jsonl`                — journal of queue enqueues/acks
//!
//! A workflow turn commits by appending its events and syncing the segment
//! before anything is acknowledged (group commit: one `sync_data` covers the
//! whole delta). Queue state is a journal replayed on open, so unacked work
//! items survive a crash and are re-delivered — delivery is at-least-once and
//! the dispatchers deduplicate against history. Pending timers are rebuilt
//! into an in-memory index ordered by `(fire_at, workflow_id, timer_id)` for
//! nearest-deadline scans.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ActivityTaskId, Provider, ProviderError, RunMetadata, WorkItem, WorkflowHeader, WorkflowTask};
use crate::{now_ms, Event};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
enum JournalOp {
    Enqueue {
        id: String,
        queue: String,
        item: WorkItem,
        visible_at_ms: u64,
    },
    Ack {
        id: String,
    },
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: String,
    item: WorkItem,
    visible_at_ms: u64,
    lock_token: Option<String>,
    locked_until_ms: u64,
}

impl QueuedMessage {
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
struct FsState {
    headers: HashMap<String, WorkflowHeader>,
    workflow_q: Vec<QueuedMessage>,
    activity_q: Vec<QueuedMessage>,
    timer_q: Vec<QueuedMessage>,
    /// (fire_at_ms, workflow_id, timer_id) — nearest-deadline scan order.
    timer_index: BTreeSet<(u64, String, u64)>,
    instance_locks: HashMap<String, InstanceLock>,
}

/// Durable single-node provider over a local directory.
pub struct FsProvider {
    root: PathBuf,
    state: Mutex<FsState>,
}

const QUEUE_WORKFLOW: &str = "workflow";
const QUEUE_ACTIVITY: &str = "activity";
const QUEUE_TIMER: &str = "timer";

impl FsProvider {
    /// Open (or create) a store rooted at `root`, replaying the queue journal.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| ProviderError::permanent("open", format!("create root: {e}")))?;

        let mut state = FsState::default();

        // Headers.
        let mut rd = fs::read_dir(&root)
            .await
            .map_err(|e| ProviderError::permanent("open", format!("read root: {e}")))?;
        while let Ok(Some(ent)) = rd.next_entry().await {
            let name = ent.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".header.json") {
                let data = fs::read_to_string(ent.path())
                    .await
                    .map_err(|e| ProviderError::permanent("open", format!("read header: {e}")))?;
                let header: WorkflowHeader = serde_json::from_str(&data)
                    .map_err(|e| ProviderError::permanent("open", format!("decode header {stem}: {e}")))?;
                state.headers.insert(header.workflow_id.clone(), header);
            }
        }

        // Queue journal: live items are enqueues without a matching ack.
        let journal_path = root.join("queue.jsonl");
        if let Ok(data) = fs::read_to_string(&journal_path).await {
            let mut live: HashMap<String, (String, WorkItem, u64)> = HashMap::new();
            let mut order: Vec<String> = Vec::new();
            for line in data.lines().filter(|l| !l.trim().is_empty()) {
                let op: JournalOp = serde_json::from_str(line)
                    .map_err(|e| ProviderError::permanent("open", format!("decode journal: {e}")))?;
                match op {
                    JournalOp::Enqueue {
                        id,
                        queue,
                        item,
                        visible_at_ms,
                    } => {
                        if !live.contains_key(&id) {
                            order.push(id.clone());
                        }
                        live.insert(id, (queue, item, visible_at_ms));
                    }
                    JournalOp::Ack { id } => {
                        live.remove(&id);
                    }
                }
            }
            for id in order {
                let Some((queue, item, visible_at_ms)) = live.remove(&id) else {
                    continue;
                };
                let msg = QueuedMessage {
                    id,
                    item,
                    visible_at_ms,
                    lock_token: None,
                    locked_until_ms: 0,
                };
                match queue.as_str() {
                    QUEUE_ACTIVITY => state.activity_q.push(msg),
                    QUEUE_TIMER => {
                        if let WorkItem::TimerSchedule {
                            workflow_id,
                            timer_id,
                            fire_at_ms,
                        } = &msg.item
                        {
                            state
                                .timer_index
                                .insert((*fire_at_ms, workflow_id.clone(), *timer_id));
                        }
                        state.timer_q.push(msg);
                    }
                    _ => state.workflow_q.push(msg),
                }
            }
        }

        let provider = Self {
            root,
            state: Mutex::new(state),
        };
        provider.compact_journal().await?;
        Ok(provider)
    }

    fn events_path(&self, workflow_id: &str) -> PathBuf {
        self.root.join(format!("{workflow_id}.events.jsonl"))
    }

    fn header_path(&self, workflow_id: &str) -> PathBuf {
        self.root.join(format!("{workflow_id}.header.json"))
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join("queue.jsonl")
    }

    /// Rewrite the journal with only live entries. Called on open; keeps the
    /// file from growing without bound.
    async fn compact_journal(&self) -> Result<(), ProviderError> {
        let s = self.state.lock().await;
        let mut out = String::new();
        for (queue, q) in [
            (QUEUE_WORKFLOW, &s.workflow_q),
            (QUEUE_ACTIVITY, &s.activity_q),
            (QUEUE_TIMER, &s.timer_q),
        ] {
            for m in q {
                let op = JournalOp::Enqueue {
                    id: m.id.clone(),
                    queue: queue.to_string(),
                    item: m.item.clone(),
                    visible_at_ms: m.visible_at_ms,
                };
                out.push_str(&serde_json::to_string(&op).map_err(|e| {
                    ProviderError::permanent("compact_journal", format!("encode: {e}"))
                })?);
                out.push('\n');
            }
        }
        let tmp = self.root.join("queue.jsonl.tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| ProviderError::retryable("compact_journal", format!("create: {e}")))?;
        file.write_all(out.as_bytes())
            .await
            .map_err(|e| ProviderError::retryable("compact_journal", format!("write: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| ProviderError::retryable("compact_journal", format!("sync: {e}")))?;
        fs::rename(&tmp, self.journal_path())
            .await
            .map_err(|e| ProviderError::retryable("compact_journal", format!("rename: {e}")))?;
        Ok(())
    }

    async fn append_journal(&self, ops: &[JournalOp]) -> Result<(), ProviderError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for op in ops {
            out.push_str(
                &serde_json::to_string(op)
                    .map_err(|e| ProviderError::permanent("append_journal", format!("encode: {e}")))?,
            );
            out.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await
            .map_err(|e| ProviderError::retryable("append_journal", format!("open: {e}")))?;
        file.write_all(out.as_bytes())
            .await
            .map_err(|e| ProviderError::retryable("append_journal", format!("write: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| ProviderError::retryable("append_journal", format!("sync: {e}")))?;
        Ok(())
    }

    async fn write_header(&self, header: &WorkflowHeader) -> Result<(), ProviderError> {
        let data = serde_json::to_string_pretty(header)
            .map_err(|e| ProviderError::permanent("write_header", format!("encode: {e}")))?;
        let path = self.header_path(&header.workflow_id);
        let tmp = self.root.join(format!("{}.header.json.tmp", header.workflow_id));
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| ProviderError::retryable("write_header", format!("create: {e}")))?;
        file.write_all(data.as_bytes())
            .await
            .map_err(|e| ProviderError::retryable("write_header", format!("write: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| ProviderError::retryable("write_header", format!("sync: {e}")))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ProviderError::retryable("write_header", format!("rename: {e}")))?;
        Ok(())
    }

    fn enqueue_op(queue: &str, msg: &QueuedMessage) -> JournalOp {
        JournalOp::Enqueue {
            id: msg.id.clone(),
            queue: queue.to_string(),
            item: msg.item.clone(),
            visible_at_ms: msg.visible_at_ms,
        }
    }

    fn new_message(item: WorkItem, visible_in: Option<Duration>) -> QueuedMessage {
        QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            item,
            visible_at_ms: now_ms() + visible_in.map(|d| d.as_millis() as u64).unwrap_or(0),
            lock_token: None,
            locked_until_ms: 0,
        }
    }
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    fn name(&self) -> &str {
        "fs"
    }

    async fn enqueue_workflow_item(
        &self,
        item: WorkItem,
        visible_in: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let msg = Self::new_message(item, visible_in);
        self.append_journal(&[Self::enqueue_op(QUEUE_WORKFLOW, &msg)]).await?;
        self.state.lock().await.workflow_q.push(msg);
        Ok(())
    }

    async fn fetch_workflow_task(
        &self,
        queues: &[String],
        lease: Duration,
    ) -> Result<Option<WorkflowTask>, ProviderError> {
        let now = now_ms();
        let lease_ms = lease.as_millis() as u64;
        let (workflow_id, task_queue) = {
            let s = self.state.lock().await;
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
                let queue = s
                    .headers
                    .get(&wid)
                    .map(|h| h.task_queue.clone())
                    .or_else(|| {
                        s.workflow_q.iter().find_map(|m| match &m.item {
                            WorkItem::StartWorkflow {
                                workflow_id,
                                task_queue,
                                ..
                            } if workflow_id == &wid => Some(task_queue.clone()),
                            _ => None,
                        })
                    });
                match queue {
                    Some(q) if queues.contains(&q) => Some((wid, q)),
                    _ => None,
                }
            });
            match candidate {
                Some(found) => found,
                None => return Ok(None),
            }
        };

        let history = self.read(&workflow_id).await?;

        let mut s = self.state.lock().await;
        // The lock was released while reading the segment; another dispatcher
        // may have claimed the instance in between.
        let taken = s
            .instance_locks
            .get(&workflow_id)
            .map(|l| l.until_ms > now)
            .unwrap_or(false);
        if taken {
            return Ok(None);
        }
        let token = uuid::Uuid::new_v4().to_string();
        s.instance_locks.insert(
            workflow_id.clone(),
            InstanceLock {
                token: token.clone(),
                until_ms: now + lease_ms,
            },
        );
        let mut messages = Vec::new();
        for m in s.workflow_q.iter_mut() {
            if m.item.target_workflow_id() == workflow_id && m.available(now) {
                m.lock_token = Some(token.clone());
                m.locked_until_ms = now + lease_ms;
                messages.push(m.item.clone());
            }
        }
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

        let stored_cursor = s.headers.get(&workflow_id).map(|h| h.last_event_id).unwrap_or(0);
        if stored_cursor != expected_last_event_id {
            s.instance_locks.remove(&workflow_id);
            return Err(ProviderError::concurrent(
                "ack_workflow_task",
                format!("expected cursor {expected_last_event_id}, found {stored_cursor}"),
            ));
        }
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

        // 1. Segment append, one sync for the whole delta (group commit).
        if !history_delta.is_empty() {
            let mut out = String::new();
            for e in &history_delta {
                out.push_str(
                    &serde_json::to_string(e)
                        .map_err(|err| ProviderError::permanent("ack_workflow_task", format!("encode event: {err}")))?,
                );
                out.push('\n');
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.events_path(&workflow_id))
                .await
                .map_err(|e| ProviderError::retryable("ack_workflow_task", format!("open segment: {e}")))?;
            file.write_all(out.as_bytes())
                .await
                .map_err(|e| ProviderError::retryable("ack_workflow_task", format!("write segment: {e}")))?;
            file.sync_data()
                .await
                .map_err(|e| ProviderError::retryable("ack_workflow_task", format!("sync segment: {e}")))?;
        }

        // 2. Header.
        let new_last = history_delta
            .last()
            .map(|e| e.event_id)
            .unwrap_or(expected_last_event_id);
        let created_at = history_delta.first().map(|e| e.timestamp_ms).unwrap_or(now);
        let mut header = s.headers.get(&workflow_id).cloned().unwrap_or_else(|| WorkflowHeader {
            workflow_id: workflow_id.clone(),
            workflow_type: metadata.workflow_type.clone().unwrap_or_default(),
            status: "Running".to_string(),
            run_id: metadata.run_id.clone().unwrap_or_default(),
            task_queue: metadata
                .task_queue
                .clone()
                .unwrap_or_else(|| crate::DEFAULT_TASK_QUEUE.into()),
            created_at_ms: created_at,
            last_event_id: 0,
        });
        header.last_event_id = new_last;
        if let Some(status) = &metadata.status {
            header.status = status.clone();
        }
        if header.workflow_type.is_empty() {
            if let Some(t) = &metadata.workflow_type {
                header.workflow_type = t.clone();
            }
        }
        if header.run_id.is_empty() {
            if let Some(r) = &metadata.run_id {
                header.run_id = r.clone();
            }
        }
        self.write_header(&header).await?;
        s.headers.insert(workflow_id.clone(), header);

        // 3. Journal: consumed messages out, new work in.
        let mut ops: Vec<JournalOp> = Vec::new();
        for m in s.workflow_q.iter() {
            if m.lock_token.as_deref() == Some(lease_token) {
                ops.push(JournalOp::Ack { id: m.id.clone() });
            }
        }
        let mut new_activity = Vec::new();
        for (item, delay) in activity_items {
            let msg = Self::new_message(item, delay);
            ops.push(Self::enqueue_op(QUEUE_ACTIVITY, &msg));
            new_activity.push(msg);
        }
        let mut new_timers = Vec::new();
        for item in timer_items {
            let msg = Self::new_message(item, None);
            ops.push(Self::enqueue_op(QUEUE_TIMER, &msg));
            new_timers.push(msg);
        }
        let mut new_workflow = Vec::new();
        for item in workflow_items {
            let msg = Self::new_message(item, None);
            ops.push(Self::enqueue_op(QUEUE_WORKFLOW, &msg));
            new_workflow.push(msg);
        }
        for canceled in &canceled_activities {
            for m in s.activity_q.iter() {
                if let WorkItem::ActivityExecute {
                    workflow_id: wid,
                    activity_id,
                    ..
                } = &m.item
                {
                    if wid == &canceled.workflow_id && *activity_id == canceled.activity_id {
                        ops.push(JournalOp::Ack { id: m.id.clone() });
                    }
                }
            }
        }
        self.append_journal(&ops).await?;

        // 4. In-memory state.
        s.workflow_q.retain(|m| m.lock_token.as_deref() != Some(lease_token));
        s.instance_locks.remove(&workflow_id);
        for msg in &new_timers {
            if let WorkItem::TimerSchedule {
                workflow_id,
                timer_id,
                fire_at_ms,
            } = &msg.item
            {
                s.timer_index.insert((*fire_at_ms, workflow_id.clone(), *timer_id));
            }
        }
        s.activity_q.extend(new_activity);
        s.timer_q.extend(new_timers);
        s.workflow_q.extend(new_workflow);
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
            let token = uuid::Uuid::new_v4().to_string();
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
        let mut ops = Vec::new();
        for m in s.activity_q.iter() {
            if m.lock_token.as_deref() == Some(lease_token) {
                ops.push(JournalOp::Ack { id: m.id.clone() });
            }
        }
        drop(s);
        self.append_journal(&ops).await?;
        let mut s = self.state.lock().await;
        s.activity_q.retain(|m| m.lock_token.as_deref() != Some(lease_token));
        Ok(())
    }

    async fn dequeue_timer_task(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let now = now_ms();
        let mut guard = self.state.lock().await;
        let s = &mut *guard;
        // The index is ordered by fire time; take the nearest unlocked entry.
        let key = s
            .timer_index
            .iter()
            .find(|(fire_at, wid, tid)| {
                s.timer_q.iter().any(|m| {
                    m.available(now)
                        && matches!(&m.item, WorkItem::TimerSchedule { workflow_id, timer_id, fire_at_ms }
                            if workflow_id == wid && timer_id == tid && fire_at_ms == fire_at)
                })
            })
            .cloned();
        let Some((fire_at, wid, tid)) = key else {
            return Ok(None);
        };
        let pos = s.timer_q.iter().position(|m| {
            matches!(&m.item, WorkItem::TimerSchedule { workflow_id, timer_id, fire_at_ms }
                if workflow_id == &wid && *timer_id == tid && *fire_at_ms == fire_at)
        });
        let Some(pos) = pos else { return Ok(None) };
        let token = uuid::Uuid::new_v4().to_string();
        let m = &mut s.timer_q[pos];
        m.lock_token = Some(token.clone());
        // Held until fire; effectively unbounded.
        m.locked_until_ms = u64::MAX;
        let item = m.item.clone();
        s.timer_index.remove(&(fire_at, wid, tid));
        Ok(Some((item, token)))
    }

    async fn ack_timer_task(&self, lease_token: &str) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let mut ops = Vec::new();
        for m in s.timer_q.iter() {
            if m.lock_token.as_deref() == Some(lease_token) {
                ops.push(JournalOp::Ack { id: m.id.clone() });
            }
        }
        drop(s);
        self.append_journal(&ops).await?;
        let mut s = self.state.lock().await;
        s.timer_q.retain(|m| m.lock_token.as_deref() != Some(lease_token));
        Ok(())
    }

    async fn read(&self, workflow_id: &str) -> Result<Vec<Event>, ProviderError> {
        let data = match fs::read_to_string(self.events_path(workflow_id)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::retryable("read", format!("{e}"))),
        };
        let mut out = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let ev: Event = serde_json::from_str(line)
                .map_err(|e| ProviderError::permanent("read", format!("decode event: {e}")))?;
            out.push(ev);
        }
        Ok(out)
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
        let stale: Vec<String> = {
            let s = self.state.lock().await;
            s.headers
                .values()
                .filter(|h| h.is_terminal())
                .map(|h| h.workflow_id.clone())
                .collect()
        };
        let mut removed = 0u64;
        for wid in stale {
            let events = self.read(&wid).await?;
            let last_ts = events.last().map(|e| e.timestamp_ms).unwrap_or(0);
            if last_ts >= cutoff_ms {
                continue;
            }
            let _ = fs::remove_file(self.events_path(&wid)).await;
            let _ = fs::remove_file(self.header_path(&wid)).await;
            self.state.lock().await.headers.remove(&wid);
            removed += 1;
        }
        Ok(removed)
    }

    async fn purge_workflow(&self, workflow_id: &str) -> Result<(), ProviderError> {
        let _ = fs::remove_file(self.events_path(workflow_id)).await;
        let _ = fs::remove_file(self.header_path(workflow_id)).await;
        self.state.lock().await.headers.remove(workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn start_item(wid: &str) -> WorkItem {
        WorkItem::StartWorkflow {
            workflow_id: wid.into(),
            workflow_type: "Test".into(),
            input: String::new(),
            task_queue: crate::DEFAULT_TASK_QUEUE.into(),
            parent_workflow_id: None,
            parent_event_id: None,
        }
    }

    fn started_event(wid: &str) -> Event {
        Event::new(
            1,
            wid,
            None,
            now_ms(),
            EventKind::WorkflowStarted {
                workflow_type: "Test".into(),
                input: String::new(),
                task_queue: crate::DEFAULT_TASK_QUEUE.into(),
                run_id: "run-1".into(),
                seed: 1,
                parent_workflow_id: None,
                parent_event_id: None,
            },
        )
    }

    #[tokio::test]
    async fn events_and_queues_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let queues = vec![crate::DEFAULT_TASK_QUEUE.to_string()];
        {
            let p = FsProvider::open(dir.path()).await.unwrap();
            p.enqueue_workflow_item(start_item("w1"), None).await.unwrap();
            let task = p
                .fetch_workflow_task(&queues, Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            p.ack_workflow_task(
                &task.lease_token,
                0,
                vec![started_event("w1")],
                vec![(
                    WorkItem::ActivityExecute {
                        workflow_id: "w1".into(),
                        activity_id: 2,
                        name: "Noop".into(),
                        input: String::new(),
                        policy: crate::RetryPolicy::default(),
                        attempt: 1,
                        task_queue: crate::DEFAULT_TASK_QUEUE.into(),
                        deadline_ms: None,
                    },
                    None,
                )],
                vec![],
                vec![],
                RunMetadata {
                    workflow_type: Some("Test".into()),
                    run_id: Some("run-1".into()),
                    task_queue: Some(crate::DEFAULT_TASK_QUEUE.into()),
                    ..Default::default()
                },
                vec![],
            )
            .await
            .unwrap();
        }

        // Reopen: history intact, unacked activity task re-delivered.
        let p = FsProvider::open(dir.path()).await.unwrap();
        let history = p.read("w1").await.unwrap();
        assert_eq!(history.len(), 1);
        let header = p.describe("w1").await.unwrap().unwrap();
        assert_eq!(header.last_event_id, 1);
        let fetched = p
            .fetch_activity_task(&queues, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(matches!(
            fetched,
            Some((WorkItem::ActivityExecute { activity_id: 2, .. }, _))
        ));
    }

    #[tokio::test]
    async fn acked_work_is_not_redelivered_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let queues = vec![crate::DEFAULT_TASK_QUEUE.to_string()];
        {
            let p = FsProvider::open(dir.path()).await.unwrap();
            p.enqueue_workflow_item(start_item("w1"), None).await.unwrap();
            let task = p
                .fetch_workflow_task(&queues, Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            p.ack_workflow_task(
                &task.lease_token,
                0,
                vec![started_event("w1")],
                vec![],
                vec![],
                vec![],
                RunMetadata::default(),
                vec![],
            )
            .await
            .unwrap();
        }
        let p = FsProvider::open(dir.path()).await.unwrap();
        assert!(p
            .fetch_workflow_task(&queues, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn timer_index_orders_by_nearest_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let p = FsProvider::open(dir.path()).await.unwrap();
        let queues = vec![crate::DEFAULT_TASK_QUEUE.to_string()];
        p.enqueue_workflow_item(start_item("w1"), None).await.unwrap();
        let task = p
            .fetch_workflow_task(&queues, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let t = |id: u64, fire: u64| WorkItem::TimerSchedule {
            workflow_id: "w1".into(),
            timer_id: id,
            fire_at_ms: fire,
        };
        p.ack_workflow_task(
            &task.lease_token,
            0,
            vec![started_event("w1")],
            vec![],
            vec![t(5, 9_000), t(3, 1_000), t(4, 5_000)],
            vec![],
            RunMetadata::default(),
            vec![],
        )
        .await
        .unwrap();

        let mut order = Vec::new();
        while let Some((WorkItem::TimerSchedule { timer_id, .. }, token)) =
            p.dequeue_timer_task().await.unwrap()
        {
            order.push(timer_id);
            p.ack_timer_task(&token).await.unwrap();
        }
        assert_eq!(order, vec![3, 4, 5]);
    }
}
