//! Deterministic turn execution: replay history, then advance live.
//!
//! A workflow task runs the workflow function as a single-threaded coroutine
//! polled with a no-op waker. During replay every command the coroutine emits
//! must match the next schedule event in history — same kind, same order, same
//! payload — or the turn aborts with a nondeterminism error. Once history is
//! exhausted the executor switches to live mode: incoming queue messages
//! become new completion events, newly emitted commands become schedule events
//! plus queue work items, and the caller commits the whole delta atomically.
//!
//! Virtual time: the coroutine is polled eagerly right after each delivery,
//! with the context clock set to that event's timestamp. Live-mode events are
//! all stamped with the wall clock captured when the task began, so a later
//! replay reproduces every `now_ms()` reading exactly.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::providers::{ActivityTaskId, RunMetadata, WorkItem};
use crate::{
    now_ms, AppErrorKind, Command, CompletionValue, ConfigErrorKind, ErrorDetails, Event, EventKind, RetryPolicy,
    WorkflowContext, CANCELED_ERROR_PREFIX,
};

use super::WorkflowHandler;

/// Everything one workflow turn wants committed atomically.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    pub history_delta: Vec<Event>,
    /// Activity tasks, each with an optional visibility delay (retries).
    pub activity_items: Vec<(WorkItem, Option<Duration>)>,
    pub timer_items: Vec<WorkItem>,
    pub workflow_items: Vec<WorkItem>,
    pub metadata: RunMetadata,
    pub canceled_activities: Vec<ActivityTaskId>,
    /// Set when this turn reached a terminal event.
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum ScheduleKind {
    Activity { name: String, input: String, policy: RetryPolicy },
    Timer,
    Child,
}

impl ScheduleKind {
    fn label(&self) -> &'static str {
        match self {
            ScheduleKind::Activity { .. } => "activity",
            ScheduleKind::Timer => "timer",
            ScheduleKind::Child => "child",
        }
    }
}

#[derive(Debug)]
struct OpenSchedule {
    kind: ScheduleKind,
    resolved: bool,
    /// Virtual time of the schedule event; anchors schedule-to-close deadlines.
    scheduled_at_ms: u64,
}

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn wake(_: *const ()) {}
    fn wake_by_ref(_: *const ()) {}
    fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    fut.poll(&mut cx)
}

fn nondeterminism(workflow_id: &str, message: impl Into<String>) -> ErrorDetails {
    ErrorDetails::Configuration {
        kind: ConfigErrorKind::Nondeterminism,
        resource: workflow_id.to_string(),
        message: Some(message.into()),
    }
}

fn match_schedule(workflow_id: &str, command: &Command, event: &Event) -> Result<(ScheduleKind, bool), ErrorDetails> {
    match (command, &event.kind) {
        (
            Command::ScheduleActivity { name, input, policy, .. },
            EventKind::ActivityScheduled { name: n, input: i, policy: p },
        ) if name == n && input == i && policy == p => Ok((
            ScheduleKind::Activity {
                name: name.clone(),
                input: input.clone(),
                policy: policy.clone(),
            },
            false,
        )),
        (Command::ScheduleTimer { fire_at_ms, .. }, EventKind::TimerScheduled { fire_at_ms: f }) if fire_at_ms == f => {
            Ok((ScheduleKind::Timer, false))
        }
        (
            Command::StartChild { workflow_type, child_id, input, detached, .. },
            EventKind::ChildWorkflowScheduled {
                workflow_type: t,
                child_id: c,
                input: i,
                detached: d,
            },
        ) if workflow_type == t && child_id == c && input == i && detached == d => {
            Ok((ScheduleKind::Child, *detached))
        }
        _ => Err(nondeterminism(
            workflow_id,
            format!("command {command:?} does not match history event {:?}", event.kind),
        )),
    }
}

/// Shared replay walk: drives the coroutine through a (non-terminal) history.
/// Returns the commands emitted beyond history and the coroutine's last poll.
struct ReplayResult {
    pending: VecDeque<(u64, Command)>,
    last_poll: Poll<Result<String, String>>,
    open: HashMap<u64, OpenSchedule>,
}

fn replay_history<F>(
    workflow_id: &str,
    ctx: &WorkflowContext,
    mut fut: Pin<&mut F>,
    history: &[Event],
) -> Result<ReplayResult, ErrorDetails>
where
    F: Future<Output = Result<String, String>> + ?Sized,
{
    let mut pending: VecDeque<(u64, Command)> = VecDeque::new();
    let mut open: HashMap<u64, OpenSchedule> = HashMap::new();

    // Initial poll runs the coroutine up to its first suspension.
    ctx.set_task_now(history.first().map(|e| e.timestamp_ms).unwrap_or(0));
    let mut last_poll = poll_once(fut.as_mut());
    pending.extend(ctx.drain_commands());

    let mut deliver = |open: &mut HashMap<u64, OpenSchedule>,
                       event: &Event,
                       value: CompletionValue,
                       expected: &str|
     -> Result<(), ErrorDetails> {
        let Some(source) = event.source_event_id else {
            return Err(nondeterminism(
                workflow_id,
                format!("completion event {} lacks a source", event.event_id),
            ));
        };
        let live = open
            .get(&source)
            .map(|s| !s.resolved && s.kind.label() == expected)
            .unwrap_or(false);
        if !live {
            return Err(nondeterminism(
                workflow_id,
                format!(
                    "completion event {} references schedule {source} which is not an open {expected}",
                    event.event_id
                ),
            ));
        }
        if let Some(s) = open.get_mut(&source) {
            s.resolved = true;
        }
        ctx.deliver_completion(source, value);
        Ok(())
    };

    for event in history {
        ctx.set_task_now(event.timestamp_ms);
        let mut progressed = false;
        match &event.kind {
            EventKind::WorkflowStarted { .. } => {}
            EventKind::ActivityScheduled { .. }
            | EventKind::TimerScheduled { .. }
            | EventKind::ChildWorkflowScheduled { .. } => {
                let Some((token, command)) = pending.pop_front() else {
                    return Err(nondeterminism(
                        workflow_id,
                        format!(
                            "history has schedule event {} but the workflow emitted no command",
                            event.event_id
                        ),
                    ));
                };
                let (kind, detached) = match_schedule(workflow_id, &command, event)?;
                ctx.bind_token(token, event.event_id);
                if !detached {
                    open.insert(
                        event.event_id,
                        OpenSchedule {
                            kind,
                            resolved: false,
                            scheduled_at_ms: event.timestamp_ms,
                        },
                    );
                }
            }
            EventKind::ActivityStarted { .. } => {}
            EventKind::ActivityFailed {
                next_retry_at_ms: Some(_),
                ..
            } => {
                // Retry was pending at this point; nothing resolves.
            }
            EventKind::ActivityCompleted { output } => {
                deliver(&mut open, event, CompletionValue::ActivityOk(output.clone()), "activity")?;
                progressed = true;
            }
            EventKind::ActivityFailed { details, .. } => {
                deliver(
                    &mut open,
                    event,
                    CompletionValue::ActivityErr(details.display_message()),
                    "activity",
                )?;
                progressed = true;
            }
            EventKind::TimerFired { .. } => {
                deliver(&mut open, event, CompletionValue::TimerFired, "timer")?;
                progressed = true;
            }
            EventKind::TimerCanceled => {
                if let Some(source) = event.source_event_id {
                    if let Some(s) = open.get_mut(&source) {
                        s.resolved = true;
                    }
                }
            }
            EventKind::ChildWorkflowCompleted { output } => {
                deliver(&mut open, event, CompletionValue::ChildOk(output.clone()), "child")?;
                progressed = true;
            }
            EventKind::ChildWorkflowFailed { details } => {
                deliver(
                    &mut open,
                    event,
                    CompletionValue::ChildErr(details.display_message()),
                    "child",
                )?;
                progressed = true;
            }
            EventKind::SignalReceived { name, payload } => {
                ctx.deliver_signal(name.clone(), payload.clone());
                progressed = true;
            }
            EventKind::CancelRequested { reason } => {
                ctx.cancel_open_awaits(reason);
                progressed = true;
            }
            EventKind::WorkflowCompleted { .. }
            | EventKind::WorkflowFailed { .. }
            | EventKind::WorkflowCanceled { .. } => {
                // Terminal histories are filtered out before replay.
            }
        }
        if progressed {
            last_poll = poll_once(fut.as_mut());
            pending.extend(ctx.drain_commands());
        }
    }

    Ok(ReplayResult { pending, last_poll, open })
}

struct TurnState<'a> {
    workflow_id: &'a str,
    task_queue: &'a str,
    ctx: WorkflowContext,
    next_event_id: u64,
    live_now_ms: u64,
    open: HashMap<u64, OpenSchedule>,
    outcome: TurnOutcome,
}

impl<'a> TurnState<'a> {
    fn append(&mut self, source: Option<u64>, kind: EventKind) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.outcome
            .history_delta
            .push(Event::new(id, self.workflow_id, source, self.live_now_ms, kind));
        id
    }

    fn open_unresolved(&self, id: u64, expected: &str) -> bool {
        self.open
            .get(&id)
            .map(|s| !s.resolved && s.kind.label() == expected)
            .unwrap_or(false)
    }

    fn mark_resolved(&mut self, id: u64) {
        if let Some(s) = self.open.get_mut(&id) {
            s.resolved = true;
        }
    }

    /// Materialize commands emitted in live mode into schedule events plus
    /// queue work items.
    fn materialize_commands(&mut self, commands: Vec<(u64, Command)>) {
        for (token, command) in commands {
            match command {
                Command::ScheduleActivity { name, input, policy, .. } => {
                    let id = self.append(
                        None,
                        EventKind::ActivityScheduled {
                            name: name.clone(),
                            input: input.clone(),
                            policy: policy.clone(),
                        },
                    );
                    self.ctx.bind_token(token, id);
                    self.open.insert(
                        id,
                        OpenSchedule {
                            kind: ScheduleKind::Activity {
                                name: name.clone(),
                                input: input.clone(),
                                policy: policy.clone(),
                            },
                            resolved: false,
                            scheduled_at_ms: self.live_now_ms,
                        },
                    );
                    let deadline_ms = policy
                        .schedule_to_close_deadline_ms
                        .map(|d| self.live_now_ms.saturating_add(d));
                    self.outcome.activity_items.push((
                        WorkItem::ActivityExecute {
                            workflow_id: self.workflow_id.to_string(),
                            activity_id: id,
                            name,
                            input,
                            policy,
                            attempt: 1,
                            task_queue: self.task_queue.to_string(),
                            deadline_ms,
                        },
                        None,
                    ));
                }
                Command::ScheduleTimer { fire_at_ms, .. } => {
                    let id = self.append(None, EventKind::TimerScheduled { fire_at_ms });
                    self.ctx.bind_token(token, id);
                    self.open.insert(
                        id,
                        OpenSchedule {
                            kind: ScheduleKind::Timer,
                            resolved: false,
                            scheduled_at_ms: self.live_now_ms,
                        },
                    );
                    self.outcome.timer_items.push(WorkItem::TimerSchedule {
                        workflow_id: self.workflow_id.to_string(),
                        timer_id: id,
                        fire_at_ms,
                    });
                }
                Command::StartChild {
                    workflow_type,
                    child_id,
                    input,
                    detached,
                    ..
                } => {
                    let id = self.append(
                        None,
                        EventKind::ChildWorkflowScheduled {
                            workflow_type: workflow_type.clone(),
                            child_id: child_id.clone(),
                            input: input.clone(),
                            detached,
                        },
                    );
                    self.ctx.bind_token(token, id);
                    if !detached {
                        self.open.insert(
                            id,
                            OpenSchedule {
                                kind: ScheduleKind::Child,
                                resolved: false,
                                scheduled_at_ms: self.live_now_ms,
                            },
                        );
                    }
                    self.outcome.workflow_items.push(WorkItem::StartWorkflow {
                        workflow_id: child_id,
                        workflow_type,
                        input,
                        task_queue: self.task_queue.to_string(),
                        parent_workflow_id: if detached { None } else { Some(self.workflow_id.to_string()) },
                        parent_event_id: if detached { None } else { Some(id) },
                    });
                }
            }
        }
    }

    /// Append terminal bookkeeping: cancel pending timers, purge queued
    /// activities, route the result to an awaiting parent.
    fn finish(
        &mut self,
        terminal_kind: EventKind,
        status: &str,
        output: Option<String>,
        parent: Option<(String, u64)>,
        result_for_parent: Result<String, ErrorDetails>,
    ) {
        if self.outcome.terminal {
            return;
        }
        let open_ids: Vec<(u64, &'static str)> = self
            .open
            .iter()
            .filter(|(_, s)| !s.resolved)
            .map(|(id, s)| (*id, s.kind.label()))
            .collect();
        for (id, kind) in open_ids {
            match kind {
                "timer" => {
                    self.append(Some(id), EventKind::TimerCanceled);
                }
                "activity" => {
                    self.outcome.canceled_activities.push(ActivityTaskId {
                        workflow_id: self.workflow_id.to_string(),
                        activity_id: id,
                    });
                }
                _ => {}
            }
        }
        self.append(None, terminal_kind);
        self.outcome.metadata.status = Some(status.to_string());
        self.outcome.metadata.output = output;
        self.outcome.terminal = true;

        if let Some((parent_id, parent_event_id)) = parent {
            let item = match result_for_parent {
                Ok(output) => WorkItem::ChildCompleted {
                    parent_workflow_id: parent_id,
                    child_event_id: parent_event_id,
                    output,
                },
                Err(details) => WorkItem::ChildFailed {
                    parent_workflow_id: parent_id,
                    child_event_id: parent_event_id,
                    details,
                },
            };
            self.outcome.workflow_items.push(item);
        }
    }

    fn finish_from_result(&mut self, result: Result<String, String>, parent: Option<(String, u64)>) {
        match result {
            Ok(output) => {
                self.finish(
                    EventKind::WorkflowCompleted { output: output.clone() },
                    "Completed",
                    Some(output.clone()),
                    parent,
                    Ok(output),
                );
            }
            Err(message) if message.starts_with(CANCELED_ERROR_PREFIX) => {
                let reason = message
                    .strip_prefix(CANCELED_ERROR_PREFIX)
                    .map(|r| r.trim_start_matches(':').trim().to_string())
                    .unwrap_or_default();
                self.finish(
                    EventKind::WorkflowCanceled { reason: reason.clone() },
                    "Canceled",
                    Some(message),
                    parent,
                    Err(ErrorDetails::Application {
                        kind: AppErrorKind::Canceled { reason },
                        message: String::new(),
                        retryable: false,
                    }),
                );
            }
            Err(message) => {
                let details = ErrorDetails::Application {
                    kind: AppErrorKind::WorkflowFailed,
                    message: message.clone(),
                    retryable: false,
                };
                self.finish(
                    EventKind::WorkflowFailed { details: details.clone() },
                    "Failed",
                    Some(message),
                    parent,
                    Err(details),
                );
            }
        }
    }
}

/// Inputs resolved by the dispatcher before a turn runs.
pub struct TurnInput {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub default_retry_policy: RetryPolicy,
}

/// Execute one workflow task. Returns the atomic outcome, or the fatal
/// configuration error that leaves the workflow stuck for operators.
pub fn execute_turn(
    input: TurnInput,
    handler: std::sync::Arc<dyn WorkflowHandler>,
) -> Result<TurnOutcome, ErrorDetails> {
    let TurnInput {
        workflow_id,
        workflow_type,
        task_queue,
        mut history,
        messages,
        default_retry_policy,
    } = input;

    // Terminal histories are acked without running user code.
    if history.iter().any(|e| e.is_terminal()) {
        debug!(workflow_id, "dropping batch for terminal workflow");
        return Ok(TurnOutcome::default());
    }

    let live_now = now_ms();

    // A fresh instance must begin with a StartWorkflow message.
    let mut messages = messages;
    let started_new = history.is_empty();
    if started_new {
        let start_pos = messages
            .iter()
            .position(|m| matches!(m, WorkItem::StartWorkflow { .. }));
        let Some(pos) = start_pos else {
            warn!(workflow_id, "dropping batch for unstarted workflow");
            return Ok(TurnOutcome::default());
        };
        let WorkItem::StartWorkflow {
            workflow_id: wid,
            workflow_type: wtype,
            input: winput,
            task_queue: wqueue,
            parent_workflow_id,
            parent_event_id,
        } = messages.remove(pos)
        else {
            unreachable!()
        };
        let run_id = uuid::Uuid::new_v4().to_string();
        let seed: u64 = rand::thread_rng().gen();
        history.push(Event::new(
            crate::INITIAL_EVENT_ID,
            &wid,
            None,
            live_now,
            EventKind::WorkflowStarted {
                workflow_type: wtype,
                input: winput,
                task_queue: wqueue,
                run_id,
                seed,
                parent_workflow_id,
                parent_event_id,
            },
        ));
    }

    let mut parent: Option<(String, u64)> = None;
    let (wf_input, run_id, seed) = match &history[0].kind {
        EventKind::WorkflowStarted {
            input,
            run_id,
            seed,
            parent_workflow_id,
            parent_event_id,
            ..
        } => {
            if let (Some(p), Some(pe)) = (parent_workflow_id.clone(), *parent_event_id) {
                parent = Some((p, pe));
            }
            (input.clone(), run_id.clone(), *seed)
        }
        other => {
            return Err(nondeterminism(
                &workflow_id,
                format!("history does not begin with WorkflowStarted: {other:?}"),
            ));
        }
    };

    let ctx = WorkflowContext::new(
        workflow_id.clone(),
        workflow_type.clone(),
        run_id.clone(),
        seed,
        default_retry_policy,
    );
    let mut fut_box = handler.invoke(ctx.clone(), wf_input);

    let replayed = replay_history(&workflow_id, &ctx, fut_box.as_mut(), &history)?;
    let ReplayResult {
        mut pending,
        mut last_poll,
        open,
    } = replayed;

    let mut state = TurnState {
        workflow_id: &workflow_id,
        task_queue: &task_queue,
        ctx: ctx.clone(),
        next_event_id: history.last().map(|e| e.event_id + 1).unwrap_or(crate::INITIAL_EVENT_ID),
        live_now_ms: live_now,
        open,
        outcome: TurnOutcome::default(),
    };
    if started_new {
        // The WorkflowStarted created above is part of this turn's delta.
        state.outcome.history_delta.push(history[0].clone());
        state.outcome.metadata.workflow_type = Some(workflow_type.clone());
        state.outcome.metadata.run_id = Some(run_id);
        state.outcome.metadata.task_queue = Some(task_queue.clone());
        state.outcome.metadata.status = Some("Running".to_string());
    }

    // ===== live =====
    ctx.set_replaying(false);
    ctx.set_task_now(live_now);

    // Commands left over from replay are new work.
    state.materialize_commands(pending.drain(..).collect());

    for message in messages {
        if state.outcome.terminal {
            debug!(workflow_id, kind = message.kind(), "dropping message after terminal event");
            continue;
        }
        match message {
            WorkItem::StartWorkflow { .. } => {
                warn!(workflow_id, "duplicate start for running workflow; ignoring");
                continue;
            }
            WorkItem::ActivityStarted {
                activity_id, attempt, ..
            } => {
                if state.open_unresolved(activity_id, "activity") {
                    state.append(Some(activity_id), EventKind::ActivityStarted { attempt });
                }
                continue;
            }
            WorkItem::ActivityCompleted {
                activity_id, output, ..
            } => {
                if !state.open_unresolved(activity_id, "activity") {
                    debug!(workflow_id, activity_id, "dropping stale activity completion");
                    continue;
                }
                state.append(Some(activity_id), EventKind::ActivityCompleted { output: output.clone() });
                state.mark_resolved(activity_id);
                ctx.deliver_completion(activity_id, CompletionValue::ActivityOk(output));
            }
            WorkItem::ActivityFailed {
                activity_id,
                attempt,
                details,
                ..
            } => {
                if !state.open_unresolved(activity_id, "activity") {
                    debug!(workflow_id, activity_id, "dropping stale activity failure");
                    continue;
                }
                let schedule = &state.open[&activity_id];
                let scheduled_at = schedule.scheduled_at_ms;
                let (policy, name, act_input) = match &schedule.kind {
                    ScheduleKind::Activity { policy, name, input } => (policy.clone(), name.clone(), input.clone()),
                    _ => unreachable!("open_unresolved checked the kind"),
                };
                let deadline_ms = policy
                    .schedule_to_close_deadline_ms
                    .map(|d| scheduled_at.saturating_add(d));
                let deadline_open = deadline_ms.map(|d| state.live_now_ms < d).unwrap_or(true);
                if deadline_open && policy.permits_retry(attempt, &details) {
                    // Record the pending retry and re-enqueue with backoff + jitter.
                    let base = policy.delay_for_attempt(attempt);
                    let jitter = rand::thread_rng().gen_range(0.9..1.1);
                    let delay = Duration::from_millis((base.as_millis() as f64 * jitter) as u64);
                    let next_retry_at = state.live_now_ms + delay.as_millis() as u64;
                    state.append(
                        Some(activity_id),
                        EventKind::ActivityFailed {
                            attempt,
                            details,
                            next_retry_at_ms: Some(next_retry_at),
                        },
                    );
                    state.outcome.activity_items.push((
                        WorkItem::ActivityExecute {
                            workflow_id: workflow_id.clone(),
                            activity_id,
                            name,
                            input: act_input,
                            policy,
                            attempt: attempt + 1,
                            task_queue: task_queue.clone(),
                            deadline_ms,
                        },
                        Some(delay),
                    ));
                    continue;
                }
                state.append(
                    Some(activity_id),
                    EventKind::ActivityFailed {
                        attempt,
                        details: details.clone(),
                        next_retry_at_ms: None,
                    },
                );
                state.mark_resolved(activity_id);
                ctx.deliver_completion(activity_id, CompletionValue::ActivityErr(details.display_message()));
            }
            WorkItem::TimerFired {
                timer_id, fire_at_ms, ..
            } => {
                if !state.open_unresolved(timer_id, "timer") {
                    debug!(workflow_id, timer_id, "dropping stale timer fire");
                    continue;
                }
                state.append(Some(timer_id), EventKind::TimerFired { fire_at_ms });
                state.mark_resolved(timer_id);
                ctx.deliver_completion(timer_id, CompletionValue::TimerFired);
            }
            WorkItem::SignalWorkflow { name, payload, .. } => {
                state.append(
                    None,
                    EventKind::SignalReceived {
                        name: name.clone(),
                        payload: payload.clone(),
                    },
                );
                ctx.deliver_signal(name, payload);
            }
            WorkItem::ChildCompleted {
                child_event_id, output, ..
            } => {
                if !state.open_unresolved(child_event_id, "child") {
                    debug!(workflow_id, child_event_id, "dropping stale child completion");
                    continue;
                }
                state.append(Some(child_event_id), EventKind::ChildWorkflowCompleted { output: output.clone() });
                state.mark_resolved(child_event_id);
                ctx.deliver_completion(child_event_id, CompletionValue::ChildOk(output));
            }
            WorkItem::ChildFailed {
                child_event_id, details, ..
            } => {
                if !state.open_unresolved(child_event_id, "child") {
                    debug!(workflow_id, child_event_id, "dropping stale child failure");
                    continue;
                }
                state.append(Some(child_event_id), EventKind::ChildWorkflowFailed { details: details.clone() });
                state.mark_resolved(child_event_id);
                ctx.deliver_completion(child_event_id, CompletionValue::ChildErr(details.display_message()));
            }
            WorkItem::CancelWorkflow { reason, .. } => {
                state.append(None, EventKind::CancelRequested { reason: reason.clone() });
                ctx.cancel_open_awaits(&reason);
            }
            WorkItem::TerminateWorkflow { reason, .. } => {
                // Hard stop: the terminal event is appended directly and the
                // workflow gets no cleanup turn.
                state.finish(
                    EventKind::WorkflowCanceled { reason: reason.clone() },
                    "Canceled",
                    Some(format!("{CANCELED_ERROR_PREFIX}: {reason}")),
                    parent.clone(),
                    Err(ErrorDetails::Application {
                        kind: AppErrorKind::Canceled { reason },
                        message: String::new(),
                        retryable: false,
                    }),
                );
                continue;
            }
            WorkItem::ActivityExecute { .. } | WorkItem::TimerSchedule { .. } => {
                warn!(workflow_id, "unexpected work item on workflow queue; dropping");
                continue;
            }
        }

        // Advance the coroutine past whatever was just delivered.
        last_poll = poll_once(fut_box.as_mut());
        let drained = ctx.drain_commands();
        state.materialize_commands(drained);

        if let Poll::Ready(result) = &last_poll {
            state.finish_from_result(result.clone(), parent.clone());
        }
    }

    // A turn whose messages were all dropped may still have finished during
    // replay (e.g. the first turn of a workflow with no suspension points).
    if !state.outcome.terminal {
        if let Poll::Ready(result) = last_poll {
            state.finish_from_result(result, parent.clone());
        }
    }

    Ok(state.outcome)
}

/// Replay a full history with no live messages, returning the context for
/// read-only queries. Appends nothing.
pub fn replay_for_query(
    workflow_id: &str,
    workflow_type: &str,
    history: Vec<Event>,
    handler: std::sync::Arc<dyn WorkflowHandler>,
    default_retry_policy: RetryPolicy,
) -> Result<WorkflowContext, ErrorDetails> {
    let trimmed: Vec<Event> = history.into_iter().filter(|e| !e.is_terminal()).collect();
    let Some(first) = trimmed.first() else {
        return Err(nondeterminism(workflow_id, "no history to replay"));
    };
    let (wf_input, run_id, seed) = match &first.kind {
        EventKind::WorkflowStarted { input, run_id, seed, .. } => (input.clone(), run_id.clone(), *seed),
        other => {
            return Err(nondeterminism(
                workflow_id,
                format!("history does not begin with WorkflowStarted: {other:?}"),
            ));
        }
    };

    let ctx = WorkflowContext::new(
        workflow_id.to_string(),
        workflow_type.to_string(),
        run_id,
        seed,
        default_retry_policy,
    );
    let mut fut_box = handler.invoke(ctx.clone(), wf_input);
    let _ = replay_history(workflow_id, &ctx, fut_box.as_mut(), &trimmed)?;
    Ok(ctx)
}
