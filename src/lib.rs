//! # Houseflow: a durable workflow engine for household automation
//!
//! Houseflow runs long-lived household processes — countdown/pomodoro/stopwatch
//! timers, multi-phase laundry cycles, recurring task schedulers — as durable
//! workflows that survive process restarts. A workflow is a deterministic async
//! function whose state is the fold of an append-only event history; side
//! effects run as activities that are retried by policy and delivered
//! at-least-once.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use houseflow::providers::in_memory::InMemoryProvider;
//! use houseflow::runtime::registry::{ActivityRegistry, WorkflowRegistry};
//! use houseflow::runtime::{Runtime, RuntimeOptions};
//! use houseflow::{ActivityContext, Client, WorkflowContext};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryProvider::default());
//!
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move {
//!         Ok(format!("Hello, {name}!"))
//!     })
//!     .build();
//!
//! let workflows = WorkflowRegistry::builder()
//!     .register("HelloWorld", |ctx: WorkflowContext, name: String| async move {
//!         ctx.schedule_activity("Greet", name).await
//!     })
//!     .build();
//!
//! let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), workflows, RuntimeOptions::default()).await;
//! let client = Client::new(store);
//! client.start_workflow("hello-1", "HelloWorld", "World").await?;
//! let _status = client.wait_for_workflow("hello-1", std::time::Duration::from_secs(5)).await?;
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key concepts
//!
//! - **Workflows** are coordination logic: control flow, timers, signals,
//!   child workflows. They may only observe time via [`WorkflowContext::now_ms`]
//!   and randomness via [`WorkflowContext::rand_u64`]; both replay identically.
//! - **Activities** are single-purpose side-effecting units (database writes,
//!   notifications, webhooks). They execute off the workflow thread, are
//!   retried per [`RetryPolicy`], and MUST be idempotent over
//!   `(workflow_id, activity_id)` — the engine guarantees at-least-once
//!   delivery, never exactly-once.
//! - **Signals** are named FIFO channels into a workflow
//!   ([`WorkflowContext::await_signal`], [`crate::client::Client::signal_workflow`]).
//! - **Determinism**: every command a workflow emits (schedule activity,
//!   schedule timer, start child) is checked against history on replay; a
//!   mismatch is a fatal [`ConfigErrorKind::Nondeterminism`] error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

pub mod client;
pub mod providers;
pub mod runtime;
pub mod workflows;

pub use client::{Client, ClientError};
pub use runtime::registry::{ActivityRegistry, WorkflowRegistry};
pub use runtime::{Runtime, RuntimeOptions, WorkflowStatus};

/// The first event of every workflow history has event_id = 1.
pub const INITIAL_EVENT_ID: u64 = 1;

/// Task queue used when a start request does not name one.
pub const DEFAULT_TASK_QUEUE: &str = "default";

/// Error message prefix that marks a workflow result as a cooperative
/// cancellation rather than a failure. The runtime maps handler errors with
/// this prefix to a `WorkflowCanceled` terminal event.
pub const CANCELED_ERROR_PREFIX: &str = "canceled";

// Internal codec for typed I/O over the string-based registry boundary.
pub(crate) mod codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        // Bare string payloads stay raw so signal/activity payloads remain readable.
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => {
                let val = Value::String(s.to_string());
                serde_json::from_value(val).map_err(|e| e.to_string())
            }
        }
    }
}

/// Structured error details for workflow and activity failures.
///
/// Failures are categorized so operators can tell deployment problems from
/// business-logic problems:
/// - **Infrastructure**: provider failures, corruption. Abort the turn, never
///   reach workflow code.
/// - **Configuration**: unregistered handlers, replay nondeterminism. Abort
///   the turn; the workflow is stuck pending a code fix.
/// - **Application**: business failures. The only errors workflow code sees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorDetails {
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Replay produced a command sequence that diverges from history.
    Nondeterminism,
    /// A workflow type or activity name has no registered handler.
    UnregisteredHandler,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorKind {
    ActivityFailed,
    WorkflowFailed,
    /// Activity start-to-close or heartbeat deadline elapsed.
    TimedOut,
    Canceled { reason: String },
}

impl ErrorDetails {
    /// Failure category for metrics and logging.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Application { .. } => "application",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Infrastructure { retryable, .. } => *retryable,
            ErrorDetails::Application { kind, retryable, .. } => match kind {
                AppErrorKind::Canceled { .. } => false,
                _ => *retryable,
            },
            ErrorDetails::Configuration { .. } => false,
        }
    }

    /// Stable kind label matched against `RetryPolicy::non_retryable_error_kinds`.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Configuration { kind, .. } => match kind {
                ConfigErrorKind::Nondeterminism => "nondeterminism",
                ConfigErrorKind::UnregisteredHandler => "unregistered_handler",
            },
            ErrorDetails::Application { kind, .. } => match kind {
                AppErrorKind::ActivityFailed => "activity_failed",
                AppErrorKind::WorkflowFailed => "workflow_failed",
                AppErrorKind::TimedOut => "timed_out",
                AppErrorKind::Canceled { .. } => "canceled",
            },
        }
    }

    /// Display string used at the user-code boundary and in logs.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure:{operation}: {message}")
            }
            ErrorDetails::Configuration { kind, resource, message } => match kind {
                ConfigErrorKind::Nondeterminism => message
                    .as_ref()
                    .map(|m| format!("nondeterministic: {m}"))
                    .unwrap_or_else(|| format!("nondeterministic in {resource}")),
                ConfigErrorKind::UnregisteredHandler => format!("unregistered: {resource}"),
            },
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::Canceled { reason } => format!("{CANCELED_ERROR_PREFIX}: {reason}"),
                _ => message.clone(),
            },
        }
    }

    /// Application-level failure from a plain activity error string.
    pub fn activity_error(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind: AppErrorKind::ActivityFailed,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind: AppErrorKind::TimedOut,
            message: message.into(),
            retryable: true,
        }
    }
}

/// Retry policy attached to every scheduled activity.
///
/// The delay before attempt `n + 1` is
/// `min(initial_interval * backoff_coefficient^(n-1), max_interval)`; the
/// dispatcher adds ±10% jitter on top. Failures whose
/// [`ErrorDetails::kind_label`] appears in `non_retryable_error_kinds` are
/// terminal regardless of remaining attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
    /// Maximum attempts including the first. Must be >= 1.
    pub max_attempts: u32,
    #[serde(default)]
    pub non_retryable_error_kinds: Vec<String>,
    /// Per-attempt execution timeout. None falls back to the runtime default.
    #[serde(default)]
    pub start_to_close_timeout_ms: Option<u64>,
    /// Absolute budget from scheduling to the terminal result, spanning all
    /// attempts. None means unbounded.
    #[serde(default)]
    pub schedule_to_close_deadline_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            max_interval_ms: 60_000,
            max_attempts: 3,
            non_retryable_error_kinds: Vec::new(),
            start_to_close_timeout_ms: None,
            schedule_to_close_deadline_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_non_retryable(mut self, kind: impl Into<String>) -> Self {
        self.non_retryable_error_kinds.push(kind.into());
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_schedule_to_close_deadline(mut self, deadline: Duration) -> Self {
        self.schedule_to_close_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    /// Backoff delay after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let delay_ms = (self.initial_interval_ms as f64 * factor) as u64;
        Duration::from_millis(delay_ms.min(self.max_interval_ms))
    }

    /// True when the given failure may be retried at attempt `attempt`.
    pub fn permits_retry(&self, attempt: u32, details: &ErrorDetails) -> bool {
        attempt < self.max_attempts
            && details.is_retryable()
            && !self
                .non_retryable_error_kinds
                .iter()
                .any(|k| k == details.kind_label())
    }
}

/// One entry in a workflow's immutable ordered history.
///
/// `event_id` increases by exactly one per event within a workflow; completion
/// events reference their scheduling event via `source_event_id`. Every event
/// appended by one workflow task carries that task's virtual `now`, which is
/// what makes [`WorkflowContext::now_ms`] reproducible on replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: u64,
    /// For completion events: the scheduling event this completes.
    pub source_event_id: Option<u64>,
    pub workflow_id: String,
    /// Virtual timestamp (ms since Unix epoch) of the task that appended this.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event-specific payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    WorkflowStarted {
        workflow_type: String,
        input: String,
        task_queue: String,
        run_id: String,
        /// Seed for the workflow's deterministic RNG.
        seed: u64,
        parent_workflow_id: Option<String>,
        parent_event_id: Option<u64>,
    },
    WorkflowCompleted {
        output: String,
    },
    WorkflowFailed {
        details: ErrorDetails,
    },
    WorkflowCanceled {
        reason: String,
    },
    TimerScheduled {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    TimerCanceled,
    ActivityScheduled {
        name: String,
        input: String,
        policy: RetryPolicy,
    },
    /// Informational: a worker began attempt `attempt`. Skipped by replay.
    ActivityStarted {
        attempt: u32,
    },
    ActivityCompleted {
        output: String,
    },
    /// Non-terminal while `next_retry_at_ms` is Some (a retry is pending);
    /// terminal when None.
    ActivityFailed {
        attempt: u32,
        details: ErrorDetails,
        next_retry_at_ms: Option<u64>,
    },
    SignalReceived {
        name: String,
        payload: String,
    },
    ChildWorkflowScheduled {
        workflow_type: String,
        child_id: String,
        input: String,
        /// Detached children never route a completion back to the parent.
        detached: bool,
    },
    ChildWorkflowCompleted {
        output: String,
    },
    ChildWorkflowFailed {
        details: ErrorDetails,
    },
    CancelRequested {
        reason: String,
    },
}

impl Event {
    pub fn new(
        event_id: u64,
        workflow_id: impl Into<String>,
        source_event_id: Option<u64>,
        timestamp_ms: u64,
        kind: EventKind,
    ) -> Self {
        Event {
            event_id,
            source_event_id,
            workflow_id: workflow_id.into(),
            timestamp_ms,
            kind,
        }
    }

    /// True for events that end the workflow run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkflowCompleted { .. }
                | EventKind::WorkflowFailed { .. }
                | EventKind::WorkflowCanceled { .. }
        )
    }
}

/// Declarative commands buffered by a workflow turn. The dispatcher
/// materializes these into schedule events and queue work items; workflow code
/// never performs I/O directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
        policy: RetryPolicy,
    },
    ScheduleTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    StartChild {
        scheduling_event_id: u64,
        workflow_type: String,
        child_id: String,
        input: String,
        detached: bool,
    },
}

/// Result delivered to a suspended workflow future.
#[doc(hidden)]
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionValue {
    ActivityOk(String),
    ActivityErr(String),
    TimerFired,
    ChildOk(String),
    ChildErr(String),
    Canceled(String),
}

#[derive(Debug)]
struct CtxInner {
    is_replaying: bool,
    /// Virtual time for the current poll step; see spec of `now_ms`.
    task_now_ms: u64,

    next_token: u64,
    emitted: Vec<(u64, Command)>,
    /// token -> scheduling event id, bound when the matching schedule event exists.
    bindings: HashMap<u64, u64>,
    /// scheduling event id -> completion.
    results: HashMap<u64, CompletionValue>,

    /// Signal FIFOs: name -> payloads in history order.
    signal_arrivals: HashMap<String, Vec<String>>,
    /// name -> how many arrivals have been consumed by resolved receives.
    signal_consumed: HashMap<String, usize>,
    /// token -> channel name, for receives that have not yet resolved.
    signal_waits: HashMap<u64, String>,
    /// token -> payload, once a receive has consumed an arrival. Consumption
    /// happens at resolve time (first poll that finds an arrival), so a
    /// dropped selector loser never burns a payload.
    signal_taken: HashMap<u64, String>,
    /// Signal waits that were open when cancellation arrived.
    canceled_signal_tokens: HashMap<u64, String>,

    /// Set once CancelRequested has been processed; carries the reason.
    cancel_reason: Option<String>,

    /// Deterministic RNG state (seed from WorkflowStarted, SplitMix64 stream).
    rand_state: u64,

    /// Values published for read-only queries; part of the deterministic fold.
    query_values: HashMap<String, String>,

    /// Policy applied when `schedule_activity` is called without one.
    default_policy: RetryPolicy,

    workflow_id: String,
    workflow_type: String,
    run_id: String,
}

impl CtxInner {
    fn emit(&mut self, command: Command) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.emitted.push((token, command));
        token
    }

    fn next_rand(&mut self) -> u64 {
        // SplitMix64: tiny, seedable, identical on every replay.
        self.rand_state = self.rand_state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.rand_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// Context handed to workflow functions: the only gateway to time, randomness,
/// and suspension points. Cloneable; all clones share state.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
    #[doc(hidden)]
    pub fn new(
        workflow_id: String,
        workflow_type: String,
        run_id: String,
        seed: u64,
        default_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner {
                is_replaying: true,
                task_now_ms: 0,
                next_token: 0,
                emitted: Vec::new(),
                bindings: HashMap::new(),
                results: HashMap::new(),
                signal_arrivals: HashMap::new(),
                signal_consumed: HashMap::new(),
                signal_waits: HashMap::new(),
                signal_taken: HashMap::new(),
                canceled_signal_tokens: HashMap::new(),
                cancel_reason: None,
                rand_state: seed,
                query_values: HashMap::new(),
                default_policy,
                workflow_id,
                workflow_type,
                run_id,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CtxInner> {
        // A poisoned mutex means a panic on the single workflow thread; state
        // is unrecoverable either way.
        self.inner.lock().expect("workflow context mutex poisoned")
    }

    /// True while the turn is consuming persisted history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    pub fn workflow_id(&self) -> String {
        self.lock().workflow_id.clone()
    }

    pub fn workflow_type(&self) -> String {
        self.lock().workflow_type.clone()
    }

    pub fn run_id(&self) -> String {
        self.lock().run_id.clone()
    }

    /// Virtual current time in ms since the Unix epoch.
    ///
    /// During replay this is the timestamp stamped on the history event being
    /// replayed; on a live segment it is the wall-clock time captured when the
    /// workflow task began. Identical calls within one task return the same
    /// value, so pause/resume arithmetic replays exactly.
    pub fn now_ms(&self) -> u64 {
        self.lock().task_now_ms
    }

    /// Deterministic random draw. The stream is seeded from the value stored
    /// in `WorkflowStarted`, so replay sees identical draws.
    pub fn rand_u64(&self) -> u64 {
        self.lock().next_rand()
    }

    /// Publish a value for read-only queries. Last write per name wins; the
    /// map is derived purely from history, so queries never need an append.
    pub fn expose_query(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().query_values.insert(name.into(), value.into());
    }

    // ===== suspension primitives =====

    /// Schedule an activity with the runtime's default retry policy.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<String, String>> {
        let policy = self.lock().default_policy.clone();
        self.schedule_activity_with_policy(name, input, policy)
    }

    /// Schedule an activity with an explicit retry policy. Resolves on the
    /// terminal `ActivityCompleted`/`ActivityFailed` event.
    pub fn schedule_activity_with_policy(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> impl Future<Output = Result<String, String>> {
        let token = self.lock().emit(Command::ScheduleActivity {
            scheduling_event_id: 0,
            name: name.into(),
            input: input.into(),
            policy,
        });
        let ctx = self.clone();
        std::future::poll_fn(move |_cx| {
            let inner = ctx.lock();
            let Some(id) = inner.bindings.get(&token) else {
                return Poll::Pending;
            };
            match inner.results.get(id) {
                Some(CompletionValue::ActivityOk(v)) => Poll::Ready(Ok(v.clone())),
                Some(CompletionValue::ActivityErr(e)) => Poll::Ready(Err(e.clone())),
                Some(CompletionValue::Canceled(reason)) => {
                    Poll::Ready(Err(format!("{CANCELED_ERROR_PREFIX}: {reason}")))
                }
                _ => Poll::Pending,
            }
        })
    }

    /// Typed activity scheduling: serializes input, deserializes output.
    pub fn schedule_activity_typed<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> {
        let payload = codec::encode(input).expect("activity input must serialize");
        let fut = self.schedule_activity(name, payload);
        async move {
            let s = fut.await?;
            codec::decode::<Out>(&s)
        }
    }

    pub fn schedule_activity_typed_with_policy<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
        policy: RetryPolicy,
    ) -> impl Future<Output = Result<Out, String>> {
        let payload = codec::encode(input).expect("activity input must serialize");
        let fut = self.schedule_activity_with_policy(name, payload, policy);
        async move {
            let s = fut.await?;
            codec::decode::<Out>(&s)
        }
    }

    /// Schedule a durable timer for `delay` from virtual now. Resolves on
    /// `TimerFired`, or with a canceled error after `CancelRequested`.
    pub fn schedule_timer(&self, delay: Duration) -> impl Future<Output = Result<(), String>> {
        let token = {
            let mut inner = self.lock();
            let fire_at_ms = inner.task_now_ms.saturating_add(delay.as_millis() as u64);
            inner.emit(Command::ScheduleTimer {
                scheduling_event_id: 0,
                fire_at_ms,
            })
        };
        let ctx = self.clone();
        std::future::poll_fn(move |_cx| {
            let inner = ctx.lock();
            let Some(id) = inner.bindings.get(&token) else {
                return Poll::Pending;
            };
            match inner.results.get(id) {
                Some(CompletionValue::TimerFired) => Poll::Ready(Ok(())),
                Some(CompletionValue::Canceled(reason)) => {
                    Poll::Ready(Err(format!("{CANCELED_ERROR_PREFIX}: {reason}")))
                }
                _ => Poll::Pending,
            }
        })
    }

    /// Receive the next payload on a named signal channel (per-name FIFO).
    ///
    /// An arrival is consumed when a receive resolves, in deterministic poll
    /// order; selector losers dropped before resolving leave the channel
    /// untouched, so re-registering in a loop never loses payloads.
    pub fn await_signal(&self, name: impl Into<String>) -> impl Future<Output = Result<String, String>> {
        let name: String = name.into();
        let token = {
            let mut inner = self.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            inner.signal_waits.insert(token, name);
            token
        };
        let ctx = self.clone();
        std::future::poll_fn(move |_cx| {
            let mut inner = ctx.lock();
            if let Some(payload) = inner.signal_taken.get(&token) {
                return Poll::Ready(Ok(payload.clone()));
            }
            if let Some(reason) = inner.canceled_signal_tokens.get(&token) {
                return Poll::Ready(Err(format!("{CANCELED_ERROR_PREFIX}: {reason}")));
            }
            let Some(name) = inner.signal_waits.get(&token).cloned() else {
                return Poll::Pending;
            };
            let consumed = inner.signal_consumed.get(&name).copied().unwrap_or(0);
            let next = inner.signal_arrivals.get(&name).and_then(|a| a.get(consumed)).cloned();
            match next {
                Some(payload) => {
                    inner.signal_consumed.insert(name, consumed + 1);
                    inner.signal_taken.insert(token, payload.clone());
                    Poll::Ready(Ok(payload))
                }
                None => Poll::Pending,
            }
        })
    }

    /// Typed signal receive.
    pub fn await_signal_typed<T: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
    ) -> impl Future<Output = Result<T, String>> {
        let fut = self.await_signal(name);
        async move {
            let s = fut.await?;
            codec::decode::<T>(&s)
        }
    }

    /// Start a child workflow and await its result.
    pub fn start_child(
        &self,
        workflow_type: impl Into<String>,
        child_id: impl Into<String>,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<String, String>> {
        let token = self.lock().emit(Command::StartChild {
            scheduling_event_id: 0,
            workflow_type: workflow_type.into(),
            child_id: child_id.into(),
            input: input.into(),
            detached: false,
        });
        let ctx = self.clone();
        std::future::poll_fn(move |_cx| {
            let inner = ctx.lock();
            let Some(id) = inner.bindings.get(&token) else {
                return Poll::Pending;
            };
            match inner.results.get(id) {
                Some(CompletionValue::ChildOk(v)) => Poll::Ready(Ok(v.clone())),
                Some(CompletionValue::ChildErr(e)) => Poll::Ready(Err(e.clone())),
                Some(CompletionValue::Canceled(reason)) => {
                    Poll::Ready(Err(format!("{CANCELED_ERROR_PREFIX}: {reason}")))
                }
                _ => Poll::Pending,
            }
        })
    }

    /// Fire-and-forget child workflow. The child's lifetime is independent of
    /// the parent; no completion is routed back.
    pub fn start_detached_child(
        &self,
        workflow_type: impl Into<String>,
        child_id: impl Into<String>,
        input: impl Into<String>,
    ) {
        let _ = self.lock().emit(Command::StartChild {
            scheduling_event_id: 0,
            workflow_type: workflow_type.into(),
            child_id: child_id.into(),
            input: input.into(),
            detached: true,
        });
    }

    pub fn start_detached_child_typed<In: Serialize>(
        &self,
        workflow_type: impl Into<String>,
        child_id: impl Into<String>,
        input: &In,
    ) {
        let payload = codec::encode(input).expect("child input must serialize");
        self.start_detached_child(workflow_type, child_id, payload)
    }

    // ===== selectors =====

    /// Race two futures; deterministic tie-break favors the first case.
    pub async fn select2<T1, T2, F1, F2>(&self, f1: F1, f2: F2) -> Either2<T1, T2>
    where
        F1: Future<Output = T1>,
        F2: Future<Output = T2>,
    {
        use futures::FutureExt;
        let mut f1 = std::pin::pin!(f1.fuse());
        let mut f2 = std::pin::pin!(f2.fuse());
        futures::select_biased! {
            result = f1 => Either2::First(result),
            result = f2 => Either2::Second(result),
        }
    }

    pub async fn select3<T1, T2, T3, F1, F2, F3>(&self, f1: F1, f2: F2, f3: F3) -> Either3<T1, T2, T3>
    where
        F1: Future<Output = T1>,
        F2: Future<Output = T2>,
        F3: Future<Output = T3>,
    {
        use futures::FutureExt;
        let mut f1 = std::pin::pin!(f1.fuse());
        let mut f2 = std::pin::pin!(f2.fuse());
        let mut f3 = std::pin::pin!(f3.fuse());
        futures::select_biased! {
            result = f1 => Either3::First(result),
            result = f2 => Either3::Second(result),
            result = f3 => Either3::Third(result),
        }
    }

    pub async fn select4<T1, T2, T3, T4, F1, F2, F3, F4>(
        &self,
        f1: F1,
        f2: F2,
        f3: F3,
        f4: F4,
    ) -> Either4<T1, T2, T3, T4>
    where
        F1: Future<Output = T1>,
        F2: Future<Output = T2>,
        F3: Future<Output = T3>,
        F4: Future<Output = T4>,
    {
        use futures::FutureExt;
        let mut f1 = std::pin::pin!(f1.fuse());
        let mut f2 = std::pin::pin!(f2.fuse());
        let mut f3 = std::pin::pin!(f3.fuse());
        let mut f4 = std::pin::pin!(f4.fuse());
        futures::select_biased! {
            result = f1 => Either4::First(result),
            result = f2 => Either4::Second(result),
            result = f3 => Either4::Third(result),
            result = f4 => Either4::Fourth(result),
        }
    }

    /// Await all futures; results in declaration order.
    pub async fn join<T, F>(&self, futures: Vec<F>) -> Vec<T>
    where
        F: Future<Output = T>,
    {
        futures::future::join_all(futures).await
    }

    // ===== replay-guarded tracing =====

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(tracing::Level::INFO, message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(tracing::Level::WARN, message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(tracing::Level::ERROR, message.into());
    }

    fn trace(&self, level: tracing::Level, message: String) {
        let inner = self.lock();
        if inner.is_replaying {
            return;
        }
        if level == tracing::Level::WARN {
            tracing::warn!(
                target: "houseflow::workflow",
                workflow_id = %inner.workflow_id,
                workflow_type = %inner.workflow_type,
                run_id = %inner.run_id,
                "{message}"
            );
        } else if level == tracing::Level::ERROR {
            tracing::error!(
                target: "houseflow::workflow",
                workflow_id = %inner.workflow_id,
                workflow_type = %inner.workflow_type,
                run_id = %inner.run_id,
                "{message}"
            );
        } else {
            tracing::info!(
                target: "houseflow::workflow",
                workflow_id = %inner.workflow_id,
                workflow_type = %inner.workflow_type,
                run_id = %inner.run_id,
                "{message}"
            );
        }
    }

    // ===== hooks for the turn executor =====

    #[doc(hidden)]
    pub fn set_replaying(&self, replaying: bool) {
        self.lock().is_replaying = replaying;
    }

    #[doc(hidden)]
    pub fn set_task_now(&self, now_ms: u64) {
        self.lock().task_now_ms = now_ms;
    }

    #[doc(hidden)]
    pub fn drain_commands(&self) -> Vec<(u64, Command)> {
        std::mem::take(&mut self.lock().emitted)
    }

    #[doc(hidden)]
    pub fn bind_token(&self, token: u64, scheduling_event_id: u64) {
        self.lock().bindings.insert(token, scheduling_event_id);
    }

    #[doc(hidden)]
    pub fn deliver_completion(&self, scheduling_event_id: u64, value: CompletionValue) {
        self.lock().results.insert(scheduling_event_id, value);
    }

    #[doc(hidden)]
    pub fn deliver_signal(&self, name: String, payload: String) {
        self.lock().signal_arrivals.entry(name).or_default().push(payload);
    }

    /// Resolve every open await with a canceled error. Awaits created after
    /// this call behave normally so cleanup code can still run activities.
    #[doc(hidden)]
    pub fn cancel_open_awaits(&self, reason: &str) {
        let mut inner = self.lock();
        inner.cancel_reason = Some(reason.to_string());
        let open: Vec<u64> = inner
            .bindings
            .values()
            .copied()
            .filter(|id| !inner.results.contains_key(id))
            .collect();
        for id in open {
            inner.results.insert(id, CompletionValue::Canceled(reason.to_string()));
        }
        let waiting: Vec<u64> = inner
            .signal_waits
            .keys()
            .filter(|token| !inner.signal_taken.contains_key(*token))
            .copied()
            .collect();
        for token in waiting {
            inner.canceled_signal_tokens.insert(token, reason.to_string());
        }
    }

    #[doc(hidden)]
    pub fn cancel_reason(&self) -> Option<String> {
        self.lock().cancel_reason.clone()
    }

    #[doc(hidden)]
    pub fn query_value(&self, name: &str) -> Option<String> {
        self.lock().query_values.get(name).cloned()
    }
}

/// Result of [`WorkflowContext::select2`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Either2<A, B> {
    First(A),
    Second(B),
}

/// Result of [`WorkflowContext::select3`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Either3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

/// Result of [`WorkflowContext::select4`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Either4<A, B, C, D> {
    First(A),
    Second(B),
    Third(C),
    Fourth(D),
}

/// Context provided to activity handlers.
///
/// Activities are leaf nodes: they cannot schedule workflow work, but they can
/// log with full correlation, heartbeat, observe cancellation, and read their
/// idempotency key. Delivery is at-least-once — a handler invoked twice with
/// the same `(workflow_id, activity_id)` must produce the same observable
/// effect as one invocation.
#[derive(Clone)]
pub struct ActivityContext {
    workflow_id: String,
    activity_id: u64,
    activity_name: String,
    attempt: u32,
    worker_id: String,
    heartbeat: Arc<std::sync::atomic::AtomicU64>,
    heartbeat_notify: Arc<tokio::sync::Notify>,
    cancellation_token: tokio_util::sync::CancellationToken,
}

impl ActivityContext {
    #[doc(hidden)]
    pub fn new(
        workflow_id: String,
        activity_id: u64,
        activity_name: String,
        attempt: u32,
        worker_id: String,
        cancellation_token: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            workflow_id,
            activity_id,
            activity_name,
            attempt,
            worker_id,
            heartbeat: Arc::new(std::sync::atomic::AtomicU64::new(now_ms())),
            heartbeat_notify: Arc::new(tokio::sync::Notify::new()),
            cancellation_token,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1-indexed attempt number under the retry policy.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Idempotency key for external effects: stable across retries.
    pub fn idempotency_key(&self) -> String {
        format!("{}/{}", self.workflow_id, self.activity_id)
    }

    /// Report liveness. Resets the heartbeat watchdog and renews the task
    /// lease; long-running handlers should call this periodically.
    pub fn record_heartbeat(&self) {
        self.heartbeat.store(now_ms(), std::sync::atomic::Ordering::Relaxed);
        self.heartbeat_notify.notify_one();
    }

    #[doc(hidden)]
    pub fn last_heartbeat_ms(&self) -> u64 {
        self.heartbeat.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[doc(hidden)]
    pub fn heartbeat_notify(&self) -> Arc<tokio::sync::Notify> {
        self.heartbeat_notify.clone()
    }

    /// True once the owning workflow reached a terminal state.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Completes when cancellation is requested; for use with `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "houseflow::activity",
            workflow_id = %self.workflow_id,
            activity_id = %self.activity_id,
            activity_name = %self.activity_name,
            attempt = %self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "houseflow::activity",
            workflow_id = %self.workflow_id,
            activity_id = %self.activity_id,
            activity_name = %self.activity_name,
            attempt = %self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "houseflow::activity",
            workflow_id = %self.workflow_id,
            activity_id = %self.activity_id,
            activity_name = %self.activity_name,
            attempt = %self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("workflow_id", &self.workflow_id)
            .field("activity_id", &self.activity_id)
            .field("activity_name", &self.activity_name)
            .field("attempt", &self.attempt)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Wall-clock ms since the Unix epoch. Engine-side only; workflow code must
/// use `WorkflowContext::now_ms`.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
