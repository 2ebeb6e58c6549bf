//! Timer workflow: countdown, pomodoro and stopwatch state machines with
//! pause/resume/stop signals.
//!
//! All elapsed/paused arithmetic reads `ctx.now_ms()` (virtual time), so a
//! replay after crash reproduces it exactly.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::activities::{
    CompleteTimerRequest, NotificationRequest, StartTimerRequest, ACTIVITY_COMPLETE_TIMER,
    ACTIVITY_SEND_NOTIFICATION, ACTIVITY_START_TIMER,
};
use super::{SIGNAL_PAUSE_TIMER, SIGNAL_RESUME_TIMER, SIGNAL_STOP_TIMER};
use crate::{Either2, Either4, WorkflowContext};

const DEFAULT_WORK_MS: u64 = 25 * 60 * 1000;
const DEFAULT_SHORT_BREAK_MS: u64 = 5 * 60 * 1000;
const DEFAULT_LONG_BREAK_MS: u64 = 15 * 60 * 1000;
const DEFAULT_BREAK_INTERVAL: u32 = 4;
const DEFAULT_REPETITIONS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerType {
    Countdown,
    Pomodoro,
    Stopwatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerParams {
    pub timer_id: String,
    pub user_id: String,
    pub household_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub timer_type: TimerType,
    pub duration_ms: u64,
    #[serde(default)]
    pub settings: TimerSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerSettings {
    pub auto_start: bool,
    pub notify_on_start: bool,
    pub notify_on_pause: bool,
    pub notify_on_finish: bool,
    /// Pomodoro work period; 0 means the 25-minute default.
    pub work_duration_ms: u64,
    pub short_break_ms: u64,
    pub long_break_ms: u64,
    pub break_interval: u32,
    pub repetitions: u32,
    pub notification_msg: String,
}

/// Terminal summary returned by the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerResult {
    pub status: String,
    pub elapsed_ms: u64,
    pub paused_ms: u64,
    pub completed_cycles: u32,
}

struct TimerTally {
    status: &'static str,
    elapsed_ms: u64,
    paused_ms: u64,
    completed_cycles: u32,
}

pub async fn timer_workflow(ctx: WorkflowContext, params: TimerParams) -> Result<TimerResult, String> {
    ctx.trace_info(format!("starting {} timer {}", type_name(params.timer_type), params.timer_id));
    ctx.expose_query("status", "created");

    ctx.schedule_activity_typed::<_, ()>(
        ACTIVITY_START_TIMER,
        &StartTimerRequest {
            timer_id: params.timer_id.clone(),
            user_id: params.user_id.clone(),
            name: params.name.clone(),
        },
    )
    .await
    .map_err(|e| format!("failed to start timer: {e}"))?;

    ctx.expose_query("status", "running");

    if params.settings.notify_on_start {
        let result = notify(
            &ctx,
            &params,
            "Timer Started",
            format!("{} timer has started", params.name),
            "timer_started",
            HashMap::new(),
        )
        .await;
        if let Err(e) = result {
            ctx.trace_warn(format!("failed to send start notification: {e}"));
        }
    }

    let tally = match params.timer_type {
        TimerType::Countdown => run_countdown(&ctx, &params).await?,
        TimerType::Pomodoro => run_pomodoro(&ctx, &params).await?,
        TimerType::Stopwatch => run_stopwatch(&ctx, &params).await?,
    };

    ctx.expose_query("status", tally.status);

    ctx.schedule_activity_typed::<_, ()>(
        ACTIVITY_COMPLETE_TIMER,
        &CompleteTimerRequest {
            timer_id: params.timer_id.clone(),
            user_id: params.user_id.clone(),
            elapsed_ms: tally.elapsed_ms,
            paused_ms: tally.paused_ms,
            status: tally.status.to_string(),
        },
    )
    .await
    .unwrap_or_else(|e| ctx.trace_warn(format!("failed to complete timer: {e}")));

    if params.settings.notify_on_finish {
        let result = notify(
            &ctx,
            &params,
            "Timer Completed",
            format!("{} timer has finished", params.name),
            "timer_completed",
            HashMap::new(),
        )
        .await;
        if let Err(e) = result {
            ctx.trace_warn(format!("failed to send completion notification: {e}"));
        }
    }

    Ok(TimerResult {
        status: tally.status.to_string(),
        elapsed_ms: tally.elapsed_ms,
        paused_ms: tally.paused_ms,
        completed_cycles: tally.completed_cycles,
    })
}

fn type_name(t: TimerType) -> &'static str {
    match t {
        TimerType::Countdown => "countdown",
        TimerType::Pomodoro => "pomodoro",
        TimerType::Stopwatch => "stopwatch",
    }
}

async fn notify(
    ctx: &WorkflowContext,
    params: &TimerParams,
    title: &str,
    body: String,
    kind: &str,
    extra: HashMap<String, String>,
) -> Result<(), String> {
    let mut data: HashMap<String, String> = extra;
    data.insert("timerId".into(), params.timer_id.clone());
    data.insert("type".into(), kind.into());
    ctx.schedule_activity_typed::<_, ()>(
        ACTIVITY_SEND_NOTIFICATION,
        &NotificationRequest {
            user_id: params.user_id.clone(),
            household_id: params.household_id.clone(),
            title: title.to_string(),
            body,
            data,
        },
    )
    .await
}

/// One pause interlude: waits for resume or stop. Returns the paused span and
/// whether a stop arrived.
async fn wait_out_pause(ctx: &WorkflowContext, params: &TimerParams) -> Result<(u64, bool), String> {
    let pause_start = ctx.now_ms();
    ctx.expose_query("status", "paused");
    if params.settings.notify_on_pause {
        let result = notify(
            ctx,
            params,
            "Timer Paused",
            format!("{} timer is paused", params.name),
            "timer_paused",
            HashMap::new(),
        )
        .await;
        if let Err(e) = result {
            ctx.trace_warn(format!("failed to send pause notification: {e}"));
        }
    }
    let stopped = match ctx
        .select2(ctx.await_signal(SIGNAL_RESUME_TIMER), ctx.await_signal(SIGNAL_STOP_TIMER))
        .await
    {
        Either2::First(resume) => {
            resume?;
            false
        }
        Either2::Second(stop) => {
            stop?;
            true
        }
    };
    if !stopped {
        ctx.expose_query("status", "running");
    }
    Ok((ctx.now_ms().saturating_sub(pause_start), stopped))
}

/// Countdown: a single timed period. The effective fire time is the original
/// deadline pushed out by accumulated paused time, realized by re-scheduling
/// the remaining duration on every resume.
async fn run_countdown(ctx: &WorkflowContext, params: &TimerParams) -> Result<TimerTally, String> {
    let (status, elapsed_ms, paused_ms) = run_timed_period(ctx, params, params.duration_ms).await?;
    Ok(TimerTally {
        status,
        elapsed_ms,
        paused_ms,
        completed_cycles: 0,
    })
}

/// Shared countdown core used by countdown timers and pomodoro periods.
/// Returns ("completed" | "stopped", active elapsed ms, paused ms).
async fn run_timed_period(
    ctx: &WorkflowContext,
    params: &TimerParams,
    duration_ms: u64,
) -> Result<(&'static str, u64, u64), String> {
    let mut paused_total: u64 = 0;
    let mut remaining = duration_ms;
    loop {
        let segment_start = ctx.now_ms();
        let outcome = ctx
            .select4(
                ctx.schedule_timer(Duration::from_millis(remaining)),
                ctx.await_signal(SIGNAL_PAUSE_TIMER),
                ctx.await_signal(SIGNAL_RESUME_TIMER),
                ctx.await_signal(SIGNAL_STOP_TIMER),
            )
            .await;
        match outcome {
            Either4::First(fired) => {
                fired?;
                return Ok(("completed", duration_ms, paused_total));
            }
            Either4::Second(pause) => {
                pause?;
                remaining = remaining.saturating_sub(ctx.now_ms().saturating_sub(segment_start));
                let (paused, stopped) = wait_out_pause(ctx, params).await?;
                paused_total += paused;
                if stopped {
                    return Ok(("stopped", duration_ms - remaining, paused_total));
                }
            }
            Either4::Third(resume) => {
                // Stray resume while already running: keep the clock honest
                // and re-arm the remaining duration.
                resume?;
                remaining = remaining.saturating_sub(ctx.now_ms().saturating_sub(segment_start));
            }
            Either4::Fourth(stop) => {
                stop?;
                let active = duration_ms - remaining + ctx.now_ms().saturating_sub(segment_start);
                return Ok(("stopped", active, paused_total));
            }
        }
    }
}

/// Pomodoro: work/break cycles. A long break lands every `break_interval`
/// completed cycles; the break after the final cycle is omitted entirely.
async fn run_pomodoro(ctx: &WorkflowContext, params: &TimerParams) -> Result<TimerTally, String> {
    let s = &params.settings;
    let work_ms = if s.work_duration_ms == 0 { DEFAULT_WORK_MS } else { s.work_duration_ms };
    let short_ms = if s.short_break_ms == 0 { DEFAULT_SHORT_BREAK_MS } else { s.short_break_ms };
    let long_ms = if s.long_break_ms == 0 { DEFAULT_LONG_BREAK_MS } else { s.long_break_ms };
    let break_interval = if s.break_interval == 0 { DEFAULT_BREAK_INTERVAL } else { s.break_interval };
    let max_cycles = if s.repetitions == 0 { DEFAULT_REPETITIONS } else { s.repetitions };

    let mut elapsed_total: u64 = 0;
    let mut paused_total: u64 = 0;
    let mut completed_cycles: u32 = 0;

    for cycle in 1..=max_cycles {
        ctx.expose_query("cycle", cycle.to_string());
        let (status, elapsed, paused) = run_timed_period(ctx, params, work_ms).await?;
        elapsed_total += elapsed;
        paused_total += paused;
        if status == "stopped" {
            return Ok(TimerTally {
                status: "stopped",
                elapsed_ms: elapsed_total,
                paused_ms: paused_total,
                completed_cycles,
            });
        }
        completed_cycles += 1;
        period_notification(ctx, params, cycle, false, "Work time!").await;

        if cycle < max_cycles {
            let (break_ms, break_msg) = if completed_cycles % break_interval == 0 {
                (long_ms, "Long break time!")
            } else {
                (short_ms, "Short break time!")
            };
            let (status, elapsed, paused) = run_timed_period(ctx, params, break_ms).await?;
            elapsed_total += elapsed;
            paused_total += paused;
            if status == "stopped" {
                return Ok(TimerTally {
                    status: "stopped",
                    elapsed_ms: elapsed_total,
                    paused_ms: paused_total,
                    completed_cycles,
                });
            }
            period_notification(ctx, params, cycle, true, break_msg).await;
        }
    }

    Ok(TimerTally {
        status: "completed",
        elapsed_ms: elapsed_total,
        paused_ms: paused_total,
        completed_cycles,
    })
}

async fn period_notification(ctx: &WorkflowContext, params: &TimerParams, cycle: u32, is_break: bool, msg: &str) {
    let mut extra = HashMap::new();
    extra.insert("cycle".into(), cycle.to_string());
    extra.insert("isBreak".into(), is_break.to_string());
    let result = notify(ctx, params, &params.name, msg.to_string(), "timer_period_complete", extra).await;
    if let Err(e) = result {
        ctx.trace_warn(format!("failed to send period notification: {e}"));
    }
}

/// Stopwatch: runs until stopped; elapsed excludes paused spans.
async fn run_stopwatch(ctx: &WorkflowContext, params: &TimerParams) -> Result<TimerTally, String> {
    let start = ctx.now_ms();
    let mut paused_total: u64 = 0;
    loop {
        let outcome = ctx
            .select3(
                ctx.await_signal(SIGNAL_PAUSE_TIMER),
                ctx.await_signal(SIGNAL_RESUME_TIMER),
                ctx.await_signal(SIGNAL_STOP_TIMER),
            )
            .await;
        match outcome {
            crate::Either3::First(pause) => {
                pause?;
                let (paused, stopped) = wait_out_pause(ctx, params).await?;
                paused_total += paused;
                if stopped {
                    break;
                }
            }
            crate::Either3::Second(resume) => {
                // Stray resume while running; drain it so a later pause does
                // not resume instantly off the buffered payload.
                resume?;
            }
            crate::Either3::Third(stop) => {
                stop?;
                break;
            }
        }
    }
    let elapsed = ctx.now_ms().saturating_sub(start).saturating_sub(paused_total);
    Ok(TimerTally {
        status: "stopped",
        elapsed_ms: elapsed,
        paused_ms: paused_total,
        completed_cycles: 0,
    })
}
