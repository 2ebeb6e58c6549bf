//! Laundry workflow: wash → move → dry → collect, with phase-conditional
//! reminder loops.
//!
//! Reminder loops are structured concurrent awaits raced against the
//! phase-advance signal inside the same workflow coroutine — never separate
//! threads — so they replay deterministically and die with the phase they
//! belong to.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::activities::{
    CompleteLaundryRequest, NotificationRequest, StartLaundryRequest, ACTIVITY_COMPLETE_LAUNDRY,
    ACTIVITY_SEND_NOTIFICATION, ACTIVITY_START_LAUNDRY,
};
use super::{
    SIGNAL_DRY_COMPLETE, SIGNAL_LAUNDRY_COLLECTED, SIGNAL_START_DRY, SIGNAL_WASH_COMPLETE,
};
use crate::{Either2, WorkflowContext};

const DEFAULT_AUTO_START_DELAY_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaundryParams {
    pub laundry_id: String,
    pub user_id: String,
    pub household_id: String,
    /// normal, delicate, heavy, quick.
    pub load_type: String,
    pub wash_time_ms: u64,
    /// 0 skips the dry phase entirely.
    pub dry_time_ms: u64,
    #[serde(default)]
    pub settings: LaundrySettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LaundrySettings {
    pub auto_start: bool,
    /// Delay before the dry phase auto-starts; 0 means the 5-minute default.
    pub auto_start_delay_ms: u64,
    pub notify_on_start: bool,
    pub notify_on_wash_done: bool,
    pub notify_on_dry_done: bool,
    pub notify_reminders: bool,
    pub reminder_interval_ms: u64,
    pub max_reminders: u32,
    /// cold, warm, hot.
    pub temperature: String,
    /// low, medium, high.
    pub spin_speed: String,
    /// low, medium, high, extra.
    pub dry_level: String,
    pub fabric_softener: bool,
    pub extra_rinse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaundryResult {
    pub status: String,
    pub wash_ms: u64,
    pub dry_ms: u64,
    pub total_ms: u64,
}

pub async fn laundry_workflow(ctx: WorkflowContext, params: LaundryParams) -> Result<LaundryResult, String> {
    ctx.trace_info(format!("starting laundry {} ({})", params.laundry_id, params.load_type));
    ctx.expose_query("status", "created");

    ctx.schedule_activity_typed::<_, ()>(
        ACTIVITY_START_LAUNDRY,
        &StartLaundryRequest {
            laundry_id: params.laundry_id.clone(),
            user_id: params.user_id.clone(),
            household_id: params.household_id.clone(),
            load_type: params.load_type.clone(),
            settings: params.settings.clone(),
        },
    )
    .await
    .map_err(|e| format!("failed to start laundry tracking: {e}"))?;

    // ===== wash phase =====
    ctx.expose_query("status", "washing");
    let wash_started = ctx.now_ms();

    if params.settings.notify_on_start {
        notify_soft(
            &ctx,
            &params,
            "Laundry Started",
            format!("Wash cycle started for {} load", params.load_type),
            "wash_started",
        )
        .await;
    }

    // Whichever comes first advances the phase: the wash timer or a manual
    // wash_complete signal.
    match ctx
        .select2(
            ctx.schedule_timer(Duration::from_millis(params.wash_time_ms)),
            ctx.await_signal(SIGNAL_WASH_COMPLETE),
        )
        .await
    {
        Either2::First(fired) => fired?,
        Either2::Second(signal) => {
            signal?;
        }
    }
    let wash_finished = ctx.now_ms();
    ctx.expose_query("status", "wash_done");

    if params.settings.notify_on_wash_done {
        notify_soft(
            &ctx,
            &params,
            "Wash Cycle Complete",
            "Your laundry is ready to be moved to the dryer".to_string(),
            "wash_complete",
        )
        .await;
    }

    let mut dry_started = wash_finished;
    let mut dry_finished = wash_finished;

    if params.dry_time_ms > 0 {
        // ===== move phase: wait for start_dry, racing the auto-start timer
        // and the wash reminder loop =====
        let transition = async {
            if params.settings.auto_start {
                let delay = if params.settings.auto_start_delay_ms == 0 {
                    DEFAULT_AUTO_START_DELAY_MS
                } else {
                    params.settings.auto_start_delay_ms
                };
                match ctx
                    .select2(
                        ctx.await_signal(SIGNAL_START_DRY),
                        ctx.schedule_timer(Duration::from_millis(delay)),
                    )
                    .await
                {
                    Either2::First(signal) => signal.map(|_| ()),
                    Either2::Second(fired) => fired,
                }
            } else {
                ctx.await_signal(SIGNAL_START_DRY).await.map(|_| ())
            }
        };
        let reminders = reminder_loop(
            &ctx,
            &params,
            "Don't forget to move your laundry to the dryer",
            "wash_reminder",
        );
        // The reminder loop pends forever once exhausted; the transition
        // always decides.
        match ctx.select2(transition, reminders).await {
            Either2::First(advanced) => advanced?,
            Either2::Second(never) => never?,
        }

        // ===== dry phase =====
        ctx.expose_query("status", "drying");
        dry_started = ctx.now_ms();
        notify_soft(
            &ctx,
            &params,
            "Dry Cycle Started",
            format!("Dry cycle started for {} load", params.load_type),
            "dry_started",
        )
        .await;

        match ctx
            .select2(
                ctx.schedule_timer(Duration::from_millis(params.dry_time_ms)),
                ctx.await_signal(SIGNAL_DRY_COMPLETE),
            )
            .await
        {
            Either2::First(fired) => fired?,
            Either2::Second(signal) => {
                signal?;
            }
        }
        dry_finished = ctx.now_ms();
        ctx.expose_query("status", "dry_done");

        if params.settings.notify_on_dry_done {
            notify_soft(
                &ctx,
                &params,
                "Laundry Complete",
                "Your laundry is ready to be folded and put away".to_string(),
                "dry_complete",
            )
            .await;
        }

        // ===== collect: remind until the load is picked up or reminders run
        // out =====
        if params.settings.notify_reminders && params.settings.reminder_interval_ms > 0 {
            let collected = async { ctx.await_signal(SIGNAL_LAUNDRY_COLLECTED).await.map(|_| ()) };
            let reminders = finite_reminder_loop(
                &ctx,
                &params,
                "Your laundry is ready to be removed from the dryer",
                "dry_reminder",
            );
            match ctx.select2(collected, reminders).await {
                Either2::First(signal) => signal?,
                Either2::Second(exhausted) => exhausted?,
            }
        }
    }

    // ===== completed =====
    ctx.expose_query("status", "completed");
    let result = LaundryResult {
        status: "completed".to_string(),
        wash_ms: wash_finished.saturating_sub(wash_started),
        dry_ms: dry_finished.saturating_sub(dry_started),
        total_ms: ctx.now_ms().saturating_sub(wash_started),
    };
    ctx.schedule_activity_typed::<_, ()>(
        ACTIVITY_COMPLETE_LAUNDRY,
        &CompleteLaundryRequest {
            laundry_id: params.laundry_id.clone(),
            user_id: params.user_id.clone(),
            wash_ms: result.wash_ms,
            dry_ms: result.dry_ms,
            total_ms: result.total_ms,
            status: result.status.clone(),
        },
    )
    .await
    .unwrap_or_else(|e| ctx.trace_warn(format!("failed to complete laundry tracking: {e}")));

    ctx.trace_info(format!("laundry {} completed", params.laundry_id));
    Ok(result)
}

/// Send a notification, downgrading failure to a warning: reminders and
/// phase notices never sink the cycle.
async fn notify_soft(ctx: &WorkflowContext, params: &LaundryParams, title: &str, body: String, kind: &str) {
    let mut data: HashMap<String, String> = HashMap::new();
    data.insert("laundryId".into(), params.laundry_id.clone());
    data.insert("type".into(), kind.into());
    data.insert("loadType".into(), params.load_type.clone());
    let result = ctx
        .schedule_activity_typed::<_, ()>(
            ACTIVITY_SEND_NOTIFICATION,
            &NotificationRequest {
                user_id: params.user_id.clone(),
                household_id: params.household_id.clone(),
                title: title.to_string(),
                body,
                data,
            },
        )
        .await;
    if let Err(e) = result {
        ctx.trace_warn(format!("failed to send {kind} notification: {e}"));
    }
}

/// Reminder loop that never resolves: sends up to `max_reminders` spaced by
/// `reminder_interval`, then parks forever. Always raced against the
/// phase-advance future, which is the only way out.
async fn reminder_loop(
    ctx: &WorkflowContext,
    params: &LaundryParams,
    body: &str,
    kind: &str,
) -> Result<(), String> {
    run_reminders(ctx, params, body, kind).await?;
    futures::future::pending::<()>().await;
    unreachable!("pending() never resolves")
}

/// Reminder loop that resolves once exhausted, for the final collect phase.
async fn finite_reminder_loop(
    ctx: &WorkflowContext,
    params: &LaundryParams,
    body: &str,
    kind: &str,
) -> Result<(), String> {
    run_reminders(ctx, params, body, kind).await
}

async fn run_reminders(ctx: &WorkflowContext, params: &LaundryParams, body: &str, kind: &str) -> Result<(), String> {
    if !params.settings.notify_reminders || params.settings.reminder_interval_ms == 0 {
        return Ok(());
    }
    let mut reminders_left = params.settings.max_reminders;
    while reminders_left > 0 {
        ctx.schedule_timer(Duration::from_millis(params.settings.reminder_interval_ms)).await?;
        notify_soft(ctx, params, "Laundry Reminder", body.to_string(), kind).await;
        reminders_left -= 1;
    }
    Ok(())
}
