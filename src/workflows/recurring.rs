//! Recurring-task scheduler and its per-occurrence reminder child workflow.
//!
//! The parent loops over occurrences: sleep until creation time (racing the
//! cancel signal), create the occurrence, optionally spawn a detached
//! TaskReminder child, advance the recurrence rule. Children live
//! independently of the parent.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::activities::{
    CheckTaskCompletionRequest, CreateTaskOccurrenceRequest, NotificationRequest,
    ACTIVITY_CHECK_TASK_COMPLETION, ACTIVITY_CREATE_TASK_OCCURRENCE, ACTIVITY_SEND_NOTIFICATION,
};
use super::{task_reminder_workflow_id, SIGNAL_CANCEL_RECURRING_TASK, SIGNAL_TASK_COMPLETED, WORKFLOW_TASK_REMINDER};
use crate::{Either2, WorkflowContext, CANCELED_ERROR_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceType {
    Daily,
    Weekly,
    Monthly,
    /// Reserved; treated as daily for now.
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    #[serde(rename = "type")]
    pub rule_type: RecurrenceType,
    /// Every N days/weeks/months.
    pub interval: u32,
    /// For weekly rules: 0 = Sunday .. 6 = Saturday. Empty falls back to
    /// whole-week stepping.
    #[serde(default)]
    pub days_of_week: Vec<u32>,
    /// For monthly rules: clamped to the target month's length.
    #[serde(default)]
    pub day_of_month: u32,
    pub start_date_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date_ms: Option<u64>,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_occurrences: u32,
}

impl RecurrenceRule {
    /// Next due time after `current_ms`.
    ///
    /// Weekly with `days_of_week` steps day by day from the next day until a
    /// listed weekday is found — the nearest future match wins. Monthly with
    /// `day_of_month` adds `interval` months and clamps the day to the target
    /// month's length (Jan 31 → Feb 28/29, never Mar 3). Time of day is
    /// preserved.
    pub fn advance(&self, current_ms: u64) -> u64 {
        let current: DateTime<Utc> = Utc
            .timestamp_millis_opt(current_ms as i64)
            .single()
            .unwrap_or_else(Utc::now);
        let interval = self.interval.max(1) as i64;
        let next = match self.rule_type {
            RecurrenceType::Weekly => {
                if self.days_of_week.is_empty() {
                    current + ChronoDuration::days(7 * interval)
                } else {
                    let mut candidate = current + ChronoDuration::days(1);
                    while !self.days_of_week.contains(&candidate.weekday().num_days_from_sunday()) {
                        candidate += ChronoDuration::days(1);
                    }
                    candidate
                }
            }
            RecurrenceType::Monthly => {
                if self.day_of_month > 0 {
                    let month0 = current.month0() as i64 + interval;
                    let year = current.year() + (month0 / 12) as i32;
                    let month = (month0 % 12) as u32 + 1;
                    let day = self.day_of_month.min(days_in_month(year, month));
                    let date = NaiveDate::from_ymd_opt(year, month, day)
                        .unwrap_or_else(|| current.date_naive())
                        .and_hms_milli_opt(
                            current.hour(),
                            current.minute(),
                            current.second(),
                            current.timestamp_subsec_millis(),
                        )
                        .unwrap_or_else(|| current.naive_utc());
                    Utc.from_utc_datetime(&date)
                } else {
                    add_months(current, interval)
                }
            }
            RecurrenceType::Daily | RecurrenceType::Custom => current + ChronoDuration::days(interval),
        };
        next.timestamp_millis().max(0) as u64
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1);
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    match (first, first_of_next) {
        (Some(a), Some(b)) => (b - a).num_days() as u32,
        _ => 30,
    }
}

fn add_months(current: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let month0 = current.month0() as i64 + months;
    let year = current.year() + (month0 / 12) as i32;
    let month = (month0 % 12) as u32 + 1;
    let day = current.day().min(days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| current.date_naive())
        .and_hms_milli_opt(
            current.hour(),
            current.minute(),
            current.second(),
            current.timestamp_subsec_millis(),
        )
        .unwrap_or_else(|| current.naive_utc());
    Utc.from_utc_datetime(&date)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReminderSettings {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub reminder_interval_ms: u64,
    pub max_reminders: u32,
    /// Reminders at or past this count are sent as escalated.
    pub escalate_after: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTaskParams {
    pub task_id: String,
    pub user_id: String,
    pub household_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub recurrence_rule: RecurrenceRule,
    #[serde(default)]
    pub assigned_members: Vec<String>,
    /// Occurrences are created this long before they fall due.
    #[serde(default)]
    pub due_duration_ms: u64,
    #[serde(default)]
    pub reminder_settings: ReminderSettings,
    #[serde(default)]
    pub auto_assign: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTaskResult {
    pub occurrences_created: u32,
}

pub async fn recurring_task_workflow(
    ctx: WorkflowContext,
    params: RecurringTaskParams,
) -> Result<RecurringTaskResult, String> {
    ctx.trace_info(format!("starting recurring task {} ({})", params.task_id, params.name));

    let rule = &params.recurrence_rule;
    let mut occurrence_count: u32 = 0;
    let mut next_due = rule.start_date_ms;

    loop {
        if let Some(end) = rule.end_date_ms {
            if next_due > end {
                break;
            }
        }
        if rule.max_occurrences > 0 && occurrence_count >= rule.max_occurrences {
            break;
        }
        ctx.expose_query("occurrences", occurrence_count.to_string());

        let assigned_to = if params.auto_assign && !params.assigned_members.is_empty() {
            Some(params.assigned_members[occurrence_count as usize % params.assigned_members.len()].clone())
        } else {
            None
        };

        // Sleep until creation time, racing the cancel signal. A cancel during
        // the wait terminates the run; already-spawned reminder children keep
        // going on their own.
        let create_at = next_due.saturating_sub(params.due_duration_ms);
        let now = ctx.now_ms();
        if create_at > now {
            let wait = Duration::from_millis(create_at - now);
            match ctx
                .select2(ctx.schedule_timer(wait), ctx.await_signal(SIGNAL_CANCEL_RECURRING_TASK))
                .await
            {
                Either2::First(fired) => fired?,
                Either2::Second(signal) => {
                    signal?;
                    ctx.trace_info(format!("recurring task {} canceled", params.task_id));
                    return Err(format!("{CANCELED_ERROR_PREFIX}: cancel_recurring_task signal"));
                }
            }
        }

        let occurrence_id = format!("{}_{}", params.task_id, occurrence_count + 1);
        let created = ctx
            .schedule_activity_typed::<_, ()>(
                ACTIVITY_CREATE_TASK_OCCURRENCE,
                &CreateTaskOccurrenceRequest {
                    task_id: params.task_id.clone(),
                    occurrence_id: occurrence_id.clone(),
                    name: params.name.clone(),
                    description: params.description.clone(),
                    user_id: params.user_id.clone(),
                    household_id: params.household_id.clone(),
                    due_date_ms: next_due,
                    assigned_to: assigned_to.clone(),
                },
            )
            .await;

        match created {
            Ok(()) => {
                if params.reminder_settings.enabled {
                    // Fire-and-forget: the child outlives this loop iteration
                    // and is only stopped by its own completion conditions.
                    ctx.start_detached_child_typed(
                        WORKFLOW_TASK_REMINDER,
                        task_reminder_workflow_id(&occurrence_id),
                        &TaskReminderParams {
                            occurrence_id: occurrence_id.clone(),
                            task_id: params.task_id.clone(),
                            user_id: params.user_id.clone(),
                            household_id: params.household_id.clone(),
                            assigned_to: assigned_to.clone(),
                            due_date_ms: next_due,
                            name: params.name.clone(),
                            reminder_settings: params.reminder_settings.clone(),
                        },
                    );
                }
            }
            Err(e) => {
                // Keep scheduling future occurrences even when one fails.
                ctx.trace_error(format!("failed to create occurrence {occurrence_id}: {e}"));
            }
        }

        next_due = rule.advance(next_due);
        occurrence_count += 1;
    }

    ctx.trace_info(format!(
        "recurring task {} finished after {} occurrences",
        params.task_id, occurrence_count
    ));
    Ok(RecurringTaskResult {
        occurrences_created: occurrence_count,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskReminderParams {
    pub occurrence_id: String,
    pub task_id: String,
    pub user_id: String,
    pub household_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub due_date_ms: u64,
    pub name: String,
    #[serde(default)]
    pub reminder_settings: ReminderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskReminderResult {
    pub reminders_sent: u32,
    pub completed: bool,
}

/// Per-occurrence reminder child: sleeps until `due − initial_delay`, then
/// nags until the task is done, the completion signal arrives, or reminders
/// run out. Escalates after `escalate_after` rounds.
pub async fn task_reminder_workflow(
    ctx: WorkflowContext,
    params: TaskReminderParams,
) -> Result<TaskReminderResult, String> {
    ctx.trace_info(format!("starting reminders for occurrence {}", params.occurrence_id));
    let settings = &params.reminder_settings;

    let first_at = params.due_date_ms.saturating_sub(settings.initial_delay_ms);
    let now = ctx.now_ms();
    if first_at > now {
        ctx.schedule_timer(Duration::from_millis(first_at - now))
            .await
            .map_err(|e| format!("initial reminder timer failed: {e}"))?;
    }

    let mut reminders_sent: u32 = 0;
    let mut completed = false;

    while reminders_sent < settings.max_reminders {
        match ctx
            .schedule_activity_typed::<_, bool>(
                ACTIVITY_CHECK_TASK_COMPLETION,
                &CheckTaskCompletionRequest {
                    occurrence_id: params.occurrence_id.clone(),
                },
            )
            .await
        {
            Ok(true) => {
                completed = true;
                break;
            }
            Ok(false) => {}
            Err(e) => ctx.trace_warn(format!("failed to check task completion: {e}")),
        }

        let reminder_type = if reminders_sent >= settings.escalate_after {
            "escalated_reminder"
        } else {
            "reminder"
        };
        let due = Utc
            .timestamp_millis_opt(params.due_date_ms as i64)
            .single()
            .map(|d| d.format("%b %-d, %-I:%M %p").to_string())
            .unwrap_or_default();
        let mut data: HashMap<String, String> = HashMap::new();
        data.insert("taskId".into(), params.task_id.clone());
        data.insert("occurrenceId".into(), params.occurrence_id.clone());
        data.insert("type".into(), reminder_type.into());
        data.insert("dueDateMs".into(), params.due_date_ms.to_string());
        let target = params.assigned_to.clone().unwrap_or_else(|| params.user_id.clone());
        let sent = ctx
            .schedule_activity_typed::<_, ()>(
                ACTIVITY_SEND_NOTIFICATION,
                &NotificationRequest {
                    user_id: target,
                    household_id: params.household_id.clone(),
                    title: format!("Task Reminder: {}", params.name),
                    body: format!("Don't forget to complete your task: {} (Due: {due})", params.name),
                    data,
                },
            )
            .await;
        if let Err(e) = sent {
            ctx.trace_warn(format!("failed to send reminder: {e}"));
        }
        reminders_sent += 1;

        if reminders_sent < settings.max_reminders {
            match ctx
                .select2(
                    ctx.schedule_timer(Duration::from_millis(settings.reminder_interval_ms)),
                    ctx.await_signal(SIGNAL_TASK_COMPLETED),
                )
                .await
            {
                Either2::First(fired) => fired?,
                Either2::Second(signal) => {
                    signal?;
                    completed = true;
                    break;
                }
            }
        }
    }

    ctx.trace_info(format!(
        "reminders for {} finished (sent {reminders_sent}, completed: {completed})",
        params.occurrence_id
    ));
    Ok(TaskReminderResult {
        reminders_sent,
        completed,
    })
}
