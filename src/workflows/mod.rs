//! Household workflow definitions: timers, laundry cycles, recurring tasks.
//!
//! Workflow ids follow `{type}-{domain_id}` (e.g. `timer-<uuid>`); signal
//! names are string constants declared here, next to the workflows that
//! consume them.

use std::sync::Arc;

use crate::runtime::registry::{ActivityRegistry, WorkflowRegistry};

pub mod activities;
pub mod laundry;
pub mod recurring;
pub mod timer;

pub use activities::HouseholdBackend;

// Workflow type names.
pub const WORKFLOW_TIMER: &str = "timer";
pub const WORKFLOW_LAUNDRY: &str = "laundry";
pub const WORKFLOW_RECURRING_TASK: &str = "recurring-task";
pub const WORKFLOW_TASK_REMINDER: &str = "task-reminder";

// Signal channels.
pub const SIGNAL_PAUSE_TIMER: &str = "pause_timer";
pub const SIGNAL_RESUME_TIMER: &str = "resume_timer";
pub const SIGNAL_STOP_TIMER: &str = "stop_timer";
pub const SIGNAL_WASH_COMPLETE: &str = "wash_complete";
pub const SIGNAL_START_DRY: &str = "start_dry";
pub const SIGNAL_DRY_COMPLETE: &str = "dry_complete";
pub const SIGNAL_LAUNDRY_COLLECTED: &str = "laundry_collected";
pub const SIGNAL_CANCEL_RECURRING_TASK: &str = "cancel_recurring_task";
pub const SIGNAL_TASK_COMPLETED: &str = "task_completed";

/// `timer-<uuid>`
pub fn timer_workflow_id(timer_id: &str) -> String {
    format!("{WORKFLOW_TIMER}-{timer_id}")
}

/// `laundry-<uuid>`
pub fn laundry_workflow_id(laundry_id: &str) -> String {
    format!("{WORKFLOW_LAUNDRY}-{laundry_id}")
}

/// `recurring-task-<uuid>`
pub fn recurring_task_workflow_id(task_id: &str) -> String {
    format!("{WORKFLOW_RECURRING_TASK}-{task_id}")
}

/// `task-reminders-<occurrence>` — matches the child ids spawned by the
/// recurring-task workflow.
pub fn task_reminder_workflow_id(occurrence_id: &str) -> String {
    format!("task-reminders-{occurrence_id}")
}

/// All four household workflows, ready for `Runtime::start_with_store`.
pub fn workflow_registry() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register_typed(WORKFLOW_TIMER, timer::timer_workflow)
        .register_typed(WORKFLOW_LAUNDRY, laundry::laundry_workflow)
        .register_typed(WORKFLOW_RECURRING_TASK, recurring::recurring_task_workflow)
        .register_typed(WORKFLOW_TASK_REMINDER, recurring::task_reminder_workflow)
        .build()
}

/// Activity registry over a backend implementation.
pub fn activity_registry(backend: Arc<dyn HouseholdBackend>) -> ActivityRegistry {
    activities::registry(backend)
}
