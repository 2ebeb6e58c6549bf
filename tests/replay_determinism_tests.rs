//! Determinism properties of the turn executor: replay equivalence, strict
//! command-vs-history checking, stale-message tolerance.

use std::sync::Arc;
use std::time::Duration;

use houseflow::providers::in_memory::InMemoryProvider;
use houseflow::providers::Provider;
use houseflow::runtime::registry::{ActivityRegistry, WorkflowRegistry};
use houseflow::runtime::replay::{execute_turn, TurnInput};
use houseflow::runtime::{FnWorkflow, Runtime, RuntimeOptions, WorkflowHandler, WorkflowStatus};
use houseflow::{ActivityContext, Client, RetryPolicy, WorkflowContext};

mod common;

const WAIT: Duration = Duration::from_secs(10);

fn handler<F, Fut>(f: F) -> Arc<dyn WorkflowHandler>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    Arc::new(FnWorkflow(f))
}

fn turn_input(workflow_id: &str, history: Vec<houseflow::Event>) -> TurnInput {
    TurnInput {
        workflow_id: workflow_id.to_string(),
        workflow_type: "Test".to_string(),
        task_queue: houseflow::DEFAULT_TASK_QUEUE.to_string(),
        history,
        messages: vec![],
        default_retry_policy: RetryPolicy::default(),
    }
}

/// The workflow used across these tests: two activities and a timer, with a
/// suspension in the middle.
async fn two_step(ctx: WorkflowContext, input: String) -> Result<String, String> {
    let first = ctx.schedule_activity("StepOne", input).await?;
    ctx.schedule_timer(Duration::from_millis(30)).await?;
    let second = ctx.schedule_activity("StepTwo", first).await?;
    Ok(second)
}

async fn run_to_completion(workflow_id: &str) -> (Vec<houseflow::Event>, String) {
    let activities = ActivityRegistry::builder()
        .register("StepOne", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("{input}+1"))
        })
        .register("StepTwo", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("{input}+2"))
        })
        .build();
    let workflows = WorkflowRegistry::builder().register("Test", two_step).build();
    let store = Arc::new(InMemoryProvider::default());
    let rt = Runtime::start_with_store(
        store.clone(),
        Arc::new(activities),
        workflows,
        RuntimeOptions::default(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_workflow(workflow_id, "Test", "x").await.unwrap();
    let status = client.wait_for_workflow(workflow_id, WAIT).await.unwrap();
    let WorkflowStatus::Completed { output } = status else {
        panic!("expected completion, got {status:?}");
    };
    let history = store.read(workflow_id).await.unwrap();
    rt.shutdown().await;
    (history, output)
}

#[tokio::test]
async fn replaying_a_live_history_emits_no_new_commands() {
    let (history, output) = run_to_completion("replay-1").await;
    assert_eq!(output, "x+1+2");

    // A non-terminal prefix replays to exactly the same frontier: no new
    // events, no new work items.
    let non_terminal: Vec<houseflow::Event> =
        history.iter().filter(|e| !e.is_terminal()).cloned().collect();
    let outcome = execute_turn(turn_input("replay-1", non_terminal), handler(two_step)).unwrap();
    // The final poll completes the workflow again (all completions are in
    // history), so the only delta allowed is the terminal bookkeeping.
    assert!(
        outcome
            .history_delta
            .iter()
            .all(|e| e.is_terminal() || matches!(e.kind, houseflow::EventKind::TimerCanceled)),
        "replay must not re-issue commands: {:?}",
        outcome.history_delta
    );
    assert!(outcome.activity_items.is_empty());
    assert!(outcome.timer_items.is_empty());
}

#[tokio::test]
async fn terminal_histories_are_acked_without_running_user_code() {
    let (history, _) = run_to_completion("replay-2").await;
    let outcome = execute_turn(
        turn_input("replay-2", history),
        handler(|_ctx, _input| async move { panic!("user code must not run on terminal histories") }),
    )
    .unwrap();
    assert!(outcome.history_delta.is_empty());
    assert!(!outcome.terminal);
}

#[tokio::test]
async fn swapped_activity_name_is_flagged_as_nondeterminism() {
    let (history, _) = run_to_completion("replay-3").await;
    let non_terminal: Vec<houseflow::Event> =
        history.iter().filter(|e| !e.is_terminal()).cloned().collect();

    // Same shape, different activity name: replay must refuse.
    let err = execute_turn(
        turn_input("replay-3", non_terminal),
        handler(|ctx: WorkflowContext, input: String| async move {
            let first = ctx.schedule_activity("Renamed", input).await?;
            ctx.schedule_timer(Duration::from_millis(30)).await?;
            ctx.schedule_activity("StepTwo", first).await
        }),
    )
    .unwrap_err();
    assert_eq!(err.category(), "configuration");
    assert!(err.display_message().contains("nondeterministic"));
}

#[tokio::test]
async fn reordered_commands_are_flagged_as_nondeterminism() {
    let (history, _) = run_to_completion("replay-4").await;
    let non_terminal: Vec<houseflow::Event> =
        history.iter().filter(|e| !e.is_terminal()).cloned().collect();

    // Timer first instead of the activity: order is part of the contract.
    let err = execute_turn(
        turn_input("replay-4", non_terminal),
        handler(|ctx: WorkflowContext, input: String| async move {
            ctx.schedule_timer(Duration::from_millis(30)).await?;
            let first = ctx.schedule_activity("StepOne", input).await?;
            ctx.schedule_activity("StepTwo", first).await
        }),
    )
    .unwrap_err();
    assert_eq!(err.category(), "configuration");
}

#[tokio::test]
async fn extra_commands_beyond_history_are_treated_as_new_work() {
    // History only covers the first activity; the workflow then wants a
    // timer — that is legitimate live progress, not nondeterminism.
    let (history, _) = run_to_completion("replay-5").await;
    let prefix: Vec<houseflow::Event> = history
        .iter()
        .take_while(|e| {
            !matches!(e.kind, houseflow::EventKind::TimerScheduled { .. })
        })
        .cloned()
        .collect();
    let outcome = execute_turn(turn_input("replay-5", prefix), handler(two_step)).unwrap();
    assert_eq!(outcome.timer_items.len(), 1, "the timer becomes new work");
    assert!(outcome
        .history_delta
        .iter()
        .any(|e| matches!(e.kind, houseflow::EventKind::TimerScheduled { .. })));
}

#[tokio::test]
async fn duplicate_completions_are_dropped_not_replayed() {
    let (history, _) = run_to_completion("replay-6").await;
    let non_terminal: Vec<houseflow::Event> =
        history.iter().filter(|e| !e.is_terminal()).cloned().collect();
    // Find the already-resolved first activity and fake a duplicate
    // completion message for it (at-least-once delivery).
    let first_sched = non_terminal
        .iter()
        .find(|e| matches!(e.kind, houseflow::EventKind::ActivityScheduled { .. }))
        .unwrap()
        .event_id;
    let mut input = turn_input("replay-6", non_terminal);
    input.messages.push(houseflow::providers::WorkItem::ActivityCompleted {
        workflow_id: "replay-6".into(),
        activity_id: first_sched,
        output: "dup".into(),
    });
    let outcome = execute_turn(input, handler(two_step)).unwrap();
    assert!(
        !outcome.history_delta.iter().any(
            |e| matches!(&e.kind, houseflow::EventKind::ActivityCompleted { output } if output == "dup")
        ),
        "duplicate completion must not append"
    );
}
