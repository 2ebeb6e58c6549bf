//! Engine-level behavior: completion, signals, retries, cancellation,
//! children, queries, client validation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use houseflow::client::{StartOptions, WorkflowIdReusePolicy};
use houseflow::providers::in_memory::InMemoryProvider;
use houseflow::runtime::registry::{ActivityRegistry, WorkflowRegistry};
use houseflow::runtime::{Runtime, RuntimeOptions, WorkflowStatus};
use houseflow::{ActivityContext, Client, Either2, RetryPolicy, WorkflowContext};

mod common;

const WAIT: Duration = Duration::from_secs(10);

fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        default_retry_policy: RetryPolicy::default().with_initial_interval(Duration::from_millis(20)),
        ..Default::default()
    }
}

async fn start_runtime(
    activities: ActivityRegistry,
    workflows: WorkflowRegistry,
) -> (Arc<Runtime>, Client, Arc<InMemoryProvider>) {
    let store = Arc::new(InMemoryProvider::default());
    let rt = Runtime::start_with_store(
        store.clone(),
        Arc::new(activities),
        workflows,
        fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    (rt, client, store)
}

#[tokio::test]
async fn activity_chain_completes() {
    let activities = ActivityRegistry::builder()
        .register("Greet", |_ctx: ActivityContext, name: String| async move {
            Ok(format!("Hello, {name}!"))
        })
        .register("Shout", |_ctx: ActivityContext, text: String| async move {
            Ok(text.to_uppercase())
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Chain", |ctx: WorkflowContext, input: String| async move {
            let greeting = ctx.schedule_activity("Greet", input).await?;
            ctx.schedule_activity("Shout", greeting).await
        })
        .build();
    let (rt, client, _) = start_runtime(activities, workflows).await;

    client.start_workflow("chain-1", "Chain", "world").await.unwrap();
    let status = client.wait_for_workflow("chain-1", WAIT).await.unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "HELLO, WORLD!".to_string()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn signals_are_delivered_in_fifo_order() {
    let workflows = WorkflowRegistry::builder()
        .register("Collect", |ctx: WorkflowContext, _input: String| async move {
            let first = ctx.await_signal("item").await?;
            let second = ctx.await_signal("item").await?;
            Ok(format!("{first},{second}"))
        })
        .build();
    let (rt, client, _) = start_runtime(ActivityRegistry::builder().build(), workflows).await;

    client.start_workflow("collect-1", "Collect", "").await.unwrap();
    client.signal_workflow("collect-1", "item", "a").await.unwrap();
    client.signal_workflow("collect-1", "item", "b").await.unwrap();
    let status = client.wait_for_workflow("collect-1", WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed { output: "a,b".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn failing_activity_is_retried_until_it_succeeds() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let activities = ActivityRegistry::builder()
        .register("Flaky", move |ctx: ActivityContext, _input: String| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("transient failure #{n}"))
                } else {
                    Ok(format!("succeeded on attempt {}", ctx.attempt()))
                }
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Retrying", |ctx: WorkflowContext, _input: String| async move {
            ctx.schedule_activity_with_policy(
                "Flaky",
                "",
                RetryPolicy::default().with_initial_interval(Duration::from_millis(10)),
            )
            .await
        })
        .build();
    let (rt, client, _) = start_runtime(activities, workflows).await;

    client.start_workflow("retry-1", "Retrying", "").await.unwrap();
    let status = client.wait_for_workflow("retry-1", WAIT).await.unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "succeeded on attempt 3".into()
        }
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_surface_as_workflow_visible_failure() {
    let activities = ActivityRegistry::builder()
        .register("Doomed", |_ctx: ActivityContext, _input: String| async move {
            Err::<String, String>("permanent trouble".into())
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Compensating", |ctx: WorkflowContext, _input: String| async move {
            match ctx
                .schedule_activity_with_policy(
                    "Doomed",
                    "",
                    RetryPolicy::default()
                        .with_max_attempts(2)
                        .with_initial_interval(Duration::from_millis(10)),
                )
                .await
            {
                Ok(v) => Ok(v),
                // Failure arrives as a value, not a crash; the workflow
                // chooses how to proceed.
                Err(e) => Ok(format!("compensated: {e}")),
            }
        })
        .build();
    let (rt, client, _) = start_runtime(activities, workflows).await;

    client.start_workflow("doomed-1", "Compensating", "").await.unwrap();
    let status = client.wait_for_workflow("doomed-1", WAIT).await.unwrap();
    match status {
        WorkflowStatus::Completed { output } => assert!(output.contains("compensated: permanent trouble")),
        other => panic!("expected completion, got {other:?}"),
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn cancel_resolves_pending_awaits_and_runs_cleanup() {
    let cleanup_runs = Arc::new(AtomicU32::new(0));
    let counter = cleanup_runs.clone();
    let activities = ActivityRegistry::builder()
        .register("Cleanup", move |_ctx: ActivityContext, _input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("LongWait", |ctx: WorkflowContext, _input: String| async move {
            match ctx.schedule_timer(Duration::from_secs(3600)).await {
                Ok(()) => Ok("timer fired".into()),
                Err(canceled) => {
                    // Cooperative cancellation: cleanup may still schedule
                    // activities before the run terminates.
                    ctx.schedule_activity("Cleanup", "").await.ok();
                    Err(canceled)
                }
            }
        })
        .build();
    let (rt, client, _) = start_runtime(activities, workflows).await;

    client.start_workflow("wait-1", "LongWait", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.cancel_workflow("wait-1", "user request").await.unwrap();
    let status = client.wait_for_workflow("wait-1", WAIT).await.unwrap();
    match status {
        WorkflowStatus::Canceled { reason } => assert_eq!(reason, "user request"),
        other => panic!("expected canceled, got {other:?}"),
    }
    assert_eq!(cleanup_runs.load(Ordering::SeqCst), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_bypasses_cleanup() {
    let cleanup_runs = Arc::new(AtomicU32::new(0));
    let counter = cleanup_runs.clone();
    let activities = ActivityRegistry::builder()
        .register("Cleanup", move |_ctx: ActivityContext, _input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("LongWait", |ctx: WorkflowContext, _input: String| async move {
            match ctx.schedule_timer(Duration::from_secs(3600)).await {
                Ok(()) => Ok("timer fired".into()),
                Err(canceled) => {
                    ctx.schedule_activity("Cleanup", "").await.ok();
                    Err(canceled)
                }
            }
        })
        .build();
    let (rt, client, _) = start_runtime(activities, workflows).await;

    client.start_workflow("term-1", "LongWait", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.terminate_workflow("term-1", "operator kill").await.unwrap();
    let status = client.wait_for_workflow("term-1", WAIT).await.unwrap();
    match status {
        WorkflowStatus::Canceled { reason } => assert_eq!(reason, "operator kill"),
        other => panic!("expected canceled, got {other:?}"),
    }
    assert_eq!(cleanup_runs.load(Ordering::SeqCst), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn child_workflow_result_reaches_the_parent() {
    let workflows = WorkflowRegistry::builder()
        .register("Parent", |ctx: WorkflowContext, input: String| async move {
            let doubled = ctx.start_child("Child", "child-of-parent-1", input).await?;
            Ok(format!("child said {doubled}"))
        })
        .register("Child", |_ctx: WorkflowContext, input: String| async move {
            let n: u64 = input.parse().map_err(|e| format!("bad input: {e}"))?;
            Ok((n * 2).to_string())
        })
        .build();
    let (rt, client, _) = start_runtime(ActivityRegistry::builder().build(), workflows).await;

    client.start_workflow("parent-1", "Parent", "21").await.unwrap();
    let status = client.wait_for_workflow("parent-1", WAIT).await.unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "child said 42".into()
        }
    );
    // The child is a workflow of its own.
    let child = client.wait_for_workflow("child-of-parent-1", WAIT).await.unwrap();
    assert_eq!(child, WorkflowStatus::Completed { output: "42".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn queries_read_exposed_state_without_appending() {
    let workflows = WorkflowRegistry::builder()
        .register("Counting", |ctx: WorkflowContext, _input: String| async move {
            ctx.expose_query("count", "0");
            let mut count = 0u32;
            loop {
                let payload = ctx.await_signal("bump").await?;
                if payload == "done" {
                    break;
                }
                count += 1;
                ctx.expose_query("count", count.to_string());
            }
            Ok(count.to_string())
        })
        .build();
    let (rt, client, _) = start_runtime(ActivityRegistry::builder().build(), workflows).await;

    client.start_workflow("count-1", "Counting", "").await.unwrap();
    client.signal_workflow("count-1", "bump", "x").await.unwrap();
    client.signal_workflow("count-1", "bump", "y").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let history_before = client.read_history("count-1").await.unwrap().len();
    let value = rt.query_workflow("count-1", "count").await.unwrap();
    assert_eq!(value.as_deref(), Some("2"));
    assert_eq!(rt.query_workflow("count-1", "missing").await.unwrap(), None);
    let history_after = client.read_history("count-1").await.unwrap().len();
    assert_eq!(history_before, history_after, "queries must not append events");

    client.signal_workflow("count-1", "bump", "done").await.unwrap();
    client.wait_for_workflow("count-1", WAIT).await.unwrap();
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_start_is_rejected_while_running() {
    let workflows = WorkflowRegistry::builder()
        .register("Idle", |ctx: WorkflowContext, _input: String| async move {
            ctx.await_signal("finish").await?;
            Ok(String::new())
        })
        .build();
    let (rt, client, _) = start_runtime(ActivityRegistry::builder().build(), workflows).await;

    client.start_workflow("idle-1", "Idle", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = client.start_workflow("idle-1", "Idle", "").await.unwrap_err();
    assert!(matches!(err, houseflow::ClientError::AlreadyExists { .. }));

    // Terminal runs free the id under the default reuse policy, but not under
    // RejectDuplicate.
    client.signal_workflow("idle-1", "finish", "").await.unwrap();
    client.wait_for_workflow("idle-1", WAIT).await.unwrap();
    let err = client
        .start_workflow_with_options(
            "idle-1",
            "Idle",
            "",
            StartOptions {
                reuse_policy: WorkflowIdReusePolicy::RejectDuplicate,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, houseflow::ClientError::AlreadyExists { .. }));

    // The default policy lets a terminated id start a fresh run.
    client.start_workflow("idle-1", "Idle", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        client.get_workflow_status("idle-1").await.unwrap(),
        WorkflowStatus::Running
    ));
    client.signal_workflow("idle-1", "finish", "").await.unwrap();
    client.wait_for_workflow("idle-1", WAIT).await.unwrap();
    rt.shutdown().await;
}

#[tokio::test]
async fn signals_to_unknown_workflows_are_noops_unless_strict() {
    let (rt, client, _) = start_runtime(
        ActivityRegistry::builder().build(),
        WorkflowRegistry::builder().build(),
    )
    .await;

    client.signal_workflow("ghost-1", "poke", "").await.unwrap();

    let strict = client.clone().with_strict_signals(true);
    let err = strict.signal_workflow("ghost-1", "poke", "").await.unwrap_err();
    assert!(matches!(err, houseflow::ClientError::NotFound { .. }));
    rt.shutdown().await;
}

#[tokio::test]
async fn selector_races_timer_against_signal() {
    let workflows = WorkflowRegistry::builder()
        .register("Race", |ctx: WorkflowContext, _input: String| async move {
            let timer = ctx.schedule_timer(Duration::from_secs(3600));
            let approval = ctx.await_signal("approve");
            match ctx.select2(approval, timer).await {
                Either2::First(payload) => Ok(format!("approved: {}", payload?)),
                Either2::Second(fired) => {
                    fired?;
                    Ok("timed out".into())
                }
            }
        })
        .build();
    let (rt, client, _) = start_runtime(ActivityRegistry::builder().build(), workflows).await;

    client.start_workflow("race-1", "Race", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.signal_workflow("race-1", "approve", "yes").await.unwrap();
    let status = client.wait_for_workflow("race-1", WAIT).await.unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "approved: yes".into()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn seeded_rand_is_stable_across_replay() {
    let workflows = WorkflowRegistry::builder()
        .register("Dice", |ctx: WorkflowContext, _input: String| async move {
            let before = ctx.rand_u64();
            // Suspend so the value above is recomputed by replay on the next
            // turn rather than remembered in memory.
            ctx.await_signal("go").await?;
            let after = ctx.rand_u64();
            Ok(format!("{before}:{after}"))
        })
        .build();
    let (rt, client, _) = start_runtime(ActivityRegistry::builder().build(), workflows).await;

    client.start_workflow("dice-1", "Dice", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.signal_workflow("dice-1", "go", "").await.unwrap();
    let status = client.wait_for_workflow("dice-1", WAIT).await.unwrap();
    let WorkflowStatus::Completed { output } = status else {
        panic!("expected completion");
    };
    let (before, after) = output.split_once(':').unwrap();
    // Both draws come from the seed persisted in WorkflowStarted; the first
    // draw was produced twice (live + replay) and must agree with itself.
    assert_ne!(before, after);
    assert!(!before.is_empty() && !after.is_empty());
    rt.shutdown().await;
}
