//! End-to-end run scenarios against the in-memory store and queue.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use stepweave_workflow::envelope::Envelope;
use stepweave_workflow::{
    DataRef, EngineConfig, FunctionRegistry, FunctionSpec, GraphRunner, InMemoryQueue,
    InMemoryStepStore, InvokeError, NodeInstance, Queue, QueueError, QueueHandler, RetryPolicy,
    RunStatus, StepDisposition, StepMessage, StepStateStore, StepStatus, StepWorker, Targets,
    TurnOutcome, Workflow, WorkflowGraph, WorkflowRegistry, register_flow_control,
    register_workers, step_queue,
};

type Runner = GraphRunner<InMemoryStepStore, InMemoryQueue>;

#[derive(Clone, Default)]
struct Calls {
    echo: Arc<AtomicU32>,
    remote: Arc<AtomicU32>,
    flaky: Arc<AtomicU32>,
    sluggish: Arc<AtomicU32>,
}

fn functions(calls: &Calls) -> FunctionRegistry {
    let mut functions = FunctionRegistry::new();
    register_flow_control(&mut functions);

    let echo = calls.echo.clone();
    functions.register_fn("echo", FunctionSpec::new(), move |input, _| {
        let echo = echo.clone();
        async move {
            echo.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        }
    });
    functions.register_fn("nested", FunctionSpec::new(), |_, _| async move {
        Ok(json!({ "value": { "nested": 42 } }))
    });
    functions.register_fn("boom", FunctionSpec::new(), |_, _| async move {
        Err(InvokeError::new("boom").with_code("E_BOOM"))
    });

    let remote = calls.remote.clone();
    functions.register_fn("remote", FunctionSpec::new().deferred(), move |input, _| {
        let remote = remote.clone();
        async move {
            remote.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "remote": input }))
        }
    });

    // Fails on its first two attempts.
    let flaky = calls.flaky.clone();
    functions.register_fn("flaky", FunctionSpec::new().deferred(), move |_, _| {
        let flaky = flaky.clone();
        async move {
            let attempt = flaky.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(InvokeError::new(format!("transient failure {attempt}")))
            } else {
                Ok(json!("recovered"))
            }
        }
    });
    functions.register_fn("broken", FunctionSpec::new().deferred(), |_, _| async move {
        Err(InvokeError::new("remote boom"))
    });

    let sluggish = calls.sluggish.clone();
    functions.register_fn("sluggish", FunctionSpec::new().deferred(), move |_, _| {
        let sluggish = sluggish.clone();
        async move {
            sluggish.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("slow"))
        }
    });
    functions
}

/// Wraps the in-memory queue and fails the first few continuation publishes.
struct LossyQueue {
    inner: InMemoryQueue,
    continuation_failures: AtomicU32,
}

impl LossyQueue {
    fn new(continuation_failures: u32) -> Self {
        Self {
            inner: InMemoryQueue::new(),
            continuation_failures: AtomicU32::new(continuation_failures),
        }
    }
}

#[async_trait]
impl Queue for LossyQueue {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let fail = queue.ends_with(".orchestrator")
            && self
                .continuation_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(QueueError::PublishFailed {
                queue: queue.to_string(),
                message: "broker unavailable".to_string(),
            });
        }
        self.inner.enqueue(queue, payload).await
    }

    async fn register_worker(
        &self,
        queue: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<(), QueueError> {
        self.inner.register_worker(queue, handler).await
    }
}

struct Harness {
    runner: Arc<Runner>,
    calls: Calls,
}

impl Harness {
    async fn new(workflows: Vec<Workflow>) -> Self {
        Self::with_retry(workflows, RetryPolicy::default()).await
    }

    async fn with_retry(workflows: Vec<Workflow>, retry: RetryPolicy) -> Self {
        let calls = Calls::default();
        let functions = functions(&calls);
        let mut registry = WorkflowRegistry::new();
        for workflow in workflows {
            registry.register(workflow, &functions).unwrap();
        }
        let runner = Arc::new(GraphRunner::new(
            Arc::new(InMemoryStepStore::new()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(functions),
            Arc::new(registry),
            EngineConfig::default(),
        ));
        register_workers(Arc::clone(&runner), retry).await.unwrap();
        Self { runner, calls }
    }

    async fn drain(&self) -> usize {
        self.runner.queue().run_until_idle().await
    }
}

fn output_of(outcome: &TurnOutcome) -> &JsonValue {
    match outcome {
        TurnOutcome::Completed { output } => output,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn no_entry_nodes_persists_nothing() {
    // Both roots wait on each other's output; nothing can run on the trigger alone.
    let workflow = Workflow::new(
        "stuck",
        WorkflowGraph::new()
            .with("a", NodeInstance::new("echo").with_ref("x", DataRef::new("b")))
            .with("b", NodeInstance::new("echo").with_ref("x", DataRef::new("a"))),
    );
    let harness = Harness::new(vec![workflow]).await;

    let err = harness.runner.start_run("stuck", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("no entry nodes ready"));
    assert_eq!(harness.runner.store().run_count().await, 0);
}

#[tokio::test]
async fn run_stays_running_while_deferred_step_is_in_flight() {
    let workflow = Workflow::new(
        "mixed",
        WorkflowGraph::new()
            .with("start", NodeInstance::new("echo").fan_out(["fast", "slow"]))
            .with("fast", NodeInstance::new("echo").with_literal("v", json!(1)))
            .with("slow", NodeInstance::new("remote").with_literal("v", json!(2))),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("mixed", json!({})).await.unwrap();
    assert_eq!(
        started.outcome,
        TurnOutcome::Suspended {
            waiting_on: vec!["slow".to_string()]
        }
    );
    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Running);
    assert!(state.completed.contains_key("fast"));

    harness.drain().await;

    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(
        state.output,
        Some(json!({ "fast": { "v": 1 }, "slow": { "remote": { "v": 2 } } }))
    );
    let record = harness
        .runner
        .store()
        .get_run(started.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RunStatus::Completed);
}

#[tokio::test]
async fn duplicate_delivery_executes_step_once() {
    let workflow = Workflow::new(
        "dup",
        WorkflowGraph::new().with("a", NodeInstance::new("remote").with_ref("x", DataRef::trigger())),
    );
    let harness = Harness::new(vec![workflow]).await;
    let queue = harness.runner.queue();

    let started = harness.runner.start_run("dup", json!({"n": 1})).await.unwrap();
    let step_queue = stepweave_workflow::step_queue("dup", "a");
    let pending = queue.pending_on(&step_queue);
    assert_eq!(pending.len(), 1);
    // Simulate the transport redelivering the same message.
    queue.enqueue(&step_queue, pending[0].clone()).await.unwrap();

    harness.drain().await;

    assert_eq!(harness.calls.remote.load(Ordering::SeqCst), 1);
    let step = harness
        .runner
        .store()
        .get_step_state(started.run_id, "a:0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Done);
    assert_eq!(step.attempt_count, 1);
    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
}

#[tokio::test]
async fn concurrent_deliveries_execute_step_once() {
    let workflow = Workflow::new(
        "race",
        WorkflowGraph::new().with("a", NodeInstance::new("sluggish")),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("race", json!({})).await.unwrap();
    let pending = harness.runner.queue().pending_on(&step_queue("race", "a"));
    let message: Envelope<StepMessage> = Envelope::from_json_bytes(&pending[0]).unwrap();

    // Two consumers receive the same step while it is still executing.
    let worker = StepWorker::new(Arc::clone(&harness.runner), RetryPolicy::default());
    let (first, second) = tokio::join!(
        worker.process(&message.payload),
        worker.process(&message.payload)
    );

    assert_eq!(harness.calls.sluggish.load(Ordering::SeqCst), 1);
    let completed = [&first, &second]
        .into_iter()
        .filter(|disposition| matches!(disposition, Ok(StepDisposition::Completed)))
        .count();
    assert_eq!(completed, 1);
    let refused = if first.is_err() { first } else { second };
    assert!(refused.unwrap_err().message.contains("already executing"));

    harness.drain().await;
    assert_eq!(harness.calls.sluggish.load(Ordering::SeqCst), 1);
    let step = harness
        .runner
        .store()
        .get_step_state(started.run_id, "a:0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.attempt_count, 1);
    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
}

#[tokio::test]
async fn lost_continuation_is_resent_on_redelivery() {
    let calls = Calls::default();
    let functions = Arc::new(functions(&calls));
    let mut registry = WorkflowRegistry::new();
    registry
        .register(
            Workflow::new(
                "lossy",
                WorkflowGraph::new()
                    .with("a", NodeInstance::new("remote").then("b"))
                    .with("b", NodeInstance::new("echo").with_ref("x", DataRef::new("a"))),
            ),
            &functions,
        )
        .unwrap();
    let queue = Arc::new(LossyQueue::new(1));
    let runner = Arc::new(GraphRunner::new(
        Arc::new(InMemoryStepStore::new()),
        Arc::clone(&queue),
        functions,
        Arc::new(registry),
        EngineConfig::default(),
    ));
    register_workers(Arc::clone(&runner), RetryPolicy::default())
        .await
        .unwrap();

    let started = runner.start_run("lossy", json!({})).await.unwrap();
    queue.inner.run_until_idle().await;

    assert_eq!(calls.remote.load(Ordering::SeqCst), 1);
    let state = runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.output, Some(json!({ "b": { "x": { "remote": {} } } })));
    assert!(queue.inner.dead_letters().is_empty());
}

#[tokio::test]
async fn inline_failure_is_visible_synchronously() {
    let workflow = Workflow::new(
        "roundtrip",
        WorkflowGraph::new()
            .with("a", NodeInstance::new("echo").then("b"))
            .with("b", NodeInstance::new("boom")),
    );
    let harness = Harness::new(vec![workflow]).await;

    let err = harness
        .runner
        .start_run("roundtrip", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("boom"));

    // The failed run is persisted and readable.
    let store = harness.runner.store();
    let run_ids = store.run_ids().await;
    assert_eq!(run_ids.len(), 1);
    let state = harness.runner.get_run(run_ids[0]).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    let error = state.error.unwrap();
    assert!(error.message.contains("boom"));
    assert_eq!(error.code.as_deref(), Some("E_BOOM"));
    assert!(state.completed["a"].is_success());

    let record = store.get_run(run_ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(store.steps_for(run_ids[0]).await.is_empty());
}

#[tokio::test]
async fn while_loop_exits_at_its_bound() {
    let workflow = Workflow::new(
        "loop",
        WorkflowGraph::new()
            .with("start", NodeInstance::new("echo").then("loop"))
            .with(
                "loop",
                NodeInstance::new("whileLoop")
                    .with_literal("condition", json!(true))
                    .with_literal("maxIterations", json!(3))
                    .branch("continue", "body")
                    .branch("done", "end"),
            )
            .with("body", NodeInstance::new("echo").then("loop"))
            .with("end", NodeInstance::new("echo")),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("loop", json!({})).await.unwrap();
    output_of(&started.outcome);

    let state = harness.runner.get_run(started.run_id).await.unwrap();
    let last = &state.completed["loop"];
    assert_eq!(last.iteration, 3);
    assert_eq!(last.selected_branch.as_deref(), Some("done"));
    assert_eq!(state.iterations["body"], 3);
    assert_eq!(state.iterations["end"], 1);
}

#[tokio::test]
async fn refs_resolve_nested_paths() {
    let workflow = Workflow::new(
        "refs",
        WorkflowGraph::new()
            .with("a", NodeInstance::new("nested").then("b"))
            .with(
                "b",
                NodeInstance::new("echo").with_ref("x", DataRef::new("a").at("value.nested")),
            ),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("refs", json!({})).await.unwrap();
    assert_eq!(output_of(&started.outcome), &json!({ "b": { "x": 42 } }));
}

#[tokio::test]
async fn on_error_routes_inline_failure() {
    let workflow = Workflow::new(
        "recover",
        WorkflowGraph::new()
            .with("a", NodeInstance::new("boom").then("never").on_error("handler"))
            .with("never", NodeInstance::new("echo"))
            .with("handler", NodeInstance::new("echo").with_literal("recovered", json!(true))),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("recover", json!({})).await.unwrap();
    assert_eq!(
        output_of(&started.outcome),
        &json!({ "handler": { "recovered": true } })
    );
    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert!(!state.completed.contains_key("never"));
    assert!(state.completed["a"].error.is_some());
}

#[tokio::test]
async fn untaken_branch_is_skipped() {
    let workflow = Workflow::new(
        "branch",
        WorkflowGraph::new()
            .with(
                "check",
                NodeInstance::new("ifCondition")
                    .with_ref("condition", DataRef::trigger().at("paid"))
                    .branch("true", "ship")
                    .branch("false", "remind"),
            )
            .with("ship", NodeInstance::new("echo").with_literal("shipped", json!(true)))
            .with("remind", NodeInstance::new("echo").with_literal("reminded", json!(true))),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness
        .runner
        .start_run("branch", json!({ "paid": false }))
        .await
        .unwrap();
    assert_eq!(
        output_of(&started.outcome),
        &json!({ "remind": { "reminded": true } })
    );
    assert_eq!(harness.calls.echo.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fan_out_joins_on_data() {
    let workflow = Workflow::new(
        "join",
        WorkflowGraph::new()
            .with("start", NodeInstance::new("echo").fan_out(["left", "right"]))
            .with("left", NodeInstance::new("echo").with_literal("side", json!("l")).then("join"))
            .with("right", NodeInstance::new("remote").with_literal("side", json!("r")).then("join"))
            .with(
                "join",
                NodeInstance::new("merge")
                    .with_ref("left", DataRef::new("left").at("side"))
                    .with_ref("right", DataRef::new("right").at("remote.side")),
            ),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("join", json!({})).await.unwrap();
    // `join` is activated by `left` but waits for the deferred `right`.
    assert!(matches!(started.outcome, TurnOutcome::Suspended { .. }));
    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert!(state.activated.contains("join"));

    harness.drain().await;

    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(
        state.output,
        Some(json!({ "join": { "left": "l", "right": "r" } }))
    );
    assert_eq!(state.iterations["join"], 1);
}

#[tokio::test]
async fn deferred_step_is_retried_until_it_succeeds() {
    let workflow = Workflow::new(
        "retry",
        WorkflowGraph::new().with("a", NodeInstance::new("flaky")),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("retry", json!({})).await.unwrap();
    harness.drain().await;

    assert_eq!(harness.calls.flaky.load(Ordering::SeqCst), 3);
    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.output, Some(json!({ "a": "recovered" })));
    let step = harness
        .runner
        .store()
        .get_step_state(started.run_id, "a:0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.attempt_count, 3);
}

#[tokio::test]
async fn exhausted_deferred_step_fails_the_run() {
    let workflow = Workflow::new(
        "exhaust",
        WorkflowGraph::new().with("a", NodeInstance::new("broken")),
    );
    let retry = RetryPolicy {
        max_attempts: 2,
        ..RetryPolicy::default()
    };
    let harness = Harness::with_retry(vec![workflow], retry).await;

    let started = harness.runner.start_run("exhaust", json!({})).await.unwrap();
    harness.drain().await;

    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state.error.unwrap().message.contains("remote boom"));
    let step = harness
        .runner
        .store()
        .get_step_state(started.run_id, "a:0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempt_count, 2);
    assert!(harness.runner.queue().dead_letters().is_empty());
}

#[tokio::test]
async fn exhausted_deferred_step_routes_on_error() {
    let workflow = Workflow::new(
        "fallback",
        WorkflowGraph::new()
            .with("a", NodeInstance::new("broken").on_error(Targets::One("fallback".into())))
            .with("fallback", NodeInstance::new("echo").with_literal("fallback", json!(true))),
    );
    let retry = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };
    let harness = Harness::with_retry(vec![workflow], retry).await;

    let started = harness.runner.start_run("fallback", json!({})).await.unwrap();
    harness.drain().await;

    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.output, Some(json!({ "fallback": { "fallback": true } })));
}

#[tokio::test]
async fn cancelled_run_discards_deferred_work() {
    let workflow = Workflow::new(
        "cancel",
        WorkflowGraph::new().with("a", NodeInstance::new("remote")),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("cancel", json!({})).await.unwrap();
    assert!(harness.runner.cancel_run(started.run_id).await.unwrap());
    harness.drain().await;

    assert_eq!(harness.calls.remote.load(Ordering::SeqCst), 0);
    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    let step = harness
        .runner
        .store()
        .get_step_state(started.run_id, "a:0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Pending);
}

#[tokio::test]
async fn deferred_loop_iterations_get_their_own_steps() {
    let workflow = Workflow::new(
        "deferred_loop",
        WorkflowGraph::new()
            .with("start", NodeInstance::new("echo").then("loop"))
            .with(
                "loop",
                NodeInstance::new("forLoop")
                    .with_literal("count", json!(2))
                    .branch("next", "work")
                    .branch("done", "end"),
            )
            .with(
                "work",
                NodeInstance::new("remote")
                    .with_ref("index", DataRef::new("loop"))
                    .then("loop"),
            )
            .with("end", NodeInstance::new("echo")),
    );
    let harness = Harness::new(vec![workflow]).await;

    let started = harness.runner.start_run("deferred_loop", json!({})).await.unwrap();
    harness.drain().await;

    let state = harness.runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(harness.calls.remote.load(Ordering::SeqCst), 2);
    let store = harness.runner.store();
    let first = store
        .get_step_state(started.run_id, "work:0")
        .await
        .unwrap()
        .unwrap();
    let second = store
        .get_step_state(started.run_id, "work:1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.input, json!({ "index": 0 }));
    assert_eq!(second.input, json!({ "index": 1 }));
}

#[tokio::test]
async fn continuation_fails_run_when_graph_changed() {
    let calls = Calls::default();
    let functions = Arc::new(functions(&calls));
    let store = Arc::new(InMemoryStepStore::new());
    let queue = Arc::new(InMemoryQueue::new());

    let original = Workflow::new(
        "evolving",
        WorkflowGraph::new().with("a", NodeInstance::new("remote")),
    );
    let changed = Workflow::new(
        "evolving",
        WorkflowGraph::new()
            .with("a", NodeInstance::new("remote").then("b"))
            .with("b", NodeInstance::new("echo")),
    );

    let mut before = WorkflowRegistry::new();
    before.register(original, &functions).unwrap();
    let mut after = WorkflowRegistry::new();
    after.register(changed, &functions).unwrap();

    let old_runner = GraphRunner::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&functions),
        Arc::new(before),
        EngineConfig::default(),
    );
    let new_runner = GraphRunner::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&functions),
        Arc::new(after),
        EngineConfig::default(),
    );

    let started = old_runner.start_run("evolving", json!({})).await.unwrap();
    let outcome = new_runner.continue_graph(started.run_id).await.unwrap();
    let TurnOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code.as_deref(), Some("graph_mismatch"));
    assert!(error.message.contains("changed"));

    let state = new_runner.get_run(started.run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    let record = store.get_run(started.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        record.error.and_then(|error| error.code).as_deref(),
        Some("graph_mismatch")
    );

    // Later continuations leave the failed run alone.
    let outcome = new_runner.continue_graph(started.run_id).await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Inactive {
            status: RunStatus::Failed
        }
    );
}
