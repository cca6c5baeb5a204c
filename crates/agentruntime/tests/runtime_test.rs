// crates/agentruntime/tests/runtime_test.rs

use agentcore::store::{ContextStore, InMemoryContextStore, InMemoryGraphSource};
use agentcore::{
    ContextSnapshot, EngineError, ExecutionId, NodeContext, NodeDef, NodeError, NodeExecutor,
    NodeOutcome, NodeOutput, NodeStatus, ReviewDecision, RunEvent, RunStatus, StoreError,
    FINAL_OUTPUT,
};
use agentruntime::{AgentRuntime, NodeFactory, NodeRegistry, RuntimeConfig};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Tracks how many scripted nodes run at once.
#[derive(Default)]
struct Probe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Node behaviour driven entirely by its config.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
struct Script {
    delay_ms: u64,
    ignore_cancel: bool,
    transient_failures: u32,
    fail: Option<String>,
    review: Option<String>,
    routes: Option<Vec<String>>,
    output: Option<Value>,
    final_output: bool,
}

struct ScriptedNode {
    script: Script,
    probe: Arc<Probe>,
}

impl ScriptedNode {
    async fn run(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let script = &self.script;
        if script.delay_ms > 0 {
            let delay = tokio::time::sleep(Duration::from_millis(script.delay_ms));
            if script.ignore_cancel {
                delay.await;
            } else {
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => return Ok(NodeOutcome::Cancelled),
                    _ = delay => {}
                }
            }
        }
        if ctx.attempt <= script.transient_failures {
            return Err(NodeError::Transient(format!("attempt {}", ctx.attempt)));
        }
        if let Some(message) = &script.fail {
            return Err(NodeError::ExecutionFailed(message.clone()));
        }
        if let Some(prompt) = &script.review {
            return Ok(NodeOutcome::AwaitReview {
                prompt: prompt.clone(),
            });
        }

        let value = script.output.clone().unwrap_or_else(|| json!(ctx.node_id));
        if script.final_output {
            ctx.context.set(FINAL_OUTPUT, value.clone()).await;
        }
        let mut output = NodeOutput::new(value);
        if let Some(routes) = &script.routes {
            output = output.with_routes(routes.clone());
        }
        Ok(NodeOutcome::Completed(output))
    }
}

#[async_trait]
impl NodeExecutor for ScriptedNode {
    fn node_type(&self) -> &str {
        "task"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(active, Ordering::SeqCst);
        let result = self.run(&ctx).await;
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct ScriptedFactory {
    probe: Arc<Probe>,
}

impl NodeFactory for ScriptedFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        let script = if node.config.is_null() {
            Script::default()
        } else {
            serde_json::from_value(node.config.clone())
                .map_err(|e| NodeError::config(format!("bad script: {}", e)))?
        };
        Ok(Arc::new(ScriptedNode {
            script,
            probe: self.probe.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        "task"
    }
}

struct Harness {
    runtime: AgentRuntime,
    store: Arc<InMemoryContextStore>,
    probe: Arc<Probe>,
}

async fn harness(graph: Value, config: RuntimeConfig) -> Harness {
    harness_with_store(graph, config, Arc::new(InMemoryContextStore::new())).await
}

async fn harness_with_store(
    graph: Value,
    config: RuntimeConfig,
    store: Arc<InMemoryContextStore>,
) -> Harness {
    init_tracing();
    let probe = Arc::new(Probe::default());
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(ScriptedFactory {
        probe: probe.clone(),
    }));

    let source = Arc::new(InMemoryGraphSource::new());
    source.insert("agent", graph.to_string()).await;

    let runtime = AgentRuntime::new(Arc::new(registry), source, store.clone(), config);
    Harness {
        runtime,
        store,
        probe,
    }
}

fn task(id: &str, config: Value) -> Value {
    json!({ "id": id, "type": "task", "config": config })
}

fn graph(nodes: Vec<Value>, edges: &[(&str, &str)]) -> Value {
    let edges: Vec<Value> = edges
        .iter()
        .map(|(from, to)| json!({ "from": from, "to": to }))
        .collect();
    json!({ "id": "test-graph", "nodes": nodes, "edges": edges })
}

/// Read events until the stream closes.
async fn drain(rx: &mut Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => return events,
            Err(_) => panic!("stream did not close; got {:?}", events),
        }
    }
}

/// Read events up to and including the first one matching `stop`.
async fn read_until(rx: &mut Receiver<RunEvent>, stop: impl Fn(&RunEvent) -> bool) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed early");
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

async fn snapshot(store: &InMemoryContextStore, id: ExecutionId) -> ContextSnapshot {
    store.load(id).await.unwrap().expect("snapshot persisted")
}

fn latest_status(snapshot: &ContextSnapshot, node_id: &str) -> Option<NodeStatus> {
    snapshot
        .latest_records()
        .into_iter()
        .find(|r| r.node_id == node_id)
        .map(|r| r.status)
}

fn started_ids(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::NodeStarted { node_id, .. } => Some(node_id.clone()),
            _ => None,
        })
        .collect()
}

fn completed_ids(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::NodeCompleted { node_id, .. } => Some(node_id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_linear_run_completes_and_closes_stream() {
    let h = harness(
        graph(
            vec![
                task("start", json!({})),
                task("work", json!({ "delay_ms": 5 })),
                task("end", json!({ "output": "done", "final_output": true })),
            ],
            &[("start", "work"), ("work", "end")],
        ),
        RuntimeConfig::default(),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hello", None, sink).await.unwrap();
    let events = drain(&mut rx).await;

    assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
    assert_eq!(completed_ids(&events), vec!["start", "work", "end"]);
    match events.last() {
        Some(RunEvent::RunCompleted { output, .. }) => assert_eq!(output, &Some(json!("done"))),
        other => panic!("expected RunCompleted last, got {:?}", other),
    }
    assert!(events.iter().all(|e| e.execution_id() == id), "one execution id throughout");
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    assert_eq!(h.runtime.wait(id).await.unwrap(), RunStatus::Completed);
    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(snap.variables["user_message"], json!("hello"));
    assert_eq!(snap.variables["work.output"], json!("work"));
    assert_eq!(snap.count_status(NodeStatus::Completed), 3);
}

#[tokio::test]
async fn test_branch_runs_only_selected_path() {
    let h = harness(
        graph(
            vec![
                task("router", json!({ "routes": ["refund"] })),
                task("refund", json!({})),
                task("refund_done", json!({})),
                task("other", json!({})),
                task("other_done", json!({})),
            ],
            &[
                ("router", "refund"),
                ("router", "other"),
                ("refund", "refund_done"),
                ("other", "other_done"),
            ],
        ),
        RuntimeConfig::default(),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "I want a refund", None, sink).await.unwrap();
    let events = drain(&mut rx).await;

    assert_eq!(completed_ids(&events), vec!["router", "refund", "refund_done"]);
    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(latest_status(&snap, "other"), Some(NodeStatus::Skipped));
    assert_eq!(latest_status(&snap, "other_done"), Some(NodeStatus::Skipped));
    let router = snap.latest_records().into_iter().find(|r| r.node_id == "router").unwrap();
    assert_eq!(router.routes, Some(vec!["refund".to_string()]));
}

#[tokio::test]
async fn test_join_runs_once_after_all_predecessors() {
    let h = harness(
        graph(
            vec![
                task("root", json!({})),
                task("left", json!({ "delay_ms": 20 })),
                task("right", json!({ "delay_ms": 5 })),
                task("join", json!({})),
            ],
            &[("root", "left"), ("root", "right"), ("left", "join"), ("right", "join")],
        ),
        RuntimeConfig::default(),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    let events = drain(&mut rx).await;

    let completed = completed_ids(&events);
    assert_eq!(completed.last().map(String::as_str), Some("join"));
    assert_eq!(completed.iter().filter(|id| *id == "join").count(), 1);
    assert!(h.probe.peak.load(Ordering::SeqCst) >= 2, "siblings ran concurrently");
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let nodes: Vec<Value> = std::iter::once(task("root", json!({})))
        .chain((0..6).map(|i| task(&format!("n{}", i), json!({ "delay_ms": 15 }))))
        .collect();
    let names: Vec<String> = (0..6).map(|i| format!("n{}", i)).collect();
    let edges: Vec<(&str, &str)> = names.iter().map(|n| ("root", n.as_str())).collect();

    let h = harness(graph(nodes, &edges), RuntimeConfig::default().with_max_parallel_nodes(2)).await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    drain(&mut rx).await;

    assert_eq!(h.runtime.wait(id).await.unwrap(), RunStatus::Completed);
    assert_eq!(h.probe.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fail_fast_cancels_siblings_and_skips_rest() {
    let h = harness(
        graph(
            vec![
                task("root", json!({})),
                task("bad", json!({ "delay_ms": 10, "fail": "boom" })),
                task("slow", json!({ "delay_ms": 5000 })),
                task("after", json!({})),
            ],
            &[("root", "bad"), ("root", "slow"), ("slow", "after")],
        ),
        RuntimeConfig::default(),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    let events = drain(&mut rx).await;

    match events.last() {
        Some(RunEvent::RunFailed { cause, .. }) => {
            assert_eq!(cause.node_id.as_deref(), Some("bad"));
            assert!(cause.message.contains("boom"));
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }

    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Failed);
    assert_eq!(latest_status(&snap, "bad"), Some(NodeStatus::Failed));
    assert_eq!(latest_status(&snap, "slow"), Some(NodeStatus::Cancelled));
    assert_eq!(latest_status(&snap, "after"), Some(NodeStatus::Skipped));
    assert!(snap.error.unwrap().contains("boom"));
}

#[tokio::test]
async fn test_continue_on_error_finishes_independent_branch() {
    let mut g = graph(
        vec![
            task("root", json!({})),
            task("bad", json!({ "fail": "boom" })),
            task("bad_child", json!({})),
            task("good", json!({ "delay_ms": 20 })),
            task("good_child", json!({})),
        ],
        &[
            ("root", "bad"),
            ("root", "good"),
            ("bad", "bad_child"),
            ("good", "good_child"),
        ],
    );
    g["settings"] = json!({ "on_error": "continue_on_error" });

    let h = harness(g, RuntimeConfig::default()).await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    drain(&mut rx).await;

    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Failed, "a failed node still fails the run");
    assert_eq!(latest_status(&snap, "good_child"), Some(NodeStatus::Completed));
    assert_eq!(latest_status(&snap, "bad_child"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let g = json!({
        "id": "retry",
        "nodes": [{
            "id": "flaky",
            "type": "task",
            "config": { "transient_failures": 2 },
            "retry": { "max_attempts": 3, "delay_ms": 5 }
        }],
        "edges": []
    });
    let h = harness(g, RuntimeConfig::default()).await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    let events = drain(&mut rx).await;

    let retries = events
        .iter()
        .filter(|e| matches!(e, RunEvent::NodeFailed { will_retry: true, .. }))
        .count();
    assert_eq!(retries, 2);

    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Completed);
    let attempts: Vec<(u32, NodeStatus)> = snap.node_history.iter().map(|r| (r.attempt, r.status)).collect();
    assert_eq!(
        attempts,
        vec![(1, NodeStatus::Failed), (2, NodeStatus::Failed), (3, NodeStatus::Completed)]
    );
}

#[tokio::test]
async fn test_cancel_before_any_completion() {
    let h = harness(
        graph(
            vec![task("slow", json!({ "delay_ms": 5000 })), task("next", json!({}))],
            &[("slow", "next")],
        ),
        RuntimeConfig::default(),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    read_until(&mut rx, |e| matches!(e, RunEvent::NodeStarted { .. })).await;
    h.runtime.cancel_run(id).await.unwrap();

    let events = drain(&mut rx).await;
    assert!(matches!(events.last(), Some(RunEvent::RunCancelled { .. })));
    assert_eq!(h.runtime.wait(id).await.unwrap(), RunStatus::Cancelled);

    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Cancelled);
    assert_eq!(snap.count_status(NodeStatus::Completed), 0);
    assert_eq!(latest_status(&snap, "slow"), Some(NodeStatus::Cancelled));
    assert_eq!(latest_status(&snap, "next"), Some(NodeStatus::Skipped));

    let err = h.runtime.cancel_run(id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn test_node_ignoring_cancel_is_abandoned_after_grace() {
    let h = harness(
        graph(vec![task("stubborn", json!({ "delay_ms": 10_000, "ignore_cancel": true }))], &[]),
        RuntimeConfig::default().with_cancel_grace_ms(50),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    read_until(&mut rx, |e| matches!(e, RunEvent::NodeStarted { .. })).await;
    h.runtime.cancel_run(id).await.unwrap();
    drain(&mut rx).await;

    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Cancelled);
    let record = snap.node_history.last().unwrap();
    assert_eq!(record.status, NodeStatus::Cancelled);
    assert_eq!(record.error.as_deref(), Some("abandoned after grace period"));
}

fn review_graph() -> Value {
    graph(
        vec![
            task("draft", json!({ "output": "draft text" })),
            task("review", json!({ "review": "Send this reply?" })),
            task("send", json!({ "output": "sent", "final_output": true })),
            task("log", json!({})),
        ],
        &[("draft", "review"), ("review", "send"), ("review", "log")],
    )
}

#[tokio::test]
async fn test_review_suspends_then_approve_continues() {
    let h = harness(review_graph(), RuntimeConfig::default()).await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();

    let events = read_until(&mut rx, |e| matches!(e, RunEvent::RunSuspended { .. })).await;
    match events.last() {
        Some(RunEvent::RunSuspended { review, .. }) => {
            assert_eq!(review.node_id, "review");
            assert_eq!(review.prompt, "Send this reply?");
        }
        other => panic!("expected RunSuspended, got {:?}", other),
    }
    assert_eq!(h.runtime.wait(id).await.unwrap(), RunStatus::SuspendedForReview);

    let state = h.runtime.status(id).await.unwrap();
    assert_eq!(state.status, RunStatus::SuspendedForReview);
    assert_eq!(state.pending_review.unwrap().node_id, "review");

    let stored = snapshot(&h.store, id).await;
    assert_eq!(stored.status, RunStatus::SuspendedForReview);
    assert_eq!(latest_status(&stored, "review"), Some(NodeStatus::Pending));

    h.runtime.resume_run(id, ReviewDecision::approve()).await.unwrap();
    let events = drain(&mut rx).await;

    assert!(matches!(
        events.first(),
        Some(RunEvent::RunResumed { approved: true, .. })
    ));
    assert_eq!(started_ids(&events), vec!["send", "log"], "successors in declared order");
    assert_eq!(completed_ids(&events).len(), 2);
    assert!(matches!(events.last(), Some(RunEvent::RunCompleted { .. })));

    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(latest_status(&snap, "review"), Some(NodeStatus::Completed));
    assert_eq!(snap.variables[FINAL_OUTPUT], json!("sent"));
}

#[tokio::test]
async fn test_review_reject_fails_and_skips_downstream() {
    let h = harness(review_graph(), RuntimeConfig::default()).await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    read_until(&mut rx, |e| matches!(e, RunEvent::RunSuspended { .. })).await;

    h.runtime
        .resume_run(id, ReviewDecision::reject("wrong tone"))
        .await
        .unwrap();
    let events = drain(&mut rx).await;

    match events.last() {
        Some(RunEvent::RunFailed { cause, .. }) => {
            assert_eq!(cause.node_id.as_deref(), Some("review"));
            assert!(cause.message.contains("wrong tone"));
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }
    let snap = snapshot(&h.store, id).await;
    assert_eq!(latest_status(&snap, "send"), Some(NodeStatus::Skipped));
    assert_eq!(latest_status(&snap, "log"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_resume_requires_suspended_run() {
    let h = harness(graph(vec![task("only", json!({}))], &[]), RuntimeConfig::default()).await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    drain(&mut rx).await;

    let err = h.runtime.resume_run(id, ReviewDecision::approve()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let err = h
        .runtime
        .resume_run(uuid::Uuid::new_v4(), ReviewDecision::approve())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_resume_from_a_fresh_runtime() {
    let store = Arc::new(InMemoryContextStore::new());
    let first = harness_with_store(review_graph(), RuntimeConfig::default(), store.clone()).await;
    let (sink, mut rx) = first.runtime.stream_channel();
    let id = first.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    read_until(&mut rx, |e| matches!(e, RunEvent::RunSuspended { .. })).await;
    drop(first);

    let second = harness_with_store(review_graph(), RuntimeConfig::default(), store.clone()).await;
    let (sink, mut rx) = second.runtime.stream_channel();
    second
        .runtime
        .resume_run_with_sink(id, ReviewDecision::approve(), Some(sink))
        .await
        .unwrap();
    let events = drain(&mut rx).await;

    assert_eq!(started_ids(&events), vec!["send", "log"]);
    assert_eq!(second.runtime.wait(id).await.unwrap(), RunStatus::Completed);
    // draft ran exactly once across both processes
    let snap = snapshot(&store, id).await;
    let drafts = snap.node_history.iter().filter(|r| r.node_id == "draft").count();
    assert_eq!(drafts, 1);
}

#[tokio::test]
async fn test_cancel_suspended_run() {
    let h = harness(review_graph(), RuntimeConfig::default()).await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    read_until(&mut rx, |e| matches!(e, RunEvent::RunSuspended { .. })).await;

    h.runtime.cancel_run(id).await.unwrap();
    let events = drain(&mut rx).await;
    assert!(matches!(events.last(), Some(RunEvent::RunCancelled { .. })));

    let snap = snapshot(&h.store, id).await;
    assert_eq!(snap.status, RunStatus::Cancelled);
    assert_eq!(latest_status(&snap, "review"), Some(NodeStatus::Cancelled));
    assert_eq!(latest_status(&snap, "send"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_cyclic_graph_never_starts() {
    let h = harness(
        graph(
            vec![task("a", json!({})), task("b", json!({})), task("c", json!({}))],
            &[("a", "b"), ("b", "c"), ("c", "b")],
        ),
        RuntimeConfig::default(),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let err = h.runtime.start_run("agent", "hi", None, sink).await.unwrap_err();
    assert!(matches!(err, EngineError::GraphFormat(_)));
    assert!(rx.try_recv().is_err(), "no events for a run that never started");
    assert_eq!(h.store.len().await, 0);
}

#[tokio::test]
async fn test_unknown_agent_is_not_found() {
    let h = harness(graph(vec![task("a", json!({}))], &[]), RuntimeConfig::default()).await;
    let (sink, _rx) = h.runtime.stream_channel();
    let err = h.runtime.start_run("nobody", "hi", None, sink).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_unregistered_node_type_fails_run() {
    let h = harness(
        json!({
            "id": "g",
            "nodes": [ { "id": "a", "type": "task" }, { "id": "b", "type": "teleport" } ],
            "edges": [ { "from": "a", "to": "b" } ]
        }),
        RuntimeConfig::default(),
    )
    .await;
    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink).await.unwrap();
    let events = drain(&mut rx).await;

    match events.last() {
        Some(RunEvent::RunFailed { cause, .. }) => {
            assert_eq!(cause.node_id.as_deref(), Some("b"));
            assert!(cause.message.contains("Unknown node type: teleport"));
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }
    assert_eq!(h.runtime.wait(id).await.unwrap(), RunStatus::Failed);
}

#[tokio::test]
async fn test_conversation_state_seeds_next_run() {
    let h = harness(
        graph(
            vec![task("answer", json!({ "output": "hi there", "final_output": true }))],
            &[],
        ),
        RuntimeConfig::default(),
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    h.runtime
        .start_run("agent", "first", Some("conv-1".into()), sink)
        .await
        .unwrap();
    drain(&mut rx).await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let second = h
        .runtime
        .start_run("agent", "second", Some("conv-1".into()), sink)
        .await
        .unwrap();
    drain(&mut rx).await;

    let snap = snapshot(&h.store, second).await;
    assert_eq!(snap.conversation_id, "conv-1");
    assert_eq!(snap.variables["user_message"], json!("second"));
    assert_eq!(
        snap.variables["history"],
        json!([{ "user": "first", "assistant": "hi there" }])
    );
}

/// Store whose writes take a while, widening the window between a node
/// asking for review and the run being marked suspended.
struct SlowStore {
    inner: Arc<InMemoryContextStore>,
    delay: Duration,
}

#[async_trait]
impl ContextStore for SlowStore {
    async fn load(&self, execution_id: ExecutionId) -> Result<Option<ContextSnapshot>, StoreError> {
        self.inner.load(execution_id).await
    }

    async fn save(&self, execution_id: ExecutionId, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(execution_id, snapshot).await
    }
}

#[tokio::test]
async fn test_cancel_while_suspending_is_not_lost() {
    init_tracing();
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(ScriptedFactory {
        probe: Arc::new(Probe::default()),
    }));
    let source = Arc::new(InMemoryGraphSource::new());
    source
        .insert(
            "agent",
            graph(vec![task("review", json!({ "review": "Refund?" }))], &[]).to_string(),
        )
        .await;
    let inner = Arc::new(InMemoryContextStore::new());
    let store = Arc::new(SlowStore {
        inner: inner.clone(),
        delay: Duration::from_millis(200),
    });
    let runtime = AgentRuntime::new(Arc::new(registry), source, store, RuntimeConfig::default());

    let (sink, mut rx) = runtime.stream_channel();
    let id = runtime.start_run("agent", "hi", None, sink).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    runtime.cancel_run(id).await.unwrap();

    let events = drain(&mut rx).await;
    assert!(
        matches!(events.last(), Some(RunEvent::RunCancelled { .. })),
        "got {:?}",
        events
    );
    assert!(!events.iter().any(|e| matches!(e, RunEvent::RunSuspended { .. })));
    assert_eq!(runtime.wait(id).await.unwrap(), RunStatus::Cancelled);

    let snap = snapshot(&inner, id).await;
    assert_eq!(snap.status, RunStatus::Cancelled);
    assert_eq!(latest_status(&snap, "review"), Some(NodeStatus::Cancelled));
}

#[tokio::test]
async fn test_terminal_event_survives_slow_consumer() {
    let config = RuntimeConfig {
        event_buffer_size: 2,
        emit_timeout_ms: 20,
        ..RuntimeConfig::default()
    };
    let h = harness(
        graph(vec![task("first", json!({})), task("second", json!({}))], &[("first", "second")]),
        config,
    )
    .await;

    let (sink, mut rx) = h.runtime.stream_channel();
    let id = h.runtime.start_run("agent", "hi", None, sink.clone()).await.unwrap();

    // Nobody reads until the run is over
    assert_eq!(h.runtime.wait(id).await.unwrap(), RunStatus::Completed);
    let events = drain(&mut rx).await;

    assert!(sink.dropped_events() > 0, "progress events were shed");
    assert!(
        matches!(events.last(), Some(RunEvent::RunCompleted { .. })),
        "got {:?}",
        events
    );
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}
