use crate::config::RuntimeConfig;
use crate::loader::Graph;
use crate::registry::NodeRegistry;
use crate::retry::{run_with_retry, NodeJob, NodeReport};
use crate::schedule::{firing_for, Firing, Schedule};
use agentcore::{
    node_key, ExecutionContext, ExecutionId, FailurePolicy, NodeContext, NodeError, NodeExecutionRecord, NodeId,
    NodeOutcome, NodeOutput, NodeStatus, RunEvent, RunFailure, RunStatus, StreamSink, FINAL_OUTPUT,
};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a call to [`ExecutionEngine::drive`] ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
    /// Review nodes waiting on a decision, with their prompts
    pub awaiting: Vec<(NodeId, String)>,
    /// Value of `final_output` when the run stopped
    pub output: Option<Value>,
    pub duration_ms: u64,
}

/// Executes workflow graphs as DAGs with bounded parallelism.
pub struct ExecutionEngine {
    registry: Arc<NodeRegistry>,
    config: RuntimeConfig,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `graph` against `context` until it completes, fails, is cancelled
    /// or suspends for review.
    ///
    /// The scheduling state is rebuilt from the context's node log first, so
    /// the same call serves fresh runs and resumed ones. The sink is never
    /// closed here.
    pub async fn drive(
        &self,
        graph: Arc<Graph>,
        context: Arc<ExecutionContext>,
        sink: StreamSink,
        cancellation: CancellationToken,
    ) -> RunOutcome {
        let start = Instant::now();
        let history = context.history().await;
        let replay = Schedule::replay(&graph, &history);

        let awaiting = replay
            .awaiting
            .iter()
            .map(|&idx| {
                let id = &graph.node(idx).id;
                let prompt = history
                    .iter()
                    .rev()
                    .find(|r| &r.node_id == id)
                    .and_then(|r| r.output.get("prompt"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (idx, prompt)
            })
            .collect();

        let settings = graph.settings();
        let mut driver = RunDriver {
            engine: self,
            graph: graph.clone(),
            context,
            sink,
            abort: cancellation.child_token(),
            schedule: replay.schedule,
            failure: replay.failure,
            awaiting,
            in_flight: HashMap::new(),
            cancelled: false,
            deadline: None,
            policy: settings.on_error.unwrap_or(self.config.failure_policy),
            max_parallel: settings
                .max_parallel_nodes
                .unwrap_or(self.config.max_parallel_nodes)
                .max(1),
            node_timeout: settings
                .node_timeout_ms
                .or(self.config.node_timeout_ms)
                .map(Duration::from_millis),
        };

        driver.record_skips(replay.unrecorded_skips).await;
        if driver.failure.is_some() && driver.policy == FailurePolicy::FailFast {
            driver.abort.cancel();
        }

        driver.run(&cancellation).await;
        driver.finish(start).await
    }
}

type Running = FuturesUnordered<Pin<Box<dyn Future<Output = (usize, Result<NodeReport, JoinError>)> + Send>>>;

enum Wake {
    Cancelled,
    Finished(Option<(usize, Result<NodeReport, JoinError>)>),
    GraceExpired,
}

/// Mutable state of one `drive` call.
struct RunDriver<'a> {
    engine: &'a ExecutionEngine,
    graph: Arc<Graph>,
    context: Arc<ExecutionContext>,
    sink: StreamSink,
    /// Child of the caller's token; tripped on cancellation and on fail-fast
    abort: CancellationToken,
    schedule: Schedule,
    failure: Option<RunFailure>,
    awaiting: Vec<(usize, String)>,
    in_flight: HashMap<usize, DateTime<Utc>>,
    cancelled: bool,
    /// Set once in-flight nodes have been asked to stop
    deadline: Option<tokio::time::Instant>,
    policy: FailurePolicy,
    max_parallel: usize,
    node_timeout: Option<Duration>,
}

impl RunDriver<'_> {
    fn execution_id(&self) -> ExecutionId {
        self.context.execution_id()
    }

    /// No new dispatches once a review is pending or a fail-fast failure
    /// happened.
    fn halted(&self) -> bool {
        self.cancelled
            || self.abort.is_cancelled()
            || !self.awaiting.is_empty()
            || (self.failure.is_some() && self.policy == FailurePolicy::FailFast)
    }

    async fn run(&mut self, cancellation: &CancellationToken) {
        let mut running: Running = FuturesUnordered::new();

        loop {
            if !self.cancelled && cancellation.is_cancelled() {
                self.begin_cancel();
            }

            while !self.halted() && running.len() < self.max_parallel {
                let Some(idx) = self.schedule.pop_ready() else {
                    break;
                };
                self.dispatch(idx, &mut running).await;
            }

            if running.is_empty() {
                break;
            }

            let wake = match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, running.next()).await {
                    Ok(next) => Wake::Finished(next),
                    Err(_) => Wake::GraceExpired,
                },
                None => tokio::select! {
                    biased;
                    _ = cancellation.cancelled(), if !self.cancelled => Wake::Cancelled,
                    next = running.next() => Wake::Finished(next),
                },
            };

            match wake {
                Wake::Cancelled => self.begin_cancel(),
                Wake::Finished(Some((idx, joined))) => self.handle(idx, joined).await,
                Wake::Finished(None) => break,
                Wake::GraceExpired => {
                    self.abandon_in_flight().await;
                    break;
                }
            }
        }
    }

    fn begin_cancel(&mut self) {
        info!(
            execution_id = %self.execution_id(),
            in_flight = self.in_flight.len(),
            "Run cancelled, stopping dispatch"
        );
        self.cancelled = true;
        self.stop_in_flight();
    }

    fn stop_in_flight(&mut self) {
        self.abort.cancel();
        if self.deadline.is_none() {
            self.deadline = Some(tokio::time::Instant::now() + self.engine.config.cancel_grace());
        }
    }

    async fn dispatch(&mut self, idx: usize, running: &mut Running) {
        let node = self.graph.node(idx);
        let executor = match self.engine.registry.create_executor(node) {
            Ok(executor) => executor,
            Err(e) => {
                self.fail(idx, 1, Utc::now(), e).await;
                return;
            }
        };

        debug!(
            execution_id = %self.execution_id(),
            node_id = %node.id,
            node_type = %node.kind,
            "Dispatching node"
        );

        let ctx = NodeContext {
            node_id: node.id.clone(),
            attempt: 1,
            predecessors: self.graph.predecessor_ids(idx),
            successors: self.graph.successor_ids(idx),
            context: self.context.clone(),
            events: self.sink.emitter(self.execution_id(), node.id.clone()),
            cancellation: self.abort.clone(),
        };
        let job = NodeJob {
            index: idx,
            node_type: node.kind.to_string(),
            executor,
            retry: node
                .retry
                .clone()
                .unwrap_or_else(|| self.engine.config.default_retry.clone()),
            timeout: self.node_timeout,
            ctx,
            sink: self.sink.clone(),
        };

        self.in_flight.insert(idx, Utc::now());
        let handle = tokio::spawn(run_with_retry(job));
        running.push(Box::pin(async move { (idx, handle.await) }));
    }

    async fn handle(&mut self, idx: usize, joined: Result<NodeReport, JoinError>) {
        let started_at = self.in_flight.remove(&idx).unwrap_or_else(Utc::now);
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                let message = if e.is_panic() {
                    "node task panicked".to_string()
                } else {
                    format!("node task aborted: {}", e)
                };
                self.fail(idx, 1, started_at, NodeError::ExecutionFailed(message))
                    .await;
                return;
            }
        };

        let NodeReport {
            index,
            attempt,
            started_at,
            duration_ms,
            result,
        } = report;

        match result {
            Ok(NodeOutcome::Completed(output)) => {
                self.complete(index, attempt, started_at, duration_ms, output)
                    .await
            }
            Ok(NodeOutcome::AwaitReview { prompt }) => {
                let node_id = self.graph.node(index).id.clone();
                info!(
                    execution_id = %self.execution_id(),
                    node_id = %node_id,
                    "Node awaiting human review"
                );
                self.context
                    .append_record(
                        NodeExecutionRecord::new(node_id, NodeStatus::Pending)
                            .with_attempt(attempt)
                            .started(started_at)
                            .with_output(json!({ "prompt": prompt })),
                    )
                    .await;
                self.awaiting.push((index, prompt));
            }
            Ok(NodeOutcome::Cancelled) => {
                self.cancel_node(index, attempt, started_at, None).await;
            }
            Err(e) => self.fail(index, attempt, started_at, e).await,
        }
    }

    async fn complete(
        &mut self,
        idx: usize,
        attempt: u32,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        output: NodeOutput,
    ) {
        let node = self.graph.node(idx);
        let NodeOutput { value, routes } = output;

        let mut writes = vec![(node_key(&node.id, "output"), value.clone())];
        if let Some(key) = node.config.get("output_key").and_then(Value::as_str) {
            writes.push((key.to_string(), value.clone()));
        }
        self.context.set_many(writes).await;

        self.context
            .append_record(
                NodeExecutionRecord::new(node.id.clone(), NodeStatus::Completed)
                    .with_attempt(attempt)
                    .started(started_at)
                    .with_output(value.clone())
                    .with_routes(routes.clone()),
            )
            .await;

        info!(
            execution_id = %self.execution_id(),
            node_id = %node.id,
            duration_ms,
            "Node completed"
        );
        self.sink
            .emit(RunEvent::NodeCompleted {
                execution_id: self.execution_id(),
                node_id: node.id.clone(),
                output: value,
                duration_ms,
                timestamp: Utc::now(),
            })
            .await;

        let firing = firing_for(&self.graph, idx, routes.as_deref());
        let skipped = self.schedule.settle(&self.graph, idx, firing);
        self.record_skips(skipped).await;
    }

    async fn fail(&mut self, idx: usize, attempt: u32, started_at: DateTime<Utc>, e: NodeError) {
        let node_id = self.graph.node(idx).id.clone();
        let message = e.to_string();
        error!(
            execution_id = %self.execution_id(),
            node_id = %node_id,
            attempt,
            error = %message,
            "Node failed"
        );

        self.context
            .append_record(
                NodeExecutionRecord::new(node_id.clone(), NodeStatus::Failed)
                    .with_attempt(attempt)
                    .started(started_at)
                    .with_error(message.clone()),
            )
            .await;
        self.sink
            .emit(RunEvent::NodeFailed {
                execution_id: self.execution_id(),
                node_id: node_id.clone(),
                error: message.clone(),
                attempt,
                will_retry: false,
                timestamp: Utc::now(),
            })
            .await;

        if self.failure.is_none() {
            self.failure = Some(RunFailure {
                node_id: Some(node_id),
                message,
            });
        }

        let skipped = self.schedule.settle(&self.graph, idx, Firing::None);
        self.record_skips(skipped).await;

        if self.policy == FailurePolicy::FailFast && !self.cancelled {
            self.stop_in_flight();
        }
    }

    async fn cancel_node(
        &mut self,
        idx: usize,
        attempt: u32,
        started_at: DateTime<Utc>,
        reason: Option<&str>,
    ) {
        let node_id = self.graph.node(idx).id.clone();
        let mut record = NodeExecutionRecord::new(node_id.clone(), NodeStatus::Cancelled)
            .with_attempt(attempt)
            .started(started_at);
        if let Some(reason) = reason {
            record = record.with_error(reason);
        }
        self.context.append_record(record).await;
        self.sink
            .emit(RunEvent::NodeCancelled {
                execution_id: self.execution_id(),
                node_id,
                timestamp: Utc::now(),
            })
            .await;

        let skipped = self.schedule.settle(&self.graph, idx, Firing::None);
        self.record_skips(skipped).await;
    }

    /// Nodes still running after the grace period are left to finish on
    /// their own; their results are ignored.
    async fn abandon_in_flight(&mut self) {
        let mut abandoned: Vec<(usize, DateTime<Utc>)> = self.in_flight.drain().collect();
        abandoned.sort_unstable_by_key(|(idx, _)| *idx);
        for (idx, started_at) in abandoned {
            warn!(
                execution_id = %self.execution_id(),
                node_id = %self.graph.node(idx).id,
                "Node did not stop within the grace period, abandoning"
            );
            self.cancel_node(idx, 1, started_at, Some("abandoned after grace period"))
                .await;
        }
    }

    async fn record_skips(&mut self, skipped: Vec<usize>) {
        for idx in skipped {
            let node_id = self.graph.node(idx).id.clone();
            debug!(execution_id = %self.execution_id(), node_id = %node_id, "Node skipped");
            self.context
                .append_record(NodeExecutionRecord::new(node_id.clone(), NodeStatus::Skipped))
                .await;
            self.sink
                .emit(RunEvent::NodeSkipped {
                    execution_id: self.execution_id(),
                    node_id,
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    async fn finish(mut self, start: Instant) -> RunOutcome {
        let status = if self.cancelled {
            RunStatus::Cancelled
        } else if self.failure.is_some() {
            RunStatus::Failed
        } else if !self.awaiting.is_empty() {
            RunStatus::SuspendedForReview
        } else {
            RunStatus::Completed
        };

        if status != RunStatus::SuspendedForReview {
            let awaiting = std::mem::take(&mut self.awaiting);
            for (idx, _) in awaiting {
                if self.cancelled {
                    self.cancel_node(idx, 1, Utc::now(), None).await;
                } else {
                    let skipped = self.schedule.settle(&self.graph, idx, Firing::None);
                    self.record_skips(std::iter::once(idx).chain(skipped).collect())
                        .await;
                }
            }
            let unsettled = self.schedule.unsettled();
            for &idx in &unsettled {
                self.schedule.settle(&self.graph, idx, Firing::None);
            }
            self.record_skips(unsettled).await;
        }

        RunOutcome {
            status,
            failure: self.failure,
            awaiting: self
                .awaiting
                .into_iter()
                .map(|(idx, prompt)| (self.graph.node(idx).id.clone(), prompt))
                .collect(),
            output: self.context.get(FINAL_OUTPUT).await,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}
