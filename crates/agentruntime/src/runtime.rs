use crate::config::RuntimeConfig;
use crate::engine::{ExecutionEngine, RunOutcome};
use crate::loader::{Graph, GraphCache};
use crate::registry::NodeRegistry;
use crate::review::{pending_from_snapshot, HumanReviewGate};
use agentcore::store::{ContextStore, GraphDefinitionSource};
use agentcore::{
    EngineError, ExecutionContext, ExecutionId, ReviewDecision, RunEvent, RunFailure, RunState,
    RunStatus, StreamSink, FINAL_OUTPUT, USER_MESSAGE,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Variable accumulating prior turns of a conversation.
const CONVERSATION_HISTORY: &str = "history";

struct RunHandle {
    state: RunState,
    sink: Option<StreamSink>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunHandle {
    fn new(state: RunState, sink: Option<StreamSink>) -> Self {
        let (status_tx, _) = watch::channel(state.status);
        Self {
            state,
            sink,
            status_tx,
        }
    }

    fn set_status(&mut self, status: RunStatus) {
        self.state.status = status;
        self.status_tx.send_replace(status);
    }
}

struct RuntimeInner {
    engine: ExecutionEngine,
    graphs: GraphCache,
    source: Arc<dyn GraphDefinitionSource>,
    store: Arc<dyn ContextStore>,
    gate: HumanReviewGate,
    runs: RwLock<HashMap<ExecutionId, RunHandle>>,
}

/// Main runtime for executing agent workflows.
///
/// Cheap to clone; every clone drives the same set of runs.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub fn new(
        registry: Arc<NodeRegistry>,
        source: Arc<dyn GraphDefinitionSource>,
        store: Arc<dyn ContextStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                engine: ExecutionEngine::new(registry, config),
                graphs: GraphCache::new(),
                source,
                gate: HumanReviewGate::new(store.clone()),
                store,
                runs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        self.inner.engine.registry()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.inner.engine.config()
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.inner.store
    }

    /// A stream sized and timed by the runtime configuration.
    pub fn stream_channel(&self) -> (StreamSink, mpsc::Receiver<RunEvent>) {
        let config = self.config();
        StreamSink::with_emit_timeout(config.event_buffer_size, config.emit_timeout())
    }

    /// Parse (or fetch from cache) the graph of an agent.
    pub async fn graph(&self, agent_id: &str) -> Result<Arc<Graph>, EngineError> {
        self.inner
            .graphs
            .get_or_load(agent_id, self.inner.source.as_ref())
            .await
    }

    /// Start a run of `agent_id` for one user message. Returns as soon as the
    /// run is scheduled; progress arrives on `sink`.
    pub async fn start_run(
        &self,
        agent_id: &str,
        user_message: &str,
        conversation_id: Option<String>,
        sink: StreamSink,
    ) -> Result<ExecutionId, EngineError> {
        let graph = self.graph(agent_id).await?;
        let execution_id = Uuid::new_v4();
        let conversation_id = conversation_id.unwrap_or_else(|| execution_id.to_string());

        let context = Arc::new(ExecutionContext::new(
            execution_id,
            agent_id,
            conversation_id.clone(),
        ));
        let mut seed = self.conversation_seed(&conversation_id).await;
        seed.insert(USER_MESSAGE.to_string(), json!(user_message));
        context.set_many(seed).await;

        let state = RunState::new(execution_id, agent_id);
        let cancellation = state.cancellation.clone();
        self.inner
            .runs
            .write()
            .await
            .insert(execution_id, RunHandle::new(state, Some(sink.clone())));

        info!(
            execution_id = %execution_id,
            agent_id,
            graph_id = %graph.id(),
            conversation_id = %conversation_id,
            "Starting run"
        );
        sink.emit(RunEvent::RunStarted {
            execution_id,
            agent_id: agent_id.to_string(),
            conversation_id,
            timestamp: Utc::now(),
        })
        .await;

        self.spawn_drive(graph, context, sink, cancellation);
        Ok(execution_id)
    }

    /// Apply a review decision to a suspended run and continue it. Events go
    /// to the sink the run was started with, if this process still holds it.
    pub async fn resume_run(
        &self,
        execution_id: ExecutionId,
        decision: ReviewDecision,
    ) -> Result<(), EngineError> {
        self.resume_run_with_sink(execution_id, decision, None).await
    }

    /// Like [`resume_run`](Self::resume_run), streaming to a new sink.
    pub async fn resume_run_with_sink(
        &self,
        execution_id: ExecutionId,
        decision: ReviewDecision,
        sink: Option<StreamSink>,
    ) -> Result<(), EngineError> {
        if let Some(handle) = self.inner.runs.read().await.get(&execution_id) {
            if handle.state.status != RunStatus::SuspendedForReview {
                return Err(EngineError::InvalidState(format!(
                    "run {} is {:?}, not suspended for review",
                    execution_id, handle.state.status
                )));
            }
        }

        let resumed = self.inner.gate.resume(execution_id, decision).await?;
        let graph = self.graph(&resumed.snapshot.agent_id).await?;
        let agent_id = resumed.snapshot.agent_id.clone();
        let context = Arc::new(ExecutionContext::from_snapshot(resumed.snapshot));

        let (sink, cancellation) = self.reattach(execution_id, &agent_id, sink).await;

        info!(
            execution_id = %execution_id,
            node_id = %resumed.node_id,
            approved = resumed.decision.is_approved(),
            "Resuming run"
        );
        sink.emit(RunEvent::RunResumed {
            execution_id,
            node_id: resumed.node_id,
            approved: resumed.decision.is_approved(),
            timestamp: Utc::now(),
        })
        .await;

        self.spawn_drive(graph, context, sink, cancellation);
        Ok(())
    }

    /// Request cancellation. A running run stops dispatching and its
    /// in-flight nodes are asked to stop; a suspended run is closed out
    /// directly.
    pub async fn cancel_run(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        {
            // Held while cancelling so a run cannot settle as suspended in between
            let runs = self.inner.runs.read().await;
            match runs.get(&execution_id).map(|h| (h.state.status, &h.state.cancellation)) {
                Some((RunStatus::Running, token)) => {
                    info!(execution_id = %execution_id, "Cancelling run");
                    token.cancel();
                    return Ok(());
                }
                Some((status, _)) if status.is_terminal() => {
                    return Err(EngineError::InvalidState(format!(
                        "run {} already finished as {:?}",
                        execution_id, status
                    )));
                }
                _ => {}
            }
        }

        let snapshot = self.inner.gate.release(execution_id).await?;
        let graph = self.graph(&snapshot.agent_id).await?;
        let agent_id = snapshot.agent_id.clone();
        let context = Arc::new(ExecutionContext::from_snapshot(snapshot));

        let (sink, cancellation) = self.reattach(execution_id, &agent_id, None).await;
        cancellation.cancel();
        info!(execution_id = %execution_id, "Cancelling suspended run");

        self.spawn_drive(graph, context, sink, cancellation);
        Ok(())
    }

    /// Current state of a run, from memory or else from the store.
    pub async fn status(&self, execution_id: ExecutionId) -> Result<RunState, EngineError> {
        if let Some(handle) = self.inner.runs.read().await.get(&execution_id) {
            return Ok(handle.state.clone());
        }

        let snapshot = self
            .inner
            .store
            .load(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
        let mut state = RunState::new(execution_id, snapshot.agent_id.clone());
        state.status = snapshot.status;
        state.error = snapshot.error.clone();
        if snapshot.status == RunStatus::SuspendedForReview {
            state.pending_review = pending_from_snapshot(&snapshot);
        }
        Ok(state)
    }

    /// Wait until the run leaves RUNNING: it finished or suspended.
    pub async fn wait(&self, execution_id: ExecutionId) -> Result<RunStatus, EngineError> {
        let rx = self
            .inner
            .runs
            .read()
            .await
            .get(&execution_id)
            .map(|h| h.status_tx.subscribe());

        if let Some(mut rx) = rx {
            if let Ok(status) = rx.wait_for(|s| *s != RunStatus::Running).await {
                return Ok(*status);
            }
        }

        self.inner
            .store
            .load(execution_id)
            .await?
            .map(|s| s.status)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))
    }

    /// Mark a run as running again in this process and hand back its stream
    /// and token.
    async fn reattach(
        &self,
        execution_id: ExecutionId,
        agent_id: &str,
        sink: Option<StreamSink>,
    ) -> (StreamSink, CancellationToken) {
        let mut runs = self.inner.runs.write().await;
        let handle = runs
            .entry(execution_id)
            .or_insert_with(|| RunHandle::new(RunState::new(execution_id, agent_id), None));
        if sink.is_some() {
            handle.sink = sink;
        }
        handle.state.pending_review = None;
        handle.set_status(RunStatus::Running);
        (
            handle.sink.clone().unwrap_or_else(StreamSink::detached),
            handle.state.cancellation.clone(),
        )
    }

    /// Variables carried over from the conversation's previous run.
    async fn conversation_seed(&self, conversation_id: &str) -> HashMap<String, Value> {
        let previous = match self.inner.store.latest_for_conversation(conversation_id).await {
            Ok(Some(previous)) => previous,
            Ok(None) => return HashMap::new(),
            Err(e) => {
                warn!(conversation_id, error = %e, "Could not load conversation state");
                return HashMap::new();
            }
        };

        let mut seed: HashMap<String, Value> = previous
            .variables
            .iter()
            .filter(|(key, _)| {
                !key.contains('.') && key.as_str() != USER_MESSAGE && key.as_str() != FINAL_OUTPUT
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut turns = match seed.remove(CONVERSATION_HISTORY) {
            Some(Value::Array(turns)) => turns,
            _ => Vec::new(),
        };
        turns.push(json!({
            "user": previous.variables.get(USER_MESSAGE).cloned().unwrap_or(Value::Null),
            "assistant": previous.variables.get(FINAL_OUTPUT).cloned().unwrap_or(Value::Null),
        }));
        seed.insert(CONVERSATION_HISTORY.to_string(), Value::Array(turns));
        seed
    }

    fn spawn_drive(
        &self,
        graph: Arc<Graph>,
        context: Arc<ExecutionContext>,
        sink: StreamSink,
        cancellation: CancellationToken,
    ) {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                let outcome = runtime
                    .inner
                    .engine
                    .drive(graph.clone(), context.clone(), sink.clone(), cancellation.clone())
                    .await;
                if !runtime.settle(&context, &sink, &cancellation, outcome).await {
                    break;
                }
            }
        });
    }

    /// Record how a `drive` ended. Returns true when the run must be driven
    /// again: it was cancelled while its suspension was being persisted.
    async fn settle(
        &self,
        context: &ExecutionContext,
        sink: &StreamSink,
        cancellation: &CancellationToken,
        outcome: RunOutcome,
    ) -> bool {
        let execution_id = context.execution_id();

        if outcome.status == RunStatus::SuspendedForReview {
            if let Some((node_id, prompt)) = outcome.awaiting.first() {
                let snapshot = context.snapshot(RunStatus::SuspendedForReview, None).await;
                match self
                    .inner
                    .gate
                    .suspend(execution_id, node_id, prompt, snapshot)
                    .await
                {
                    Ok(review) => {
                        {
                            let mut runs = self.inner.runs.write().await;
                            if cancellation.is_cancelled() {
                                drop(runs);
                                info!(execution_id = %execution_id, "Cancelled while suspending, closing out run");
                                if let Err(e) = self.inner.gate.release(execution_id).await {
                                    warn!(execution_id = %execution_id, error = %e, "Could not release suspended run");
                                }
                                return true;
                            }
                            if let Some(handle) = runs.get_mut(&execution_id) {
                                handle.state.pending_review = Some(review.clone());
                                handle.set_status(RunStatus::SuspendedForReview);
                            }
                        }
                        sink.emit_terminal(RunEvent::RunSuspended {
                            execution_id,
                            review,
                            timestamp: Utc::now(),
                        })
                        .await;
                        return false;
                    }
                    Err(e) => {
                        error!(execution_id = %execution_id, error = %e, "Failed to persist suspended run");
                        let outcome = RunOutcome {
                            status: RunStatus::Failed,
                            failure: Some(RunFailure {
                                node_id: Some(node_id.clone()),
                                message: format!("could not suspend for review: {}", e),
                            }),
                            ..outcome.clone()
                        };
                        self.finish(context, sink, outcome).await;
                        return false;
                    }
                }
            }
        }

        self.finish(context, sink, outcome).await;
        false
    }

    async fn finish(&self, context: &ExecutionContext, sink: &StreamSink, outcome: RunOutcome) {
        let execution_id = context.execution_id();
        let error = outcome.failure.as_ref().map(|f| f.to_string());

        let snapshot = context.snapshot(outcome.status, error.clone()).await;
        if let Err(e) = self.inner.store.save(execution_id, &snapshot).await {
            error!(execution_id = %execution_id, error = %e, "Failed to persist run snapshot");
        }

        let event = match outcome.status {
            RunStatus::Completed => RunEvent::RunCompleted {
                execution_id,
                output: outcome.output,
                duration_ms: outcome.duration_ms,
                timestamp: Utc::now(),
            },
            RunStatus::Failed => RunEvent::RunFailed {
                execution_id,
                cause: outcome.failure.unwrap_or_else(|| RunFailure {
                    node_id: None,
                    message: "run failed".to_string(),
                }),
                timestamp: Utc::now(),
            },
            _ => RunEvent::RunCancelled {
                execution_id,
                timestamp: Utc::now(),
            },
        };

        info!(
            execution_id = %execution_id,
            status = ?outcome.status,
            duration_ms = outcome.duration_ms,
            "Run finished"
        );

        // Publish status first; `wait` must not block on a slow consumer
        if let Some(mut handle) = self.inner.runs.write().await.remove(&execution_id) {
            handle.state.error = error;
            handle.set_status(outcome.status);
        }

        sink.emit_terminal(event).await;
        sink.close();
    }
}
