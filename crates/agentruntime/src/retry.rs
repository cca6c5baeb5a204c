use agentcore::{
    NodeContext, NodeError, NodeExecutionRecord, NodeExecutor, NodeOutcome, NodeStatus, RetryPolicy,
    RunEvent, StreamSink,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One node dispatch: every attempt of it runs inside the same task.
pub(crate) struct NodeJob {
    pub index: usize,
    pub node_type: String,
    pub executor: Arc<dyn NodeExecutor>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub ctx: NodeContext,
    pub sink: StreamSink,
}

/// What the last attempt of a job produced.
pub(crate) struct NodeReport {
    pub index: usize,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: Result<NodeOutcome, NodeError>,
}

/// Run a node, retrying transient failures with exponential backoff.
///
/// Each failed attempt that will be retried is recorded as FAILED before the
/// backoff; the final attempt is left for the engine to record.
pub(crate) async fn run_with_retry(job: NodeJob) -> NodeReport {
    let NodeJob {
        index,
        node_type,
        executor,
        retry,
        timeout,
        mut ctx,
        sink,
    } = job;
    let execution_id = ctx.context.execution_id();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        ctx.attempt = attempt;
        ctx.events = ctx.events.for_attempt(attempt);
        let started_at = Utc::now();
        let start = Instant::now();

        sink.emit(RunEvent::NodeStarted {
            execution_id,
            node_id: ctx.node_id.clone(),
            node_type: node_type.clone(),
            attempt,
            timestamp: started_at,
        })
        .await;

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, executor.execute(ctx.clone())).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout {
                    millis: limit.as_millis() as u64,
                }),
            },
            None => executor.execute(ctx.clone()).await,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let error = match result {
            Err(e) if e.is_transient() && attempt < max_attempts && !ctx.is_cancelled() => e,
            result => {
                return NodeReport {
                    index,
                    attempt,
                    started_at,
                    duration_ms,
                    result,
                }
            }
        };

        let backoff = Duration::from_millis(retry.backoff_ms(attempt));
        warn!(
            execution_id = %execution_id,
            node_id = %ctx.node_id,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Node attempt failed, retrying"
        );
        ctx.context
            .append_record(
                NodeExecutionRecord::new(ctx.node_id.clone(), NodeStatus::Failed)
                    .with_attempt(attempt)
                    .started(started_at)
                    .with_error(error.to_string()),
            )
            .await;
        sink.emit(RunEvent::NodeFailed {
            execution_id,
            node_id: ctx.node_id.clone(),
            error: error.to_string(),
            attempt,
            will_retry: true,
            timestamp: Utc::now(),
        })
        .await;

        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                info!(execution_id = %execution_id, node_id = %ctx.node_id, "Retry abandoned on cancellation");
                return NodeReport {
                    index,
                    attempt,
                    started_at,
                    duration_ms,
                    result: Ok(NodeOutcome::Cancelled),
                };
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        attempt += 1;
    }
}
