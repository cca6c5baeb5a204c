use super::RunEvent;
use crate::run::ExecutionId;
use crate::NodeId;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered output channel of one run.
///
/// Backed by a bounded channel: a slow consumer applies backpressure, but a
/// producer never waits longer than the emit timeout; past that the event is
/// dropped and counted. Lifecycle events sent through
/// [`emit_terminal`](Self::emit_terminal) are never dropped while the
/// receiver is alive. Clones share the same channel.
#[derive(Clone)]
pub struct StreamSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    sender: Mutex<Option<mpsc::Sender<RunEvent>>>,
    emit_timeout: Duration,
    dropped: AtomicU64,
}

impl StreamSink {
    /// Create a sink and the receiver the caller reads events from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        Self::with_emit_timeout(capacity, DEFAULT_EMIT_TIMEOUT)
    }

    pub fn with_emit_timeout(
        capacity: usize,
        emit_timeout: Duration,
    ) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            inner: Arc::new(SinkInner {
                sender: Mutex::new(Some(tx)),
                emit_timeout,
                dropped: AtomicU64::new(0),
            }),
        };
        (sink, rx)
    }

    /// A sink nobody listens to. Used when a run is resumed without a caller
    /// attached to its stream.
    pub fn detached() -> Self {
        let (sink, _rx) = Self::channel(1);
        sink.close();
        sink
    }

    /// Deliver an event. Returns false if it was dropped.
    pub async fn emit(&self, event: RunEvent) -> bool {
        let sender = match self.sender() {
            Some(sender) => sender,
            None => return false,
        };

        match sender.send_timeout(event, self.inner.emit_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(event)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    execution_id = %event.execution_id(),
                    timeout_ms = self.inner.emit_timeout.as_millis() as u64,
                    "Stream consumer too slow, dropping event"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!("Stream receiver dropped, discarding event");
                false
            }
        }
    }

    /// Deliver an event that must reach the caller, waiting for capacity for
    /// as long as the consumer takes. Returns false only if the stream is
    /// closed or the receiver is gone.
    pub async fn emit_terminal(&self, event: RunEvent) -> bool {
        let sender = match self.sender() {
            Some(sender) => sender,
            None => return false,
        };

        match sender.send(event).await {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("Stream receiver dropped, discarding lifecycle event");
                false
            }
        }
    }

    /// Close the stream. Idempotent; returns true for the call that closed it.
    pub fn close(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Node-scoped emitter handed to an executor.
    pub fn emitter(&self, execution_id: ExecutionId, node_id: impl Into<NodeId>) -> NodeEmitter {
        NodeEmitter {
            execution_id,
            node_id: node_id.into(),
            attempt: 1,
            sink: self.clone(),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<RunEvent>> {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Emitter for one node. A node sends sequentially, so its own events
/// arrive in the order produced.
#[derive(Clone)]
pub struct NodeEmitter {
    execution_id: ExecutionId,
    node_id: NodeId,
    attempt: u32,
    sink: StreamSink,
}

impl NodeEmitter {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// The same emitter, tagging tokens with `attempt`.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Stream an incremental chunk of model output.
    pub async fn token(&self, delta: impl Into<String>) {
        self.sink
            .emit(RunEvent::Token {
                execution_id: self.execution_id,
                node_id: self.node_id.clone(),
                delta: delta.into(),
                attempt: self.attempt,
                timestamp: Utc::now(),
            })
            .await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.sink
            .emit(RunEvent::NodeInfo {
                execution_id: self.execution_id,
                node_id: self.node_id.clone(),
                message: message.into(),
                timestamp: Utc::now(),
            })
            .await;
    }
}
