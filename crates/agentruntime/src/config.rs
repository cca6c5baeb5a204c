use agentcore::{FailurePolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the runtime. Graph `settings` override the
/// scheduling fields per graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on nodes executing at once within one run
    pub max_parallel_nodes: usize,
    /// Capacity of stream channels created by the runtime
    pub event_buffer_size: usize,
    /// Longest a producer waits on a full stream before dropping an event
    pub emit_timeout_ms: u64,
    /// Retry policy for nodes that don't declare one
    pub default_retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    /// How long in-flight nodes get to honour cancellation before being abandoned
    pub cancel_grace_ms: u64,
    /// Per-attempt limit applied to every node
    pub node_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            emit_timeout_ms: 5000,
            default_retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::FailFast,
            cancel_grace_ms: 2000,
            node_timeout_ms: None,
        }
    }
}

impl RuntimeConfig {
    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn with_max_parallel_nodes(mut self, max: usize) -> Self {
        self.max_parallel_nodes = max;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_cancel_grace_ms(mut self, millis: u64) -> Self {
        self.cancel_grace_ms = millis;
        self
    }
}
