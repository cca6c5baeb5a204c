use crate::run::{ExecutionId, PendingReview};
use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events streamed to the caller during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        execution_id: ExecutionId,
        agent_id: String,
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },
    RunResumed {
        execution_id: ExecutionId,
        node_id: NodeId,
        approved: bool,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        node_type: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// Model output chunk. A retried node streams again under a higher
    /// `attempt`; text from earlier attempts is superseded.
    Token {
        execution_id: ExecutionId,
        node_id: NodeId,
        delta: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeInfo {
        execution_id: ExecutionId,
        node_id: NodeId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        output: Value,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        execution_id: ExecutionId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    NodeCancelled {
        execution_id: ExecutionId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    RunSuspended {
        execution_id: ExecutionId,
        review: PendingReview,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: ExecutionId,
        output: Option<Value>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        execution_id: ExecutionId,
        cause: RunFailure,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
}

/// Structured cause of a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub node_id: Option<NodeId>,
    pub message: String,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "node {}: {}", node, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl RunEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            RunEvent::RunStarted { execution_id, .. }
            | RunEvent::RunResumed { execution_id, .. }
            | RunEvent::NodeStarted { execution_id, .. }
            | RunEvent::Token { execution_id, .. }
            | RunEvent::NodeInfo { execution_id, .. }
            | RunEvent::NodeCompleted { execution_id, .. }
            | RunEvent::NodeFailed { execution_id, .. }
            | RunEvent::NodeSkipped { execution_id, .. }
            | RunEvent::NodeCancelled { execution_id, .. }
            | RunEvent::RunSuspended { execution_id, .. }
            | RunEvent::RunCompleted { execution_id, .. }
            | RunEvent::RunFailed { execution_id, .. }
            | RunEvent::RunCancelled { execution_id, .. } => *execution_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            RunEvent::RunResumed { node_id, .. }
            | RunEvent::NodeStarted { node_id, .. }
            | RunEvent::Token { node_id, .. }
            | RunEvent::NodeInfo { node_id, .. }
            | RunEvent::NodeCompleted { node_id, .. }
            | RunEvent::NodeFailed { node_id, .. }
            | RunEvent::NodeSkipped { node_id, .. }
            | RunEvent::NodeCancelled { node_id, .. } => Some(node_id),
            RunEvent::RunSuspended { review, .. } => Some(&review.node_id),
            _ => None,
        }
    }

    /// Completed, failed and cancelled end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } | RunEvent::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn events_are_type_tagged() {
        let event = RunEvent::Token {
            execution_id: Uuid::nil(),
            node_id: "llm".into(),
            delta: "Hel".into(),
            attempt: 2,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["delta"], "Hel");
        assert_eq!(json["attempt"], 2);
        assert_eq!(event.node_id(), Some("llm"));
        assert!(!event.is_terminal());
    }

    #[test]
    fn failure_cause_display() {
        let cause = RunFailure {
            node_id: Some("tool".into()),
            message: "Timeout after 50ms".into(),
        };
        assert_eq!(cause.to_string(), "node tool: Timeout after 50ms");
    }
}
