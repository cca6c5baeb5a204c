use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Run lifecycle: `Running` may move to `SuspendedForReview` and back; the
/// other three states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    SuspendedForReview,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// A human decision awaited by a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub review_id: Uuid,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub prompt: String,
    pub requested_at: DateTime<Utc>,
}

/// Decision supplied to resume a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve {
        #[serde(default)]
        comment: Option<String>,
    },
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ReviewDecision {
    pub fn approve() -> Self {
        ReviewDecision::Approve { comment: None }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        ReviewDecision::Reject {
            reason: Some(reason.into()),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ReviewDecision::Approve { .. })
    }
}

/// Live handle state of one run, looked up by execution id.
#[derive(Debug, Clone)]
pub struct RunState {
    pub execution_id: ExecutionId,
    pub agent_id: String,
    pub status: RunStatus,
    pub cancellation: CancellationToken,
    pub pending_review: Option<PendingReview>,
    pub error: Option<String>,
}

impl RunState {
    pub fn new(execution_id: ExecutionId, agent_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            agent_id: agent_id.into(),
            status: RunStatus::Running,
            cancellation: CancellationToken::new(),
            pending_review: None,
            error: None,
        }
    }
}
