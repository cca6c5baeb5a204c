use agentcore::store::ContextStore;
use agentcore::{
    node_key, ContextSnapshot, EngineError, ExecutionId, NodeExecutionRecord, NodeStatus,
    PendingReview, ReviewDecision, RunStatus,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A decision applied to a suspended run, ready to be driven again.
#[derive(Debug, Clone)]
pub struct ResumeResult {
    pub snapshot: ContextSnapshot,
    pub node_id: String,
    pub decision: ReviewDecision,
}

/// Persists suspended runs and applies reviewer decisions to them.
///
/// A suspended run holds no task: everything needed to continue it lives in
/// the stored snapshot, so a different process can resume it.
pub struct HumanReviewGate {
    store: Arc<dyn ContextStore>,
    // Serializes decisions so exactly one resume of a run wins
    lock: Mutex<()>,
}

impl HumanReviewGate {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Store `snapshot` as suspended on `node_id` and describe the review.
    pub async fn suspend(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        prompt: &str,
        mut snapshot: ContextSnapshot,
    ) -> Result<PendingReview, EngineError> {
        let review_id = Uuid::new_v4();
        let record = snapshot
            .node_history
            .iter_mut()
            .rev()
            .find(|r| r.node_id == node_id && r.status == NodeStatus::Pending)
            .ok_or_else(|| {
                EngineError::InvalidState(format!("node {} is not awaiting review", node_id))
            })?;
        record.output = json!({ "prompt": prompt, "review_id": review_id });

        snapshot.status = RunStatus::SuspendedForReview;
        snapshot.updated_at = Utc::now();
        self.store.save(execution_id, &snapshot).await?;

        tracing::info!(
            execution_id = %execution_id,
            node_id,
            review_id = %review_id,
            "Run suspended for review"
        );

        Ok(PendingReview {
            review_id,
            execution_id,
            node_id: node_id.to_string(),
            prompt: prompt.to_string(),
            requested_at: snapshot.updated_at,
        })
    }

    /// Append the decision record for the pending node and mark the run as
    /// running again. Fails if the run is not suspended.
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        decision: ReviewDecision,
    ) -> Result<ResumeResult, EngineError> {
        let _guard = self.lock.lock().await;

        let mut snapshot = self.suspended(execution_id).await?;
        let pending = snapshot
            .pending_review()
            .cloned()
            .ok_or_else(|| EngineError::InvalidState(format!("run {} has no pending review", execution_id)))?;

        let record = NodeExecutionRecord::new(pending.node_id.clone(), NodeStatus::Completed)
            .with_attempt(pending.attempt)
            .started(pending.started_at);
        let (record, output) = match &decision {
            ReviewDecision::Approve { comment } => {
                let output = json!({ "decision": "approve", "comment": comment });
                (record.with_output(output.clone()), output)
            }
            ReviewDecision::Reject { reason } => {
                let reason = reason.clone().unwrap_or_else(|| "rejected by reviewer".to_string());
                let output = json!({ "decision": "reject", "reason": reason });
                let mut record = record.with_output(output.clone()).with_error(format!("review rejected: {}", reason));
                record.status = NodeStatus::Failed;
                (record, output)
            }
        };

        snapshot.node_history.push(record);
        snapshot
            .variables
            .insert(node_key(&pending.node_id, "output"), output);
        snapshot.status = RunStatus::Running;
        snapshot.updated_at = Utc::now();
        self.store.save(execution_id, &snapshot).await?;

        tracing::info!(
            execution_id = %execution_id,
            node_id = %pending.node_id,
            approved = decision.is_approved(),
            "Review decision applied"
        );

        Ok(ResumeResult {
            snapshot,
            node_id: pending.node_id,
            decision,
        })
    }

    /// Take a suspended run out of the gate without a decision, e.g. to
    /// cancel it.
    pub async fn release(&self, execution_id: ExecutionId) -> Result<ContextSnapshot, EngineError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.suspended(execution_id).await?;
        snapshot.status = RunStatus::Running;
        snapshot.updated_at = Utc::now();
        self.store.save(execution_id, &snapshot).await?;
        Ok(snapshot)
    }

    /// The pending review of a stored run, if it is suspended.
    pub async fn pending(&self, execution_id: ExecutionId) -> Result<Option<PendingReview>, EngineError> {
        Ok(self
            .store
            .load(execution_id)
            .await?
            .filter(|s| s.status == RunStatus::SuspendedForReview)
            .and_then(|s| pending_from_snapshot(&s)))
    }

    async fn suspended(&self, execution_id: ExecutionId) -> Result<ContextSnapshot, EngineError> {
        let snapshot = self
            .store
            .load(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
        if snapshot.status != RunStatus::SuspendedForReview {
            return Err(EngineError::InvalidState(format!(
                "run {} is {:?}, not suspended for review",
                execution_id, snapshot.status
            )));
        }
        Ok(snapshot)
    }
}

/// Rebuild the review description from a suspended snapshot.
pub fn pending_from_snapshot(snapshot: &ContextSnapshot) -> Option<PendingReview> {
    let record = snapshot.pending_review()?;
    let field = |name: &str| record.output.get(name).and_then(Value::as_str);
    Some(PendingReview {
        review_id: field("review_id")
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::nil),
        execution_id: snapshot.execution_id,
        node_id: record.node_id.clone(),
        prompt: field("prompt").unwrap_or_default().to_string(),
        requested_at: record.finished_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore::store::InMemoryContextStore;
    use agentcore::ExecutionContext;

    async fn suspended_run(gate: &HumanReviewGate) -> ExecutionId {
        let id = Uuid::new_v4();
        let ctx = ExecutionContext::new(id, "agent", "conv");
        ctx.append_record(NodeExecutionRecord::new("start", NodeStatus::Completed)).await;
        ctx.append_record(NodeExecutionRecord::new("review", NodeStatus::Pending)).await;
        let snapshot = ctx.snapshot(RunStatus::Running, None).await;
        gate.suspend(id, "review", "Ship it?", snapshot).await.unwrap();
        id
    }

    #[tokio::test]
    async fn approve_appends_completed_record() {
        let store = Arc::new(InMemoryContextStore::new());
        let gate = HumanReviewGate::new(store.clone());
        let id = suspended_run(&gate).await;

        let pending = gate.pending(id).await.unwrap().unwrap();
        assert_eq!(pending.node_id, "review");
        assert_eq!(pending.prompt, "Ship it?");
        assert!(!pending.review_id.is_nil());

        let result = gate.resume(id, ReviewDecision::approve()).await.unwrap();
        assert_eq!(result.node_id, "review");
        assert_eq!(result.snapshot.status, RunStatus::Running);
        let last = result.snapshot.node_history.last().unwrap();
        assert_eq!(last.status, NodeStatus::Completed);
        assert_eq!(result.snapshot.variables["review.output"]["decision"], "approve");

        let stored = store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn reject_appends_failed_record() {
        let gate = HumanReviewGate::new(Arc::new(InMemoryContextStore::new()));
        let id = suspended_run(&gate).await;

        let result = gate.resume(id, ReviewDecision::reject("too risky")).await.unwrap();
        let last = result.snapshot.node_history.last().unwrap();
        assert_eq!(last.status, NodeStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("review rejected: too risky"));
    }

    #[tokio::test]
    async fn second_resume_is_invalid_state() {
        let gate = Arc::new(HumanReviewGate::new(Arc::new(InMemoryContextStore::new())));
        let id = suspended_run(&gate).await;

        let a = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.resume(id, ReviewDecision::approve()).await })
        };
        let b = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.resume(id, ReviewDecision::reject("no")).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EngineError::InvalidState(_)))));
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let gate = HumanReviewGate::new(Arc::new(InMemoryContextStore::new()));
        let err = gate.resume(Uuid::new_v4(), ReviewDecision::approve()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
