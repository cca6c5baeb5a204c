use crate::run::{ExecutionId, RunStatus};
use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

/// Variable holding the user message that started the run.
pub const USER_MESSAGE: &str = "user_message";
/// Variable the `end` node writes; carried by the completion event.
pub const FINAL_OUTPUT: &str = "final_output";

/// Node-scoped variable name, e.g. `llm.output`.
pub fn node_key(node_id: &str, field: &str) -> String {
    format!("{}.{}", node_id, field)
}

/// Status of one node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

/// One entry of the append-only node log. Retries append new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: NodeId,
    pub attempt: u32,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Value,
    /// Successors a branch node selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<NodeId>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeExecutionRecord {
    pub fn new(node_id: impl Into<NodeId>, status: NodeStatus) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            attempt: 1,
            status,
            output: Value::Null,
            routes: None,
            started_at: now,
            finished_at: now,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_routes(mut self, routes: Option<Vec<NodeId>>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn started(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }
}

/// Variables and node log shared by every node of one run.
///
/// Each read and write takes the lock for exactly one operation, so
/// concurrently running nodes see whole values only. Writes to the same key
/// are last-write-wins.
#[derive(Debug)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    agent_id: String,
    conversation_id: String,
    variables: RwLock<HashMap<String, Value>>,
    history: Mutex<Vec<NodeExecutionRecord>>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: ExecutionId,
        agent_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            agent_id: agent_id.into(),
            conversation_id: conversation_id.into(),
            variables: RwLock::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild a context from a persisted snapshot.
    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self {
            execution_id: snapshot.execution_id,
            agent_id: snapshot.agent_id,
            conversation_id: snapshot.conversation_id,
            variables: RwLock::new(snapshot.variables),
            history: Mutex::new(snapshot.node_history),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.variables.read().await.get(key).cloned()
    }

    pub async fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key).await? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.variables.write().await.insert(key.into(), value);
    }

    /// Write several keys under one lock acquisition.
    pub async fn set_many(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        let mut vars = self.variables.write().await;
        for (key, value) in entries {
            vars.insert(key, value);
        }
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.variables.read().await.clone()
    }

    pub async fn append_record(&self, record: NodeExecutionRecord) {
        tracing::debug!(
            execution_id = %self.execution_id,
            node_id = %record.node_id,
            status = ?record.status,
            attempt = record.attempt,
            "Node record appended"
        );
        self.history.lock().await.push(record);
    }

    pub async fn history(&self) -> Vec<NodeExecutionRecord> {
        self.history.lock().await.clone()
    }

    /// Latest recorded status of a node, if it has any record.
    pub async fn latest_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.node_id == node_id)
            .map(|r| r.status)
    }

    pub async fn snapshot(&self, status: RunStatus, error: Option<String>) -> ContextSnapshot {
        ContextSnapshot {
            execution_id: self.execution_id,
            agent_id: self.agent_id.clone(),
            conversation_id: self.conversation_id.clone(),
            variables: self.variables().await,
            node_history: self.history().await,
            status,
            error,
            updated_at: Utc::now(),
        }
    }
}

/// Serialized run state: everything needed to resume or audit a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub execution_id: ExecutionId,
    pub agent_id: String,
    pub conversation_id: String,
    pub variables: HashMap<String, Value>,
    pub node_history: Vec<NodeExecutionRecord>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContextSnapshot {
    /// Latest record of each node, in first-seen order.
    pub fn latest_records(&self) -> Vec<&NodeExecutionRecord> {
        latest_records(&self.node_history)
    }

    /// The review node this run is waiting on, if any.
    pub fn pending_review(&self) -> Option<&NodeExecutionRecord> {
        self.latest_records()
            .into_iter()
            .find(|r| r.status == NodeStatus::Pending)
    }

    pub fn count_status(&self, status: NodeStatus) -> usize {
        self.latest_records()
            .into_iter()
            .filter(|r| r.status == status)
            .count()
    }
}

/// Collapse a node log to the most recent record per node.
pub fn latest_records(history: &[NodeExecutionRecord]) -> Vec<&NodeExecutionRecord> {
    let mut order: Vec<&str> = Vec::new();
    let mut latest: HashMap<&str, &NodeExecutionRecord> = HashMap::new();
    for record in history {
        if latest.insert(record.node_id.as_str(), record).is_none() {
            order.push(record.node_id.as_str());
        }
    }
    order.into_iter().filter_map(|id| latest.get(id).copied()).collect()
}
