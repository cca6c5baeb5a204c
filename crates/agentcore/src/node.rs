use crate::context::ExecutionContext;
use crate::events::NodeEmitter;
use crate::template;
use crate::{NodeError, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Core trait that every node executor implements
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Node type this executor runs (e.g. "llm", "tool")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError>;
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,

    /// 1-based attempt number; greater than one on retries
    pub attempt: u32,

    /// Direct predecessors in declaration order
    pub predecessors: Vec<NodeId>,

    /// Direct successors in declaration order
    pub successors: Vec<NodeId>,

    /// Variables and node log shared by the whole run
    pub context: Arc<ExecutionContext>,

    /// Stream emitter scoped to this node
    pub events: NodeEmitter,

    /// Signalled when the run is cancelled or a sibling fails fast
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Get a required variable or return a configuration error
    pub async fn require_var(&self, name: &str) -> Result<Value, NodeError> {
        self.context
            .get(name)
            .await
            .ok_or_else(|| NodeError::config(format!("Missing context variable: {}", name)))
    }

    /// Render a `{{var}}` template against the current variables
    pub async fn render(&self, template: &str) -> String {
        let vars = self.context.variables().await;
        template::render(template, &vars)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Result of a single node execution
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Completed(NodeOutput),
    /// Stop here until a reviewer decides
    AwaitReview { prompt: String },
    /// The node observed the cancellation token and stopped
    Cancelled,
}

impl NodeOutcome {
    pub fn completed(output: impl Into<Value>) -> Self {
        NodeOutcome::Completed(NodeOutput::new(output))
    }
}

/// Output from a completed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub value: Value,

    /// Successors selected by a branch; `None` means all successors fire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<NodeId>>,
}

impl NodeOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            routes: None,
        }
    }

    pub fn with_routes(mut self, routes: Vec<NodeId>) -> Self {
        self.routes = Some(routes);
        self
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}
