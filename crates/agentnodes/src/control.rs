use crate::parse_config;
use agentcore::{
    node_key, NodeContext, NodeDef, NodeError, NodeExecutor, NodeOutcome, NodeStatus, FINAL_OUTPUT,
    USER_MESSAGE,
};
use agentruntime::{NodeFactory, NodeMetadata};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Entry node: exposes the user message as its output.
pub struct StartNode;

#[async_trait]
impl NodeExecutor for StartNode {
    fn node_type(&self) -> &str {
        "start"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let message = ctx.require_var(USER_MESSAGE).await?;
        Ok(NodeOutcome::completed(message))
    }
}

pub struct StartNodeFactory;

impl NodeFactory for StartNodeFactory {
    fn create(&self, _node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        Ok(Arc::new(StartNode))
    }

    fn node_type(&self) -> &str {
        "start"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Expose the user message".to_string(),
            category: "control".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndConfig {
    /// Context key to publish; defaults to the output of the last
    /// predecessor that completed
    pub source: Option<String>,
}

/// Terminal node: publishes the run's answer as `final_output`.
pub struct EndNode {
    config: EndConfig,
}

impl EndNode {
    pub fn new(config: EndConfig) -> Self {
        Self { config }
    }

    async fn last_completed_output(&self, ctx: &NodeContext) -> Value {
        let history = ctx.context.history().await;
        let latest = history
            .iter()
            .rev()
            .find(|r| r.status == NodeStatus::Completed && ctx.predecessors.contains(&r.node_id));
        match latest {
            Some(record) => ctx
                .context
                .get(&node_key(&record.node_id, "output"))
                .await
                .unwrap_or_else(|| record.output.clone()),
            None => Value::Null,
        }
    }
}

#[async_trait]
impl NodeExecutor for EndNode {
    fn node_type(&self) -> &str {
        "end"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let value = match &self.config.source {
            Some(key) => ctx.require_var(key).await?,
            None => self.last_completed_output(&ctx).await,
        };
        ctx.context.set(FINAL_OUTPUT, value.clone()).await;
        Ok(NodeOutcome::completed(value))
    }
}

pub struct EndNodeFactory;

impl NodeFactory for EndNodeFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        Ok(Arc::new(EndNode::new(parse_config(node)?)))
    }

    fn node_type(&self) -> &str {
        "end"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Publish the final answer".to_string(),
            category: "control".to_string(),
        }
    }
}
