use crate::parse_config;
use agentcore::{node_key, NodeContext, NodeDef, NodeError, NodeExecutor, NodeOutcome, NodeStatus};
use agentruntime::{NodeFactory, NodeMetadata};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Collect whatever predecessors completed
    #[default]
    Any,
    /// Fail unless every predecessor completed
    All,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub mode: MergeMode,
}

/// Join barrier: gathers predecessor outputs into one object keyed by node id.
pub struct MergeNode {
    config: MergeConfig,
}

#[async_trait]
impl NodeExecutor for MergeNode {
    fn node_type(&self) -> &str {
        "merge"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let mut merged = Map::new();
        let mut missing = Vec::new();

        for pred in &ctx.predecessors {
            match ctx.context.latest_status(pred).await {
                Some(NodeStatus::Completed) => {
                    let output = ctx
                        .context
                        .get(&node_key(pred, "output"))
                        .await
                        .unwrap_or(Value::Null);
                    merged.insert(pred.clone(), output);
                }
                _ => missing.push(pred.as_str()),
            }
        }

        if self.config.mode == MergeMode::All && !missing.is_empty() {
            return Err(NodeError::ExecutionFailed(format!(
                "Merge requires all inputs; not completed: {}",
                missing.join(", ")
            )));
        }

        Ok(NodeOutcome::completed(Value::Object(merged)))
    }
}

pub struct MergeNodeFactory;

impl NodeFactory for MergeNodeFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        Ok(Arc::new(MergeNode {
            config: parse_config(node)?,
        }))
    }

    fn node_type(&self) -> &str {
        "merge"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Join parallel branches".to_string(),
            category: "control".to_string(),
        }
    }
}
