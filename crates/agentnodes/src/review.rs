use crate::parse_config;
use agentcore::{NodeContext, NodeDef, NodeError, NodeExecutor, NodeOutcome};
use agentruntime::{NodeFactory, NodeMetadata};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub prompt: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            prompt: "Approve to continue".to_string(),
        }
    }
}

/// Pauses the run until a person approves or rejects.
pub struct HumanReviewNode {
    config: ReviewConfig,
}

#[async_trait]
impl NodeExecutor for HumanReviewNode {
    fn node_type(&self) -> &str {
        "human_review"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let prompt = ctx.render(&self.config.prompt).await;
        Ok(NodeOutcome::AwaitReview { prompt })
    }
}

pub struct HumanReviewNodeFactory;

impl NodeFactory for HumanReviewNodeFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        Ok(Arc::new(HumanReviewNode {
            config: parse_config(node)?,
        }))
    }

    fn node_type(&self) -> &str {
        "human_review"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Wait for a human decision".to_string(),
            category: "control".to_string(),
        }
    }
}
