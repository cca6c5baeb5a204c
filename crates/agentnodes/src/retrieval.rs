use crate::parse_config;
use agentcore::services::KnowledgeRetriever;
use agentcore::{NodeContext, NodeDef, NodeError, NodeExecutor, NodeOutcome};
use agentruntime::{NodeFactory, NodeMetadata};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub query: String,
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            query: "{{user_message}}".to_string(),
            top_k: 3,
        }
    }
}

/// Looks up knowledge chunks for a rendered query.
pub struct RetrievalNode {
    config: RetrievalConfig,
    retriever: Arc<dyn KnowledgeRetriever>,
}

impl RetrievalNode {
    pub fn new(config: RetrievalConfig, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self { config, retriever }
    }
}

#[async_trait]
impl NodeExecutor for RetrievalNode {
    fn node_type(&self) -> &str {
        "retrieval"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let query = ctx.render(&self.config.query).await;

        let chunks = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Ok(NodeOutcome::Cancelled),
            chunks = self.retriever.retrieve(&query, self.config.top_k) => chunks?,
        };

        ctx.events
            .info(format!("Retrieved {} chunks", chunks.len()))
            .await;
        let output = serde_json::to_value(&chunks)
            .map_err(|e| NodeError::ExecutionFailed(format!("Unserializable chunks: {}", e)))?;
        Ok(NodeOutcome::completed(output))
    }
}

pub struct RetrievalNodeFactory {
    retriever: Arc<dyn KnowledgeRetriever>,
}

impl RetrievalNodeFactory {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self { retriever }
    }
}

impl NodeFactory for RetrievalNodeFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        let config: RetrievalConfig = parse_config(node)?;
        if config.top_k == 0 {
            return Err(NodeError::config("top_k must be at least 1"));
        }
        Ok(Arc::new(RetrievalNode::new(config, self.retriever.clone())))
    }

    fn node_type(&self) -> &str {
        "retrieval"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Search the knowledge base".to_string(),
            category: "ai".to_string(),
        }
    }
}
