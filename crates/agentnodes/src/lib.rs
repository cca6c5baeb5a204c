//! Standard node library
//!
//! Built-in executors for agent graphs (entry, model calls, tools,
//! retrieval, review, routing, joins) and concrete service clients.

mod branch;
pub mod clients;
mod control;
mod llm;
mod merge;
mod retrieval;
mod review;
mod tool;

pub use branch::{evaluate_condition, BranchNode, BranchNodeFactory};
pub use control::{EndNode, EndNodeFactory, StartNode, StartNodeFactory};
pub use llm::{LlmNode, LlmNodeFactory};
pub use merge::{MergeNode, MergeNodeFactory};
pub use retrieval::{RetrievalNode, RetrievalNodeFactory};
pub use review::{HumanReviewNode, HumanReviewNodeFactory};
pub use tool::{ToolNode, ToolNodeFactory, DEFAULT_TOOL_TIMEOUT};

use agentcore::services::{KnowledgeRetriever, LlmClient, StaticToolRegistry, ToolClientRegistry};
use agentcore::{NodeDef, NodeError};
use agentruntime::NodeRegistry;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// External collaborators the built-in nodes call out to.
#[derive(Clone)]
pub struct Services {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolClientRegistry>,
    pub retriever: Arc<dyn KnowledgeRetriever>,
    /// Limit on tool calls whose node sets no `timeout_ms`
    pub tool_timeout: Duration,
}

impl Services {
    /// Offline services: echoing model, no tools, empty knowledge base.
    pub fn offline() -> Self {
        Self {
            llm: Arc::new(clients::EchoLlmClient::default()),
            tools: Arc::new(StaticToolRegistry::new()),
            retriever: Arc::new(clients::KeywordRetriever::default()),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry, services: &Services) {
    registry.register(Arc::new(StartNodeFactory));
    registry.register(Arc::new(EndNodeFactory));
    registry.register(Arc::new(LlmNodeFactory::new(services.llm.clone())));
    registry.register(Arc::new(
        ToolNodeFactory::new(services.tools.clone()).with_default_timeout(services.tool_timeout),
    ));
    registry.register(Arc::new(RetrievalNodeFactory::new(services.retriever.clone())));
    registry.register(Arc::new(HumanReviewNodeFactory));
    registry.register(Arc::new(BranchNodeFactory));
    registry.register(Arc::new(MergeNodeFactory));
}

/// Parse a node's raw config into its typed form. A missing config is the
/// type's default.
pub(crate) fn parse_config<T: DeserializeOwned + Default>(node: &NodeDef) -> Result<T, NodeError> {
    if node.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(node.config.clone()).map_err(|e| {
        NodeError::config(format!("Invalid config for node {}: {}", node.id, e))
    })
}
