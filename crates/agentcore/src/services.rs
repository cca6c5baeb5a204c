//! Service collaborators used by node executors: models, tools, knowledge.

use crate::NodeError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Stream of text deltas from a model.
pub type TokenStream = BoxStream<'static, Result<String, NodeError>>;

/// A single completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Streaming language model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream(&self, request: LlmRequest) -> Result<TokenStream, NodeError>;
}

/// An external tool (local function, HTTP endpoint, MCP server).
#[async_trait]
pub trait ToolClient: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, arguments: Value) -> Result<Value, NodeError>;
}

/// Looks tools up by name.
pub trait ToolClientRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ToolClient>>;
}

/// Fixed set of tools registered at startup.
#[derive(Default, Clone)]
pub struct StaticToolRegistry {
    tools: HashMap<String, Arc<dyn ToolClient>>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolClient>) {
        tracing::info!("Registering tool: {}", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(mut self, tool: Arc<dyn ToolClient>) -> Self {
        self.register(tool);
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ToolClientRegistry for StaticToolRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        self.tools.get(name).cloned()
    }
}

/// A retrieved piece of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub score: f32,
}

/// Knowledge-base search.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Best `top_k` chunks for `query`, most relevant first.
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>, NodeError>;
}
