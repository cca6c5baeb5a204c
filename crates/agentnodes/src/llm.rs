use crate::parse_config;
use agentcore::services::{LlmClient, LlmRequest};
use agentcore::{NodeContext, NodeDef, NodeError, NodeExecutor, NodeOutcome};
use agentruntime::{NodeFactory, NodeMetadata};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `{{var}}` template rendered against the run's variables
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            prompt: "{{user_message}}".to_string(),
            system: None,
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Streams a model completion, forwarding each delta as a token event.
pub struct LlmNode {
    config: LlmConfig,
    client: Arc<dyn LlmClient>,
}

impl LlmNode {
    pub fn new(config: LlmConfig, client: Arc<dyn LlmClient>) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl NodeExecutor for LlmNode {
    fn node_type(&self) -> &str {
        "llm"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let prompt = ctx.render(&self.config.prompt).await;
        let system = match &self.config.system {
            Some(system) => Some(ctx.render(system).await),
            None => None,
        };
        let request = LlmRequest {
            model: self.config.model.clone(),
            system,
            prompt,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut stream = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Ok(NodeOutcome::Cancelled),
            stream = self.client.stream(request) => stream?,
        };

        let mut text = String::new();
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => {
                    tracing::debug!(node_id = %ctx.node_id, chars = text.len(), "Generation cancelled");
                    return Ok(NodeOutcome::Cancelled);
                }
                next = stream.next() => match next {
                    Some(Ok(delta)) => {
                        if delta.is_empty() {
                            continue;
                        }
                        text.push_str(&delta);
                        ctx.events.token(delta).await;
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        Ok(NodeOutcome::completed(text))
    }
}

pub struct LlmNodeFactory {
    client: Arc<dyn LlmClient>,
}

impl LlmNodeFactory {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

impl NodeFactory for LlmNodeFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        Ok(Arc::new(LlmNode::new(parse_config(node)?, self.client.clone())))
    }

    fn node_type(&self) -> &str {
        "llm"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Stream a completion from a language model".to_string(),
            category: "ai".to_string(),
        }
    }
}
