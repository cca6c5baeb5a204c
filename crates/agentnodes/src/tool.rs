use crate::parse_config;
use agentcore::services::ToolClientRegistry;
use agentcore::template::render_value;
use agentcore::{NodeContext, NodeDef, NodeError, NodeExecutor, NodeOutcome};
use agentruntime::{NodeFactory, NodeMetadata};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Limit on one tool call when neither the node nor the services set one.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Name the tool is registered under
    pub tool: String,
    /// Arguments; string leaves are `{{var}}` templates
    pub arguments: Value,
    /// Overrides the services' tool timeout for this node
    pub timeout_ms: Option<u64>,
}

/// Invokes a named external tool with templated arguments.
pub struct ToolNode {
    config: ToolConfig,
    tools: Arc<dyn ToolClientRegistry>,
    timeout: Duration,
}

impl ToolNode {
    pub fn new(config: ToolConfig, tools: Arc<dyn ToolClientRegistry>, default_timeout: Duration) -> Self {
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        Self {
            config,
            tools,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl NodeExecutor for ToolNode {
    fn node_type(&self) -> &str {
        "tool"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let name = &self.config.tool;
        let tool = self
            .tools
            .resolve(name)
            .ok_or_else(|| NodeError::config(format!("Unknown tool: {}", name)))?;

        let vars = ctx.context.variables().await;
        let arguments = match &self.config.arguments {
            Value::Null => Value::Object(Default::default()),
            args => render_value(args, &vars),
        };

        ctx.events.info(format!("Calling tool {}", name)).await;
        tracing::debug!(node_id = %ctx.node_id, tool = %name, "Invoking tool");

        let call = async {
            tokio::time::timeout(self.timeout, tool.invoke(arguments))
                .await
                .map_err(|_| NodeError::Timeout {
                    millis: self.timeout.as_millis() as u64,
                })?
        };

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => Ok(NodeOutcome::Cancelled),
            result = call => Ok(NodeOutcome::completed(result?)),
        }
    }
}

pub struct ToolNodeFactory {
    tools: Arc<dyn ToolClientRegistry>,
    default_timeout: Duration,
}

impl ToolNodeFactory {
    pub fn new(tools: Arc<dyn ToolClientRegistry>) -> Self {
        Self {
            tools,
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn build(&self, node: &NodeDef) -> Result<ToolNode, NodeError> {
        let config: ToolConfig = parse_config(node)?;
        if config.tool.is_empty() {
            return Err(NodeError::config(format!(
                "Tool node {} does not name a tool",
                node.id
            )));
        }
        Ok(ToolNode::new(config, self.tools.clone(), self.default_timeout))
    }
}

impl NodeFactory for ToolNodeFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        Ok(Arc::new(self.build(node)?))
    }

    fn node_type(&self) -> &str {
        "tool"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Call an external tool".to_string(),
            category: "tools".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore::services::StaticToolRegistry;
    use agentcore::NodeKind;
    use serde_json::json;

    fn tool_node(config: Value) -> NodeDef {
        let mut node = NodeDef::new("refund", NodeKind::Tool);
        node.config = config;
        node
    }

    #[test]
    fn tool_calls_are_always_bounded() {
        let factory = ToolNodeFactory::new(Arc::new(StaticToolRegistry::new()));
        let node = factory.build(&tool_node(json!({ "tool": "issue_refund" }))).unwrap();
        assert_eq!(node.timeout(), DEFAULT_TOOL_TIMEOUT);

        let factory = factory.with_default_timeout(Duration::from_secs(5));
        let node = factory.build(&tool_node(json!({ "tool": "issue_refund" }))).unwrap();
        assert_eq!(node.timeout(), Duration::from_secs(5));

        let node = factory
            .build(&tool_node(json!({ "tool": "issue_refund", "timeout_ms": 250 })))
            .unwrap();
        assert_eq!(node.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn unnamed_tool_is_rejected() {
        let factory = ToolNodeFactory::new(Arc::new(StaticToolRegistry::new()));
        assert!(factory.build(&tool_node(json!({}))).is_err());
    }
}
