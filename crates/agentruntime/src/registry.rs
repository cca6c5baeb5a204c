use agentcore::{NodeDef, NodeError, NodeExecutor};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node executors
pub trait NodeFactory: Send + Sync {
    /// Parse the node's raw config into a typed executor. Called on first
    /// dispatch, so config errors surface as node failures, not load errors.
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of available node types. Immutable once the runtime holds it.
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Create the executor for a node from its declared type and config
    pub fn create_executor(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        let factory = self.factories.get(node.kind.as_str()).ok_or_else(|| {
            NodeError::config(format!("Unknown node type: {}", node.kind))
        })?;

        factory.create(node)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Get all registered node types
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
