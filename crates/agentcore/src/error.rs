use thiserror::Error;

/// Errors surfaced past the engine boundary to callers of the runtime.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Graph format error: {0}")]
    GraphFormat(#[from] GraphFormatError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execution(String),
}

/// Structural problems found while loading a graph definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphFormatError {
    #[error("Malformed graph JSON: {0}")]
    Malformed(String),

    #[error("Graph has no nodes")]
    Empty,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Edge {from} -> {to} references unknown node {missing}")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Duplicate edge {from} -> {to}")]
    DuplicateEdge { from: String, to: String },

    #[error("Cycle detected at node {0}")]
    Cycle(String),

    #[error("Missing entry node: {0}")]
    MissingEntry(String),

    #[error("Entry node {0} has incoming edges")]
    EntryHasIncoming(String),

    #[error("Node {0} has no incoming edges but is not a declared entry")]
    UnreachableRoot(String),
}

impl From<serde_json::Error> for GraphFormatError {
    fn from(e: serde_json::Error) -> Self {
        GraphFormatError::Malformed(e.to_string())
    }
}

/// Errors raised by a node executor. They are captured into the node's
/// execution record and never unwind past the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl NodeError {
    /// Transient errors and timeouts are retried before the node is failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Transient(_) | NodeError::Timeout { .. })
    }

    pub fn config(message: impl Into<String>) -> Self {
        NodeError::Configuration(message.into())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Graph definition not found for agent {0}")]
    AgentNotFound(String),

    #[error("{0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(NodeError::Transient("503".into()).is_transient());
        assert!(NodeError::Timeout { millis: 10 }.is_transient());
        assert!(!NodeError::config("bad").is_transient());
        assert!(!NodeError::ExecutionFailed("boom".into()).is_transient());
    }

    #[test]
    fn graph_error_wraps_into_engine_error() {
        let err: EngineError = GraphFormatError::Cycle("a".into()).into();
        assert!(matches!(err, EngineError::GraphFormat(GraphFormatError::Cycle(_))));
        assert_eq!(err.to_string(), "Graph format error: Cycle detected at node a");
    }
}
