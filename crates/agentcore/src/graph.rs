use serde::{Deserialize, Serialize};
use std::fmt;

pub type NodeId = String;

/// Workflow definition as stored by the agent catalog.
///
/// This is the raw, unvalidated shape. The runtime's loader turns it into an
/// immutable, validated graph that all runs of the agent share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entry: Option<EntrySpec>,
    #[serde(default)]
    pub settings: GraphSettings,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

impl GraphDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            name: None,
            entry: None,
            settings: GraphSettings::default(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeDef) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.edges.push(EdgeDef {
            from: from.into(),
            to: to.into(),
        });
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(EntrySpec::Single(entry.into()));
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// A declared entry: one node id or a set of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EntrySpec {
    Single(NodeId),
    Many(Vec<NodeId>),
}

impl EntrySpec {
    pub fn ids(&self) -> Vec<NodeId> {
        match self {
            EntrySpec::Single(id) => vec![id.clone()],
            EntrySpec::Many(ids) => ids.clone(),
        }
    }
}

/// Node declaration. `config` stays opaque until the matching executor
/// parses it on first dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl NodeDef {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            config: serde_json::Value::Null,
            retry: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 2.0,
        });
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Declared node type. Unknown names are kept as `Custom` so the loader stays
/// type-agnostic; the registry decides at dispatch whether they can run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Start,
    End,
    Llm,
    Tool,
    Retrieval,
    HumanReview,
    Branch,
    Merge,
    Custom(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Llm => "llm",
            NodeKind::Tool => "tool",
            NodeKind::Retrieval => "retrieval",
            NodeKind::HumanReview => "human_review",
            NodeKind::Branch => "branch",
            NodeKind::Merge => "merge",
            NodeKind::Custom(name) => name,
        }
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "start" => NodeKind::Start,
            "end" => NodeKind::End,
            "llm" => NodeKind::Llm,
            "tool" | "mcp" => NodeKind::Tool,
            "retrieval" | "knowledge" => NodeKind::Retrieval,
            "human_review" | "review" => NodeKind::HumanReview,
            "branch" | "condition" => NodeKind::Branch,
            "merge" | "join" => NodeKind::Merge,
            _ => NodeKind::Custom(s),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(s: &str) -> Self {
        NodeKind::from(s.to_string())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EdgeDef {
    pub from: NodeId,
    pub to: NodeId,
}

/// Retry policy for transient node failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 200,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1) as i32;
        (self.delay_ms as f64 * self.backoff_multiplier.powi(exp)) as u64
    }
}

/// Per-graph overrides of runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSettings {
    #[serde(default)]
    pub max_parallel_nodes: Option<usize>,
    #[serde(default)]
    pub on_error: Option<FailurePolicy>,
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
}

/// What the scheduler does with the rest of the graph when a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching, abort in-flight siblings, skip the rest.
    #[default]
    FailFast,
    /// Skip only the failed node's dependents; independent branches finish.
    ContinueOnError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_kind_parses_aliases_and_custom() {
        assert_eq!(NodeKind::from("LLM"), NodeKind::Llm);
        assert_eq!(NodeKind::from("mcp"), NodeKind::Tool);
        assert_eq!(NodeKind::from("human_review"), NodeKind::HumanReview);
        assert_eq!(NodeKind::from("sentiment"), NodeKind::Custom("sentiment".into()));
        assert_eq!(NodeKind::Custom("sentiment".into()).as_str(), "sentiment");
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let def: GraphDefinition = serde_json::from_value(json!({
            "id": "bot",
            "entry": ["a", "b"],
            "settings": { "on_error": "continue_on_error" },
            "nodes": [
                { "id": "a", "type": "start" },
                { "id": "b", "type": "llm", "config": { "prompt": "hi" },
                  "retry": { "max_attempts": 5, "delay_ms": 10 } }
            ],
            "edges": [ { "from": "a", "to": "b" } ]
        }))
        .unwrap();

        assert_eq!(def.entry, Some(EntrySpec::Many(vec!["a".into(), "b".into()])));
        assert_eq!(def.settings.on_error, Some(FailurePolicy::ContinueOnError));
        let b = def.find_node("b").unwrap();
        assert_eq!(b.kind, NodeKind::Llm);
        assert_eq!(b.retry.as_ref().unwrap().backoff_multiplier, 2.0);
        assert!(def.find_node("a").unwrap().config.is_null());
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 4,
            delay_ms: 100,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_ms(1), 100);
        assert_eq!(policy.backoff_ms(2), 200);
        assert_eq!(policy.backoff_ms(3), 400);
    }
}
