use crate::parse_config;
use agentcore::template::display;
use agentcore::{NodeContext, NodeDef, NodeError, NodeExecutor, NodeId, NodeOutcome, NodeOutput};
use agentruntime::{NodeFactory, NodeMetadata};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    /// `key == "v"`, `key != "v"` or `key contains "v"`
    pub condition: String,
    pub target: NodeId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchMode {
    /// Take the first matching route
    #[default]
    First,
    /// Take every matching route
    All,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub routes: Vec<Route>,
    /// Target when no route matches; otherwise every successor is skipped
    pub default: Option<NodeId>,
    pub mode: BranchMode,
}

/// Evaluate a condition against the run's variables.
///
/// Values are compared by their display form, so `attempts == "3"` matches
/// a numeric 3. A missing key never matches.
pub fn evaluate_condition(expr: &str, vars: &HashMap<String, Value>) -> bool {
    let Some((key, op, value)) = parse_condition(expr) else {
        return false;
    };
    let Some(actual) = vars.get(key).filter(|v| !v.is_null()).map(display) else {
        return false;
    };

    match op {
        Op::Contains => actual.contains(value),
        Op::NotEquals => actual != value,
        Op::Equals => actual == value,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Contains,
    NotEquals,
    Equals,
}

const OPERATORS: [(&str, Op); 3] = [
    (" contains ", Op::Contains),
    ("!=", Op::NotEquals),
    ("==", Op::Equals),
];

/// Split `key OP "value"` at the first operator outside double quotes.
fn parse_condition(expr: &str) -> Option<(&str, Op, &str)> {
    let expr = expr.trim();
    let mut quoted = false;

    for (at, c) in expr.char_indices() {
        if c == '"' {
            quoted = !quoted;
            continue;
        }
        if quoted {
            continue;
        }
        let rest = &expr[at..];
        let Some(&(token, op)) = OPERATORS.iter().find(|(token, _)| rest.starts_with(token)) else {
            continue;
        };

        let key = expr[..at].trim();
        if key.is_empty() {
            return None;
        }
        let value = rest[token.len()..].trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        return Some((key, op, value));
    }

    None
}

/// Routes the run to a subset of its successors.
pub struct BranchNode {
    config: BranchConfig,
}

impl BranchNode {
    pub fn new(config: BranchConfig) -> Self {
        Self { config }
    }

    fn check_target(&self, ctx: &NodeContext, target: &str) -> Result<(), NodeError> {
        if ctx.successors.iter().any(|s| s == target) {
            Ok(())
        } else {
            Err(NodeError::config(format!(
                "Branch target {} is not a successor of {}",
                target, ctx.node_id
            )))
        }
    }
}

#[async_trait]
impl NodeExecutor for BranchNode {
    fn node_type(&self) -> &str {
        "branch"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        for route in &self.config.routes {
            self.check_target(&ctx, &route.target)?;
        }
        if let Some(default) = &self.config.default {
            self.check_target(&ctx, default)?;
        }

        let vars = ctx.context.variables().await;
        let mut selected: Vec<NodeId> = Vec::new();
        for route in &self.config.routes {
            if evaluate_condition(&route.condition, &vars) && !selected.contains(&route.target) {
                selected.push(route.target.clone());
                if self.config.mode == BranchMode::First {
                    break;
                }
            }
        }
        let matched = !selected.is_empty();
        if !matched {
            selected.extend(self.config.default.iter().cloned());
        }

        tracing::debug!(node_id = %ctx.node_id, routes = ?selected, matched, "Branch evaluated");
        let output = NodeOutput::new(json!({ "selected": selected, "matched": matched }))
            .with_routes(selected);
        Ok(NodeOutcome::Completed(output))
    }
}

pub struct BranchNodeFactory;

impl NodeFactory for BranchNodeFactory {
    fn create(&self, node: &NodeDef) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        Ok(Arc::new(BranchNode::new(parse_config(node)?)))
    }

    fn node_type(&self) -> &str {
        "branch"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Choose successors by condition".to_string(),
            category: "control".to_string(),
        }
    }
}
