// crates/agentruntime/src/loader.rs

use agentcore::store::GraphDefinitionSource;
use agentcore::{
    EngineError, GraphDefinition, GraphFormatError, GraphSettings, NodeDef, NodeId, StoreError,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Validated, immutable workflow graph shared by every run of an agent.
///
/// Nodes are addressed by their declaration index; successor and predecessor
/// lists keep edge declaration order.
#[derive(Debug)]
pub struct Graph {
    definition: GraphDefinition,
    index: HashMap<NodeId, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    topo_order: Vec<usize>,
    entries: Vec<usize>,
}

impl Graph {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn version(&self) -> Option<&str> {
        self.definition.version.as_deref()
    }

    pub fn name(&self) -> &str {
        self.definition.name.as_deref().unwrap_or(&self.definition.id)
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.definition.settings
    }

    pub fn nodes(&self) -> &[NodeDef] {
        &self.definition.nodes
    }

    pub fn len(&self) -> usize {
        self.definition.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &NodeDef {
        &self.definition.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&NodeDef> {
        self.index_of(id).map(|idx| self.node(idx))
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }

    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.predecessors[idx]
    }

    pub fn successor_ids(&self, idx: usize) -> Vec<NodeId> {
        self.ids(&self.successors[idx])
    }

    pub fn predecessor_ids(&self, idx: usize) -> Vec<NodeId> {
        self.ids(&self.predecessors[idx])
    }

    /// Node indices in a dependency-respecting order.
    pub fn topo_order(&self) -> &[usize] {
        &self.topo_order
    }

    pub fn entries(&self) -> &[usize] {
        &self.entries
    }

    pub fn edge_count(&self) -> usize {
        self.definition.edges.len()
    }

    fn ids(&self, indices: &[usize]) -> Vec<NodeId> {
        indices.iter().map(|&i| self.node(i).id.clone()).collect()
    }
}

/// Parses and validates graph definitions. Pure: no I/O, no executor lookup.
pub struct GraphLoader;

impl GraphLoader {
    pub fn load(graph_json: &str) -> Result<Graph, GraphFormatError> {
        let definition: GraphDefinition = serde_json::from_str(graph_json)?;
        Self::from_definition(definition)
    }

    pub fn from_definition(definition: GraphDefinition) -> Result<Graph, GraphFormatError> {
        if definition.nodes.is_empty() {
            return Err(GraphFormatError::Empty);
        }

        let mut graph = DiGraph::<usize, ()>::new();
        let mut index = HashMap::new();
        for (i, node) in definition.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphFormatError::DuplicateNode(node.id.clone()));
            }
            graph.add_node(i);
        }

        let n = definition.nodes.len();
        let mut successors = vec![Vec::new(); n];
        let mut predecessors = vec![Vec::new(); n];
        let mut seen = HashSet::new();

        for edge in &definition.edges {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| GraphFormatError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: id.to_string(),
                })
            };
            let from = lookup(&edge.from)?;
            let to = lookup(&edge.to)?;

            if from == to {
                return Err(GraphFormatError::Cycle(edge.from.clone()));
            }
            if !seen.insert((from, to)) {
                return Err(GraphFormatError::DuplicateEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }

            graph.add_edge(NodeIndex::new(from), NodeIndex::new(to), ());
            successors[from].push(to);
            predecessors[to].push(from);
        }

        let topo_order = toposort(&graph, None)
            .map_err(|cycle| {
                let at = graph[cycle.node_id()];
                GraphFormatError::Cycle(definition.nodes[at].id.clone())
            })?
            .into_iter()
            .map(|ix| graph[ix])
            .collect();

        let roots: Vec<usize> = (0..n).filter(|&i| predecessors[i].is_empty()).collect();
        let entries = match &definition.entry {
            Some(spec) => {
                let mut entries = Vec::new();
                for id in spec.ids() {
                    let idx = *index
                        .get(&id)
                        .ok_or_else(|| GraphFormatError::MissingEntry(id.clone()))?;
                    if !predecessors[idx].is_empty() {
                        return Err(GraphFormatError::EntryHasIncoming(id));
                    }
                    entries.push(idx);
                }
                if let Some(&stray) = roots.iter().find(|r| !entries.contains(r)) {
                    return Err(GraphFormatError::UnreachableRoot(
                        definition.nodes[stray].id.clone(),
                    ));
                }
                entries.sort_unstable();
                entries
            }
            None => roots,
        };
        if entries.is_empty() {
            return Err(GraphFormatError::MissingEntry(definition.id.clone()));
        }

        tracing::debug!(
            graph_id = %definition.id,
            nodes = n,
            edges = definition.edges.len(),
            "Graph loaded"
        );

        Ok(Graph {
            definition,
            index,
            successors,
            predecessors,
            topo_order,
            entries,
        })
    }
}

struct CachedGraph {
    fingerprint: u64,
    graph: Arc<Graph>,
}

/// Parsed graphs per agent. A definition is re-parsed only when its text
/// changes.
#[derive(Default)]
pub struct GraphCache {
    entries: RwLock<HashMap<String, CachedGraph>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load(
        &self,
        agent_id: &str,
        source: &dyn GraphDefinitionSource,
    ) -> Result<Arc<Graph>, EngineError> {
        let raw = source.load_by_agent_id(agent_id).await.map_err(|e| match e {
            StoreError::AgentNotFound(id) => EngineError::NotFound(format!("agent {}", id)),
            other => EngineError::Store(other),
        })?;
        let fingerprint = fingerprint(&raw);

        if let Some(cached) = self.entries.read().await.get(agent_id) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.graph.clone());
            }
        }

        let graph = Arc::new(GraphLoader::load(&raw)?);
        tracing::info!(agent_id, graph_id = %graph.id(), "Caching graph definition");
        self.entries.write().await.insert(
            agent_id.to_string(),
            CachedGraph {
                fingerprint,
                graph: graph.clone(),
            },
        );
        Ok(graph)
    }

    pub async fn invalidate(&self, agent_id: &str) {
        self.entries.write().await.remove(agent_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn fingerprint(raw: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    hasher.finish()
}
