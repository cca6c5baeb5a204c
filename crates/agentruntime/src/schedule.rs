use crate::loader::Graph;
use agentcore::context::latest_records;
use agentcore::{NodeExecutionRecord, NodeStatus, RunFailure};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Which out-edges of a settled node are taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firing {
    All,
    Only(HashSet<usize>),
    None,
}

impl Firing {
    fn fires(&self, successor: usize) -> bool {
        match self {
            Firing::All => true,
            Firing::Only(targets) => targets.contains(&successor),
            Firing::None => false,
        }
    }
}

/// Ready-set bookkeeping for one run.
///
/// A node becomes ready once every incoming edge is settled and at least one
/// of them was taken. If none was taken it is skipped, which settles its own
/// out-edges as not taken.
#[derive(Debug)]
pub struct Schedule {
    pending_edges: Vec<usize>,
    taken_edges: Vec<usize>,
    settled: Vec<bool>,
    claimed: Vec<bool>,
    /// Ordered by declaration index, which is the dispatch tie-break
    ready: BTreeSet<usize>,
}

impl Schedule {
    pub fn new(graph: &Graph) -> Self {
        let n = graph.len();
        Self {
            pending_edges: (0..n).map(|i| graph.predecessors(i).len()).collect(),
            taken_edges: vec![0; n],
            settled: vec![false; n],
            claimed: vec![false; n],
            ready: graph.entries().iter().copied().collect(),
        }
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Take the next ready node and mark it as dispatched.
    pub fn pop_ready(&mut self) -> Option<usize> {
        let idx = self.ready.pop_first()?;
        self.claimed[idx] = true;
        Some(idx)
    }

    fn claim(&mut self, idx: usize) {
        self.ready.remove(&idx);
        self.claimed[idx] = true;
    }

    pub fn is_settled(&self, idx: usize) -> bool {
        self.settled[idx]
    }

    /// Mark `idx` terminal and propagate along its out-edges. Returns the
    /// nodes skipped as a consequence, in the order they were reached.
    pub fn settle(&mut self, graph: &Graph, idx: usize, firing: Firing) -> Vec<usize> {
        let mut skipped = Vec::new();
        if self.settled[idx] {
            return skipped;
        }
        self.settled[idx] = true;
        self.claimed[idx] = true;
        self.ready.remove(&idx);

        let mut queue = VecDeque::from([(idx, firing)]);
        while let Some((node, firing)) = queue.pop_front() {
            for &succ in graph.successors(node) {
                self.pending_edges[succ] -= 1;
                if firing.fires(succ) {
                    self.taken_edges[succ] += 1;
                }
                if self.pending_edges[succ] > 0 || self.settled[succ] || self.claimed[succ] {
                    continue;
                }
                if self.taken_edges[succ] > 0 {
                    self.ready.insert(succ);
                } else {
                    self.settled[succ] = true;
                    self.claimed[succ] = true;
                    skipped.push(succ);
                    queue.push_back((succ, Firing::None));
                }
            }
        }
        skipped
    }

    /// Nodes that never reached a terminal status, in declaration order.
    pub fn unsettled(&self) -> Vec<usize> {
        (0..self.settled.len()).filter(|&i| !self.settled[i]).collect()
    }

    /// Rebuild scheduling state from a node log, e.g. after a resume.
    pub fn replay(graph: &Graph, history: &[NodeExecutionRecord]) -> Replay {
        let latest: HashMap<&str, &NodeExecutionRecord> = latest_records(history)
            .into_iter()
            .map(|r| (r.node_id.as_str(), r))
            .collect();

        let mut replay = Replay {
            schedule: Schedule::new(graph),
            failure: None,
            awaiting: Vec::new(),
            unrecorded_skips: Vec::new(),
        };
        let schedule = &mut replay.schedule;

        for &idx in graph.topo_order() {
            let node = graph.node(idx);
            let Some(record) = latest.get(node.id.as_str()) else {
                continue;
            };
            if schedule.settled[idx] {
                continue;
            }

            match record.status {
                NodeStatus::Pending => {
                    schedule.claim(idx);
                    replay.awaiting.push(idx);
                }
                NodeStatus::Running => {}
                status => {
                    let firing = match status {
                        NodeStatus::Completed => firing_for(graph, idx, record.routes.as_deref()),
                        _ => Firing::None,
                    };
                    if status == NodeStatus::Failed && replay.failure.is_none() {
                        replay.failure = Some(RunFailure {
                            node_id: Some(node.id.clone()),
                            message: record.error.clone().unwrap_or_else(|| "node failed".into()),
                        });
                    }
                    for skipped in schedule.settle(graph, idx, firing) {
                        let recorded = latest
                            .get(graph.node(skipped).id.as_str())
                            .map_or(false, |r| r.status == NodeStatus::Skipped);
                        if !recorded {
                            replay.unrecorded_skips.push(skipped);
                        }
                    }
                }
            }
        }

        replay
    }
}

/// Translate recorded branch routes into a firing set.
pub fn firing_for(graph: &Graph, idx: usize, routes: Option<&[String]>) -> Firing {
    match routes {
        None => Firing::All,
        Some(routes) => Firing::Only(
            routes
                .iter()
                .filter_map(|id| graph.index_of(id))
                .filter(|succ| graph.successors(idx).contains(succ))
                .collect(),
        ),
    }
}

/// Scheduling state recovered from a node log.
#[derive(Debug)]
pub struct Replay {
    pub schedule: Schedule,
    /// First node whose latest record is FAILED, in topological order
    pub failure: Option<RunFailure>,
    /// Nodes whose latest record is PENDING
    pub awaiting: Vec<usize>,
    /// Nodes skipped by the replayed settlement that have no SKIPPED record yet
    pub unrecorded_skips: Vec<usize>,
}
