//! Layered layout of the observed node graph.
//!
//! Back edges found by a DFS in sorted order are ignored, ranks are the
//! longest path from a root, and order within a rank comes from barycenter
//! sweeps with node id as tie-breaker. Same input, same output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::events::{Envelope, Event, StateSnapshot};
use crate::ids::NodeId;

pub const RANK_SPACING: f64 = 120.0;
pub const NODE_SPACING: f64 = 200.0;
const SWEEPS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub rank: u32,
    pub order: u32,
}

type Adjacency = BTreeMap<NodeId, BTreeSet<NodeId>>;

pub fn layout(nodes: &BTreeSet<NodeId>, edges: &BTreeSet<(NodeId, NodeId)>) -> BTreeMap<NodeId, Position> {
    let mut all: BTreeSet<NodeId> = nodes.clone();
    for (from, to) in edges {
        all.insert(from.clone());
        all.insert(to.clone());
    }
    if all.is_empty() {
        return BTreeMap::new();
    }

    let mut succ: Adjacency = all.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
    for (from, to) in edges {
        if from != to {
            succ.entry(from.clone()).or_default().insert(to.clone());
        }
    }
    remove_back_edges(&mut succ);

    let ranks = longest_path_ranks(&succ);
    let mut pred: Adjacency = all.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
    for (from, tos) in &succ {
        for to in tos {
            pred.entry(to.clone()).or_default().insert(from.clone());
        }
    }

    let max_rank = ranks.values().copied().max().unwrap_or(0);
    let mut layers: Vec<Vec<NodeId>> = vec![Vec::new(); max_rank as usize + 1];
    for (node, rank) in &ranks {
        layers[*rank as usize].push(node.clone());
    }

    for sweep in 0..SWEEPS {
        let index = order_index(&layers);
        if sweep % 2 == 0 {
            for layer in layers.iter_mut().skip(1) {
                reorder(layer, &pred, &index);
            }
        } else {
            let len = layers.len();
            for layer in layers.iter_mut().take(len.saturating_sub(1)).rev() {
                reorder(layer, &succ, &index);
            }
        }
    }

    let mut positions = BTreeMap::new();
    for (rank, layer) in layers.iter().enumerate() {
        let offset = (layer.len() as f64 - 1.0) / 2.0;
        for (order, node) in layer.iter().enumerate() {
            positions.insert(
                node.clone(),
                Position {
                    x: (order as f64 - offset) * NODE_SPACING,
                    y: rank as f64 * RANK_SPACING,
                    rank: rank as u32,
                    order: order as u32,
                },
            );
        }
    }
    positions
}

/// Iterative DFS in sorted order; edges into a node still on the stack go.
fn remove_back_edges(succ: &mut Adjacency) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Fresh,
        OnStack,
        Done,
    }

    let mut mark: BTreeMap<NodeId, Mark> = succ.keys().map(|n| (n.clone(), Mark::Fresh)).collect();
    let mut back: Vec<(NodeId, NodeId)> = Vec::new();
    let roots: Vec<NodeId> = succ.keys().cloned().collect();

    for root in roots {
        if mark.get(&root) != Some(&Mark::Fresh) {
            continue;
        }
        mark.insert(root.clone(), Mark::OnStack);
        let children: Vec<NodeId> = succ.get(&root).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        let mut stack: Vec<(NodeId, Vec<NodeId>, usize)> = vec![(root, children, 0)];

        while let Some((node, children, cursor)) = stack.last_mut() {
            if *cursor >= children.len() {
                mark.insert(node.clone(), Mark::Done);
                stack.pop();
                continue;
            }
            let child = children[*cursor].clone();
            *cursor += 1;
            match mark.get(&child).copied().unwrap_or(Mark::Fresh) {
                Mark::OnStack => back.push((node.clone(), child)),
                Mark::Done => {}
                Mark::Fresh => {
                    mark.insert(child.clone(), Mark::OnStack);
                    let grand: Vec<NodeId> = succ.get(&child).map(|s| s.iter().cloned().collect()).unwrap_or_default();
                    stack.push((child, grand, 0));
                }
            }
        }
    }

    for (from, to) in back {
        if let Some(set) = succ.get_mut(&from) {
            set.remove(&to);
        }
    }
}

/// Kahn's algorithm over an acyclic adjacency, rank = longest path from a root.
fn longest_path_ranks(succ: &Adjacency) -> BTreeMap<NodeId, u32> {
    let mut indegree: BTreeMap<&NodeId, usize> = succ.keys().map(|n| (n, 0)).collect();
    for tos in succ.values() {
        for to in tos {
            *indegree.entry(to).or_default() += 1;
        }
    }
    let mut ready: BTreeSet<&NodeId> = indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
    let mut ranks: BTreeMap<NodeId, u32> = BTreeMap::new();

    while let Some(node) = ready.pop_first() {
        let rank = *ranks.entry(node.clone()).or_insert(0);
        if let Some(tos) = succ.get(node) {
            for to in tos {
                let r = ranks.entry(to.clone()).or_insert(0);
                *r = (*r).max(rank + 1);
                if let Some(d) = indegree.get_mut(to) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(to);
                    }
                }
            }
        }
    }
    ranks
}

fn order_index(layers: &[Vec<NodeId>]) -> BTreeMap<NodeId, usize> {
    layers
        .iter()
        .flat_map(|layer| layer.iter().enumerate().map(|(i, n)| (n.clone(), i)))
        .collect()
}

fn reorder(layer: &mut [NodeId], neighbors: &Adjacency, index: &BTreeMap<NodeId, usize>) {
    let mut keyed: Vec<(f64, NodeId)> = layer
        .iter()
        .enumerate()
        .map(|(own, node)| {
            let positions: Vec<usize> = neighbors
                .get(node)
                .map(|set| set.iter().filter_map(|n| index.get(n).copied()).collect())
                .unwrap_or_default();
            let bary = if positions.is_empty() {
                own as f64
            } else {
                positions.iter().sum::<usize>() as f64 / positions.len() as f64
            };
            (bary, node.clone())
        })
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    for (slot, (_, node)) in layer.iter_mut().zip(keyed) {
        *slot = node;
    }
}

/// Node graph as observed from a thread's events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedGraph {
    pub nodes: BTreeSet<NodeId>,
    pub edges: BTreeSet<(NodeId, NodeId)>,
    #[serde(skip)]
    last: Option<NodeId>,
}

impl ObservedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, env: &Envelope) {
        match &env.event {
            Event::NodeStart { node } => self.visit(node),
            Event::StateSnapshot(snapshot) => self.merge_snapshot(snapshot),
            _ => {}
        }
    }

    /// Record a node execution; the previous one gets an edge to it.
    pub fn visit(&mut self, node: &NodeId) {
        self.nodes.insert(node.clone());
        if let Some(prev) = self.last.replace(node.clone()) {
            self.edges.insert((prev, node.clone()));
        }
    }

    pub fn merge_snapshot(&mut self, snapshot: &StateSnapshot) {
        self.nodes.extend(snapshot.visited_nodes.iter().cloned());
        self.nodes.extend(snapshot.next_nodes.iter().cloned());
        if snapshot.edges.is_empty() {
            for pair in snapshot.visited_nodes.windows(2) {
                self.edges.insert((pair[0].clone(), pair[1].clone()));
            }
        } else {
            self.edges.extend(snapshot.edges.iter().cloned());
        }
        if let Some(last) = snapshot.visited_nodes.last() {
            self.last = Some(last.clone());
        }
    }

    pub fn layout(&self) -> BTreeMap<NodeId, Position> {
        layout(&self.nodes, &self.edges)
    }
}
