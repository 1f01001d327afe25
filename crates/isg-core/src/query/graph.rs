//! Arena-backed graph index over addressable nodes.
//!
//! Nodes live in a `Vec` sorted by id, so an arena index orders exactly
//! like the id it stands for. Adjacency lists are undirected, sorted and
//! deduplicated; traversal follows edges in both directions.

use std::collections::{BTreeSet, HashMap};

use crate::errors::IsgResult;
use crate::models::{Edge, NodeId};
use crate::store::Database;

#[derive(Debug, Default)]
pub struct GraphIndex {
    ids: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
    adjacency: Vec<Vec<usize>>,
    edge_count: usize,
}

impl GraphIndex {
    /// Build from node ids and edges. Edges touching an unknown id (a
    /// pseudo-target, or a node outside `nodes`) are skipped.
    pub fn build(nodes: impl IntoIterator<Item = NodeId>, edges: &[Edge]) -> Self {
        let mut ids: Vec<NodeId> = nodes.into_iter().collect();
        ids.sort();
        ids.dedup();
        let index: HashMap<NodeId, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let mut adjacency = vec![Vec::new(); ids.len()];
        let mut edge_count = 0;
        for edge in edges {
            let (Some(&a), Some(&b)) = (index.get(&edge.source), index.get(&edge.target)) else {
                continue;
            };
            if a == b {
                continue;
            }
            adjacency[a].push(b);
            adjacency[b].push(a);
            edge_count += 1;
        }
        for list in &mut adjacency {
            list.sort_unstable();
            list.dedup();
        }
        Self {
            ids,
            index,
            adjacency,
            edge_count,
        }
    }

    /// Build from the store's addressable nodes and all of its edges.
    pub fn load(db: &Database) -> IsgResult<Self> {
        let nodes = db.l1_nodes()?;
        let edges = db.all_edges()?;
        Ok(Self::build(nodes.into_iter().map(|n| n.id), &edges))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Neighbours of `id` in id order.
    pub fn neighbours(&self, id: &NodeId) -> Vec<&NodeId> {
        self.index
            .get(id)
            .map(|&i| self.adjacency[i].iter().map(|&j| &self.ids[j]).collect())
            .unwrap_or_default()
    }

    /// Breadth-first expansion from `seeds`, both edge directions.
    ///
    /// Each hop admits at most `cap_per_hop` newly reached nodes, smallest
    /// ids first, so the result never exceeds `hop_limit * cap_per_hop`.
    /// Seeds are excluded from the result. Returns `(id, distance)` pairs
    /// in discovery order.
    pub fn bounded_bfs(
        &self,
        seeds: &[NodeId],
        hop_limit: usize,
        cap_per_hop: usize,
    ) -> Vec<(NodeId, usize)> {
        let mut visited = vec![false; self.ids.len()];
        let mut frontier: Vec<usize> = Vec::new();
        for seed in seeds {
            if let Some(&i) = self.index.get(seed) {
                if !visited[i] {
                    visited[i] = true;
                    frontier.push(i);
                }
            }
        }
        frontier.sort_unstable();

        let mut reached = Vec::new();
        for depth in 1..=hop_limit {
            if frontier.is_empty() || cap_per_hop == 0 {
                break;
            }
            let candidates: BTreeSet<usize> = frontier
                .iter()
                .flat_map(|&u| self.adjacency[u].iter().copied())
                .filter(|&v| !visited[v])
                .collect();
            let next: Vec<usize> = candidates.into_iter().take(cap_per_hop).collect();
            for &v in &next {
                visited[v] = true;
                reached.push((self.ids[v].clone(), depth));
            }
            frontier = next;
        }
        reached
    }
}
