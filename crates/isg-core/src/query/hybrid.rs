//! Hybrid retrieval: bounded graph expansion merged with vector search.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RetrievalDefaults;
use crate::errors::{IsgError, IsgResult};
use crate::indexer::embedding::EmbeddingEncoder;
use crate::models::{NodeFilter, NodeId};
use crate::query::graph::GraphIndex;
use crate::query::guards::{
    ensure_within, truncate_query, MAX_CAP_PER_HOP, MAX_HOP_LIMIT, MAX_K, MAX_SEEDS,
};
use crate::query::planner::{cache_key, CacheMode, CacheStats, QueryPlanner};
use crate::query::vector::{nearest, VectorHit};
use crate::store::Database;

/// A retrieval request. Unset parameters take the configured defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalRequest {
    pub seeds: Vec<NodeId>,
    /// Free text encoded and searched alongside the seeds' embeddings.
    pub query: Option<String>,
    pub hop_limit: Option<usize>,
    pub cap_per_hop: Option<usize>,
    pub k: Option<usize>,
    pub confidence_floor: Option<f64>,
    pub filter: NodeFilter,
}

impl RetrievalRequest {
    pub fn from_seeds(seeds: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            seeds: seeds.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Request parameters after defaults and budget checks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetrievalParams {
    pub hop_limit: usize,
    pub cap_per_hop: usize,
    pub k: usize,
    pub confidence_floor: f64,
    pub graph_weight: f64,
    pub vector_weight: f64,
}

impl RetrievalParams {
    pub fn resolve(request: &RetrievalRequest, defaults: &RetrievalDefaults) -> IsgResult<Self> {
        let params = Self {
            hop_limit: request.hop_limit.unwrap_or(defaults.hop_limit),
            cap_per_hop: request.cap_per_hop.unwrap_or(defaults.cap_per_hop),
            k: request.k.unwrap_or(defaults.k),
            confidence_floor: request.confidence_floor.unwrap_or(defaults.confidence_floor),
            graph_weight: defaults.graph_weight,
            vector_weight: defaults.vector_weight,
        };
        ensure_within("seeds", request.seeds.len(), MAX_SEEDS)?;
        ensure_within("hop_limit", params.hop_limit, MAX_HOP_LIMIT)?;
        ensure_within("cap_per_hop", params.cap_per_hop, MAX_CAP_PER_HOP)?;
        ensure_within("k", params.k, MAX_K)?;
        if !(0.0..=1.0).contains(&params.confidence_floor) {
            return Err(IsgError::Config(format!(
                "confidence_floor must be within [0, 1], got {}",
                params.confidence_floor
            )));
        }
        Ok(params)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedNode {
    pub id: NodeId,
    pub score: f64,
    /// Hops from the nearest seed, when reached by the graph phase.
    pub graph_distance: Option<usize>,
    /// Best cosine similarity, when found by the vector phase.
    pub similarity: Option<f32>,
    pub confidence: f64,
}

/// Combine graph and vector hits: dedupe by id, drop nodes under the
/// confidence floor (and nodes no longer stored), rank by
/// `graph_weight / distance + vector_weight * similarity`, ties by id.
pub fn merge(
    graph_hits: &[(NodeId, usize)],
    vector_hits: &[VectorHit],
    confidence: &HashMap<NodeId, f64>,
    params: &RetrievalParams,
) -> Vec<RankedNode> {
    let mut merged: HashMap<&NodeId, (Option<usize>, Option<f32>)> = HashMap::new();
    for (id, distance) in graph_hits {
        let slot = merged.entry(id).or_default();
        slot.0 = Some(slot.0.map_or(*distance, |d| d.min(*distance)));
    }
    for hit in vector_hits {
        let slot = merged.entry(&hit.id).or_default();
        slot.1 = Some(slot.1.map_or(hit.similarity, |s| s.max(hit.similarity)));
    }

    let mut ranked: Vec<RankedNode> = merged
        .into_iter()
        .filter_map(|(id, (distance, similarity))| {
            let node_confidence = *confidence.get(id)?;
            if node_confidence < params.confidence_floor {
                return None;
            }
            let graph_score = distance.map_or(0.0, |d| 1.0 / d.max(1) as f64);
            let vector_score = similarity.map_or(0.0, |s| s as f64);
            Some(RankedNode {
                id: id.clone(),
                score: params.graph_weight * graph_score + params.vector_weight * vector_score,
                graph_distance: distance,
                similarity,
                confidence: node_confidence,
            })
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    ranked
}

/// Read-only retrieval over the store. The graph index is rebuilt lazily
/// whenever the store's cache epoch moves.
pub struct RetrievalEngine {
    db: Database,
    encoder: Arc<dyn EmbeddingEncoder>,
    defaults: RetrievalDefaults,
    graph: Mutex<Option<(i64, Arc<GraphIndex>)>>,
    planner: QueryPlanner<Vec<RankedNode>>,
}

impl RetrievalEngine {
    pub fn new(db: Database, encoder: Arc<dyn EmbeddingEncoder>, defaults: RetrievalDefaults) -> Self {
        let planner = QueryPlanner::new(defaults.cache_entries, defaults.cache_ttl_seconds);
        Self {
            db,
            encoder,
            defaults,
            graph: Mutex::new(None),
            planner,
        }
    }

    /// The graph index for `epoch`, rebuilding it if the store has moved.
    pub fn graph_index(&self, epoch: i64) -> IsgResult<Arc<GraphIndex>> {
        let mut slot = self.graph.lock();
        if let Some((built_at, graph)) = slot.as_ref() {
            if *built_at == epoch {
                return Ok(Arc::clone(graph));
            }
        }
        let graph = Arc::new(GraphIndex::load(&self.db)?);
        debug!(
            "graph index rebuilt at epoch {epoch}: {} nodes, {} edges",
            graph.len(),
            graph.edge_count()
        );
        *slot = Some((epoch, Arc::clone(&graph)));
        Ok(graph)
    }

    pub fn retrieve(&self, request: &RetrievalRequest) -> IsgResult<Vec<RankedNode>> {
        self.retrieve_traced(request).map(|(ranked, _)| ranked)
    }

    /// Like [`retrieve`](Self::retrieve), also reporting whether the result
    /// came from the cache.
    pub fn retrieve_traced(
        &self,
        request: &RetrievalRequest,
    ) -> IsgResult<(Vec<RankedNode>, CacheMode)> {
        let params = RetrievalParams::resolve(request, &self.defaults)?;
        for seed in &request.seeds {
            match self.db.get_node(seed)? {
                None => return Err(IsgError::NodeNotFound(seed.clone())),
                Some(node) if !node.is_addressable() => {
                    return Err(IsgError::NotAddressable(seed.clone()))
                }
                Some(_) => {}
            }
        }
        let epoch = self.db.cache_epoch()?;
        let key = cache_key("retrieve", epoch, &(request, &params))?;
        self.planner
            .get_or_compute(key, || self.compute(request, &params, epoch))
    }

    fn compute(
        &self,
        request: &RetrievalRequest,
        params: &RetrievalParams,
        epoch: i64,
    ) -> IsgResult<Vec<RankedNode>> {
        let graph = self.graph_index(epoch)?;
        let graph_hits = graph.bounded_bfs(&request.seeds, params.hop_limit, params.cap_per_hop);

        let mut vector_hits = Vec::new();
        if params.k > 0 {
            let identity = self.encoder.identity();
            let mut queries = Vec::new();
            for seed in &request.seeds {
                if let Some(vector) = self.db.embedding_for(identity, seed)? {
                    queries.push(vector);
                }
            }
            if let Some(text) = request.query.as_deref() {
                let text = truncate_query(text);
                if !text.is_empty() {
                    queries.push(self.encoder.encode(&text)?);
                }
            }
            if !queries.is_empty() {
                let candidates = self.db.load_embeddings(identity, &request.filter)?;
                let exclude: HashSet<NodeId> = request.seeds.iter().cloned().collect();
                vector_hits = nearest(&queries, &candidates, params.k, &exclude);
            }
        }

        let mut wanted: Vec<NodeId> = graph_hits.iter().map(|(id, _)| id.clone()).collect();
        wanted.extend(vector_hits.iter().map(|h| h.id.clone()));
        wanted.sort();
        wanted.dedup();
        let confidence: HashMap<NodeId, f64> = self
            .db
            .get_nodes(&wanted)?
            .into_iter()
            .map(|n| (n.id, n.confidence))
            .collect();

        let ranked = merge(&graph_hits, &vector_hits, &confidence, params);
        debug!(
            "retrieval: {} graph hit(s), {} vector hit(s), {} ranked",
            graph_hits.len(),
            vector_hits.len(),
            ranked.len()
        );
        Ok(ranked)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.planner.stats()
    }
}
