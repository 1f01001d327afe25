//! Brute-force nearest-neighbour search over stored embeddings.

use std::collections::HashSet;

use crate::indexer::embedding::cosine_similarity;
use crate::models::NodeId;

#[derive(Clone, Debug, PartialEq)]
pub struct VectorHit {
    pub id: NodeId,
    pub similarity: f32,
}

/// Top `k` candidates by their best cosine similarity to any query vector,
/// highest first, ties by id. Ids in `exclude` are skipped; candidates with
/// no positive similarity are dropped.
pub fn nearest(
    queries: &[Vec<f32>],
    candidates: &[(NodeId, Vec<f32>)],
    k: usize,
    exclude: &HashSet<NodeId>,
) -> Vec<VectorHit> {
    if queries.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut hits: Vec<VectorHit> = candidates
        .iter()
        .filter(|(id, _)| !exclude.contains(id))
        .filter_map(|(id, vector)| {
            let best = queries
                .iter()
                .map(|q| cosine_similarity(q, vector))
                .fold(f32::MIN, f32::max);
            (best > 0.0).then(|| VectorHit {
                id: id.clone(),
                similarity: best,
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, v: &[f32]) -> (NodeId, Vec<f32>) {
        (NodeId::from(id), v.to_vec())
    }

    #[test]
    fn test_nearest_orders_by_similarity_then_id() {
        let candidates = vec![
            candidate("c", &[1.0, 0.0]),
            candidate("a", &[1.0, 0.0]),
            candidate("b", &[0.6, 0.8]),
            candidate("d", &[0.0, 1.0]),
            candidate("e", &[-1.0, 0.0]),
        ];
        let hits = nearest(&[vec![1.0, 0.0]], &candidates, 10, &HashSet::new());
        let order: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_nearest_respects_k_and_exclusions() {
        let candidates = vec![candidate("a", &[1.0]), candidate("b", &[1.0]), candidate("c", &[1.0])];
        let exclude: HashSet<NodeId> = [NodeId::from("a")].into_iter().collect();
        let hits = nearest(&[vec![1.0]], &candidates, 1, &exclude);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "b");
        assert!(nearest(&[], &candidates, 3, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_best_of_several_queries() {
        let candidates = vec![candidate("x", &[0.0, 1.0])];
        let hits = nearest(&[vec![1.0, 0.0], vec![0.0, 1.0]], &candidates, 5, &HashSet::new());
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }
}
