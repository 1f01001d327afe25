//! Embedding encoders for interface nodes.
//!
//! Vectors are keyed by `(node, encoder identity)` and tagged with the
//! node's content hash; a node is re-encoded only when that hash moves.

use crate::errors::{IsgError, IsgResult};
use crate::models::InterfaceNode;
use crate::query::tokenizer::identifier_tokens;

pub trait EmbeddingEncoder: Send + Sync {
    /// Stable identity stored alongside each vector. Changing it
    /// invalidates every stored embedding for the encoder.
    fn identity(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn encode(&self, text: &str) -> IsgResult<Vec<f32>>;
}

/// The text an encoder sees for a node.
pub fn embedding_text(node: &InterfaceNode, code: &str) -> String {
    format!(
        "{} {} {}\n{}",
        node.kind,
        node.symbol,
        node.best_signature(),
        code
    )
}

pub const HASHING_DIMENSIONS: usize = 256;

/// Feature-hashing encoder over identifier tokens: each token lands in a
/// crc32 bucket with a hash-derived sign; the result is L2-normalised.
/// Deterministic and dependency-free, so it doubles as the default encoder.
#[derive(Clone, Debug)]
pub struct HashingEncoder {
    dimensions: usize,
    identity: String,
}

impl HashingEncoder {
    pub fn new(dimensions: usize) -> IsgResult<Self> {
        if dimensions == 0 {
            return Err(IsgError::Config(
                "embedding dimensions must be positive".to_string(),
            ));
        }
        Ok(Self {
            dimensions,
            identity: format!("hashing-v1-{dimensions}"),
        })
    }
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self {
            dimensions: HASHING_DIMENSIONS,
            identity: format!("hashing-v1-{HASHING_DIMENSIONS}"),
        }
    }
}

impl EmbeddingEncoder for HashingEncoder {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode(&self, text: &str) -> IsgResult<Vec<f32>> {
        let mut vector = vec![0f32; self.dimensions];
        for token in identifier_tokens(text) {
            let hash = crc32fast::hash(token.as_bytes());
            let bucket = (hash as usize) % self.dimensions;
            let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// Cosine similarity; zero when either side is empty, zero-norm or the
/// dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_encoder_is_deterministic_and_normalised() {
        let encoder = HashingEncoder::default();
        assert_eq!(encoder.identity(), "hashing-v1-256");
        let a = encoder.encode("fn parse_token(input: &str) -> Token").unwrap();
        let b = encoder.encode("fn parse_token(input: &str) -> Token").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_text_scores_higher() {
        let encoder = HashingEncoder::default();
        let query = encoder.encode("parse token").unwrap();
        let close = encoder.encode("fn parse_token(input: &str) -> Token").unwrap();
        let far = encoder.encode("fn open_database(path: PathBuf) -> Connection").unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_and_mismatched_dimensions() {
        let encoder = HashingEncoder::new(8).unwrap();
        let empty = encoder.encode("").unwrap();
        assert!(empty.iter().all(|v| *v == 0.0));
        assert_eq!(cosine_similarity(&empty, &empty), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!(HashingEncoder::new(0).is_err());
    }
}
