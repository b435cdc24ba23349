//! Similarity index over job-description embeddings.
//!
//! The index only knows vector ids (`embedding_ref`) and vectors. Profile and
//! document-type filtering happen in the store after the query, because job
//! embeddings say nothing about which profile a document was generated from.

use std::cmp::Ordering;

use dashmap::DashMap;
use uuid::Uuid;

/// Swappable nearest-neighbour capability.
pub trait SimilarityIndex: Send + Sync {
    fn insert(&self, id: Uuid, vector: Vec<f32>);
    fn remove(&self, id: Uuid);
    /// Up to `k` `(id, cosine similarity)` pairs, best first.
    fn query(&self, vector: &[f32], k: usize) -> Vec<(Uuid, f32)>;
    fn len(&self) -> usize;
}

/// Exact cosine search over all stored vectors. Sharded, so inserts and
/// removals never block the whole index.
#[derive(Debug, Default)]
pub struct InMemorySimilarityIndex {
    vectors: DashMap<Uuid, Vec<f32>>,
}

impl InMemorySimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimilarityIndex for InMemorySimilarityIndex {
    fn insert(&self, id: Uuid, vector: Vec<f32>) {
        self.vectors.insert(id, vector);
    }

    fn remove(&self, id: Uuid) {
        self.vectors.remove(&id);
    }

    fn query(&self, vector: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        if k == 0 || vector.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(Uuid, f32)> = self
            .vectors
            .iter()
            .filter(|item| item.value().len() == vector.len())
            .map(|item| (*item.key(), cosine_similarity(vector, item.value())))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        scored
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` for mismatched, empty or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}
