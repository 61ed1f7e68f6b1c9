//! Approximate-nearest-neighbor index over fixed-dimension vectors.
//!
//! The contract is a brute-force cosine-similarity scan over every stored
//! vector; a graph-based index is a permitted optimization behind the same
//! interface. Results come back in non-increasing score order with ties
//! broken by ascending document id.

use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Default vector dimensionality.
pub const DEFAULT_DIMENSIONS: usize = 768;

/// Default number of neighbors returned.
pub const DEFAULT_LIMIT: usize = 10;

/// Payload field holding the embedding.
pub const VECTOR_FIELD: &str = "vector";

/// In-memory body of an ANN index.
#[derive(Debug)]
pub struct AnnIndex {
    dimensions: usize,
    /// document id -> embedding
    vectors: HashMap<String, Vec<f32>>,
}

/// Extract an embedding from a payload's `vector` field.
pub(crate) fn extract_vector(payload: &serde_json::Map<String, JsonValue>) -> Option<Vec<f32>> {
    let items = payload.get(VECTOR_FIELD)?.as_array()?;
    let data: Vec<f32> = items
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();
    if data.len() == items.len() && !data.is_empty() {
        Some(data)
    } else {
        None
    }
}

/// Cosine similarity; mismatched lengths and zero vectors score 0.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl AnnIndex {
    pub fn new(dimensions: Option<usize>) -> Self {
        Self {
            dimensions: dimensions.unwrap_or(DEFAULT_DIMENSIONS),
            vectors: HashMap::new(),
        }
    }

    /// Configured dimensionality.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Store a document's embedding.
    pub fn insert(&mut self, id: &str, vector: Vec<f32>) {
        self.vectors.insert(id.to_string(), vector);
    }

    /// Drop a document's embedding.
    pub fn remove(&mut self, id: &str) {
        self.vectors.remove(id);
    }

    /// Score every stored vector against the query and return the top ids.
    pub fn search(&self, query: &[f32], limit: Option<usize>) -> Vec<(String, f32)> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        let mut scored: Vec<(String, f32)> = self
            .vectors
            .iter()
            .map(|(id, vector)| (id.clone(), cosine_similarity(query, vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        scored
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}
