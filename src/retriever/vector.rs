//! Dense vector search over embeddings.
//!
//! `VectorBackend` is the seam the spec calls out: "in-memory flat, ANN, or
//! external". The always-available implementation is a flat in-memory index
//! with cosine similarity; an external backend (e.g. Qdrant) can be plugged
//! in behind the `vector-qdrant` feature without changing callers.

use async_trait::async_trait;

use super::types::{EvidenceItem, SourceType};

/// A stored vector entry.
#[derive(Debug, Clone)]
struct VectorEntry {
    id: String,
    text: String,
    url: Option<String>,
    embedding: Vec<f32>,
}

/// Backend-agnostic dense retrieval.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Return the top `limit` nearest neighbors to `query_embedding`.
    async fn search(&self, query_embedding: &[f32], limit: usize) -> Vec<EvidenceItem>;

    /// Whether the backend is currently reachable / configured.
    fn is_available(&self) -> bool;
}

/// A trivial deterministic embedder used when no real embedding model is
/// configured: a bag-of-character-ngram hash projected into a fixed
/// dimension. Good enough to produce stable cosine similarities for tests
/// and for the extractive-fallback composer; a real deployment swaps this
/// for a model-backed embedder behind the same trait.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
    fn dim(&self) -> usize;
}

pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            use std::hash::{Hash, Hasher};
            token.hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dim;
            v[idx] += 1.0;
        }
        normalize(&mut v);
        v
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// In-memory flat vector index. Always available.
#[derive(Default)]
pub struct InMemoryFlatIndex {
    entries: parking_lot::RwLock<Vec<VectorEntry>>,
}

impl InMemoryFlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, text: impl Into<String>, url: Option<String>, embedding: Vec<f32>) {
        self.entries.write().push(VectorEntry {
            id: id.into(),
            text: text.into(),
            url,
            embedding,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorBackend for InMemoryFlatIndex {
    async fn search(&self, query_embedding: &[f32], limit: usize) -> Vec<EvidenceItem> {
        let entries = self.entries.read();
        let mut scored: Vec<(f32, &VectorEntry)> = entries
            .iter()
            .map(|e| (cosine(query_embedding, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(limit)
            .map(|(score, e)| EvidenceItem {
                item_id: e.id.clone(),
                source_type: SourceType::Vector,
                text: e.text.chars().take(500).collect(),
                url: e.url.clone(),
                score,
                provenance: format!("vector:{}", e.id),
            })
            .collect()
    }

    fn is_available(&self) -> bool {
        true
    }
}
