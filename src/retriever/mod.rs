//! Hybrid retriever (spec §4.1): fuses lexical and dense signals into an
//! ordered, budget-truncated `Pack` of evidence. Never fails the request —
//! degrades to an empty pack with an issue on corpus/backend trouble.

pub mod fusion;
pub mod lexical;
pub mod types;
pub mod vector;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use self::fusion::FusionWeights;
use self::lexical::LexicalIndex;
use self::types::{EvidenceItem, Pack, RetrievalFilters};
use self::vector::{Embedder, HashEmbedder, VectorBackend};
use crate::types::error::EngineResult;

/// A single recent memory item attached to a workspace/domain.
#[derive(Debug, Clone)]
pub struct MemoryItem {
    pub id: String,
    pub text: String,
    pub domain: Option<String>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

/// Everything the hybrid retriever needs: a lexical index, a vector backend,
/// an embedder, and recent memory. All are injected so tests can swap in
/// empty/degraded implementations.
pub struct HybridRetriever {
    pub lexical: Arc<LexicalIndex>,
    pub vector: Arc<dyn VectorBackend>,
    pub embedder: Arc<dyn Embedder>,
    pub memory: Arc<parking_lot::RwLock<Vec<MemoryItem>>>,
    pub weights: FusionWeights,
}

impl HybridRetriever {
    pub fn new(lexical: Arc<LexicalIndex>, vector: Arc<dyn VectorBackend>) -> Self {
        Self {
            lexical,
            vector,
            embedder: Arc::new(HashEmbedder::default()),
            memory: Arc::new(parking_lot::RwLock::new(Vec::new())),
            weights: FusionWeights::default(),
        }
    }

    /// Retrieve an ordered pack of at most `memory_budget` items for `question`.
    ///
    /// Never returns `Err` for retrieval degradation — a missing or
    /// unavailable vector backend simply degrades to sparse-only and is
    /// logged once; an empty corpus yields an empty pack.
    pub async fn retrieve(
        &self,
        question: &str,
        memory_budget: usize,
        filters: &RetrievalFilters,
    ) -> EngineResult<Pack> {
        if question.trim().is_empty() {
            return Err(crate::types::error::EngineError::Validation(
                "question must not be empty".into(),
            ));
        }
        let memory_budget = memory_budget.clamp(1, 32);

        let domain_filter = filters.domain.as_ref().map(|d| d.0.as_str());

        let sparse = self.lexical.search(question, domain_filter, memory_budget * 2);

        let dense = if self.vector.is_available() {
            let q_emb = self.embedder.embed(question);
            self.vector.search(&q_emb, memory_budget * 2).await
        } else {
            warn!("vector backend unavailable, degrading to sparse-only retrieval");
            Vec::new()
        };

        let recent_memory: Vec<EvidenceItem> = self
            .memory
            .read()
            .iter()
            .filter(|m| domain_filter.map(|d| m.domain.as_deref() == Some(d)).unwrap_or(true))
            .take(memory_budget)
            .map(|m| EvidenceItem {
                item_id: m.id.clone(),
                source_type: types::SourceType::Memory,
                text: m.text.chars().take(500).collect(),
                url: None,
                score: 1.0,
                provenance: format!("memory:{}", m.id),
            })
            .collect();

        let sparse_scores = fusion::normalize(&sparse.iter().map(|e| e.score).collect::<Vec<_>>());
        let dense_scores = fusion::normalize(&dense.iter().map(|e| e.score).collect::<Vec<_>>());

        // Merge sparse and dense hits on the same item before fusing, so an
        // item found by both signals gets credit for both rather than being
        // fused twice with the other half zeroed out.
        let mut by_hash: std::collections::HashMap<String, (EvidenceItem, f32, f32)> = std::collections::HashMap::new();
        for (item, norm_score) in sparse.into_iter().zip(sparse_scores) {
            let hash = item.content_hash();
            let entry = by_hash.entry(hash).or_insert_with(|| (item.clone(), 0.0, 0.0));
            entry.1 = entry.1.max(norm_score);
        }
        for (item, norm_score) in dense.into_iter().zip(dense_scores) {
            let hash = item.content_hash();
            let entry = by_hash.entry(hash).or_insert_with(|| (item.clone(), 0.0, 0.0));
            entry.2 = entry.2.max(norm_score);
        }

        let mut fused: Vec<EvidenceItem> = by_hash
            .into_values()
            .map(|(mut item, sparse_score, dense_score)| {
                item.score = fusion::fuse(&self.weights, sparse_score, dense_score, 0.0);
                item
            })
            .collect();
        for item in recent_memory {
            fused.push(item);
        }

        if let Some(st) = filters.source_type {
            fused.retain(|i| i.source_type == st);
        }

        // Deduplicate by content hash, keeping the highest-scored copy.
        let mut seen: HashSet<String> = HashSet::new();
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        fused.retain(|item| seen.insert(item.content_hash()));

        fused.truncate(memory_budget);

        Ok(Pack { items: fused })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::vector::InMemoryFlatIndex;

    fn make_retriever() -> HybridRetriever {
        let mut lex = LexicalIndex::new();
        lex.add("1", "X is Y.", None, Some("default".into()));
        HybridRetriever::new(Arc::new(lex), Arc::new(InMemoryFlatIndex::new()))
    }

    #[tokio::test]
    async fn retrieves_and_orders_pack() {
        let retriever = make_retriever();
        let pack = retriever
            .retrieve("What is X?", 5, &RetrievalFilters::default())
            .await
            .unwrap();
        assert!(!pack.is_empty());
        assert_eq!(pack.top().unwrap().item_id, "1");
    }

    #[tokio::test]
    async fn empty_corpus_yields_empty_pack() {
        let retriever = HybridRetriever::new(Arc::new(LexicalIndex::new()), Arc::new(InMemoryFlatIndex::new()));
        let pack = retriever
            .retrieve("anything", 5, &RetrievalFilters::default())
            .await
            .unwrap();
        assert!(pack.is_empty());
    }

    #[tokio::test]
    async fn rejects_empty_question() {
        let retriever = make_retriever();
        let err = retriever
            .retrieve("", 5, &RetrievalFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::types::error::EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn truncates_to_budget() {
        let mut lex = LexicalIndex::new();
        for i in 0..10 {
            lex.add(format!("{i}"), "apple apple apple", None, None);
        }
        let retriever = HybridRetriever::new(Arc::new(lex), Arc::new(InMemoryFlatIndex::new()));
        let pack = retriever
            .retrieve("apple", 3, &RetrievalFilters::default())
            .await
            .unwrap();
        assert_eq!(pack.items.len(), 3);
    }
}
