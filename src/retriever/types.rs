//! Evidence items and packs produced by the retriever (spec §4.1, §3).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Domain;

/// Where an evidence item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Memory,
    Corpus,
    Vector,
}

/// A single piece of retrieved evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub item_id: String,
    pub source_type: SourceType,
    /// Snippet truncated to the configured max length.
    pub text: String,
    pub url: Option<String>,
    pub score: f32,
    pub provenance: String,
}

impl EvidenceItem {
    /// Normalized content hash used for de-duplication (by URL when present,
    /// else by normalized text).
    pub fn content_hash(&self) -> String {
        let key = self
            .url
            .clone()
            .unwrap_or_else(|| self.text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" "));
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Query-time filters narrowing retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalFilters {
    pub domain: Option<Domain>,
    pub source_type: Option<SourceType>,
}

/// An ordered, budget-truncated set of evidence items grounding a draft.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pack {
    pub items: Vec<EvidenceItem>,
}

impl Pack {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pack_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.item_id.clone()).collect()
    }

    pub fn top(&self) -> Option<&EvidenceItem> {
        self.items.first()
    }
}
