//! Sparse lexical search (BM25-style term overlap) over an in-memory corpus.

use std::collections::HashMap;

use super::types::{EvidenceItem, SourceType};

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// A document indexed for full-text search.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    terms: Vec<String>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// A minimal in-memory BM25 index. Stands in for a real full-text index
/// (e.g. SQLite FTS5) behind the same scoring contract.
#[derive(Debug, Default)]
pub struct LexicalIndex {
    docs: Vec<Document>,
    avg_len: f32,
    df: HashMap<String, usize>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<String>, text: impl Into<String>, url: Option<String>, domain: Option<String>) {
        let text = text.into();
        let terms = tokenize(&text);
        for term in terms.iter().collect::<std::collections::HashSet<_>>() {
            *self.df.entry(term.clone()).or_insert(0) += 1;
        }
        self.docs.push(Document {
            id: id.into(),
            text,
            url,
            domain,
            terms,
        });
        let total: usize = self.docs.iter().map(|d| d.terms.len()).sum();
        self.avg_len = total as f32 / self.docs.len() as f32;
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Score every document against the query and return the top `limit` as
    /// evidence items with raw (unnormalized) BM25 scores.
    pub fn search(&self, query: &str, domain: Option<&str>, limit: usize) -> Vec<EvidenceItem> {
        if self.docs.is_empty() {
            return Vec::new();
        }
        let q_terms = tokenize(query);
        let n = self.docs.len() as f32;

        let mut scored: Vec<(f32, &Document)> = self
            .docs
            .iter()
            .filter(|d| domain.map(|dom| d.domain.as_deref() == Some(dom)).unwrap_or(true))
            .map(|doc| {
                let len = doc.terms.len() as f32;
                let mut counts: HashMap<&str, usize> = HashMap::new();
                for t in &doc.terms {
                    *counts.entry(t.as_str()).or_insert(0) += 1;
                }
                let score: f32 = q_terms
                    .iter()
                    .map(|qt| {
                        let tf = *counts.get(qt.as_str()).unwrap_or(&0) as f32;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let df = *self.df.get(qt).unwrap_or(&1) as f32;
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * len / self.avg_len.max(1.0)))
                    })
                    .sum();
                (score, doc)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(limit)
            .map(|(score, doc)| EvidenceItem {
                item_id: doc.id.clone(),
                source_type: SourceType::Corpus,
                text: doc.text.chars().take(500).collect(),
                url: doc.url.clone(),
                score,
                provenance: format!("lexical:{}", doc.id),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_more_relevant_doc_higher() {
        let mut idx = LexicalIndex::new();
        idx.add("1", "The capital of France is Paris.", None, None);
        idx.add("2", "Bananas are a good source of potassium.", None, None);

        let results = idx.search("capital of France", None, 5);
        assert_eq!(results[0].item_id, "1");
    }

    #[test]
    fn empty_index_returns_empty() {
        let idx = LexicalIndex::new();
        assert!(idx.search("anything", None, 5).is_empty());
    }
}
