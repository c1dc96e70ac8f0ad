//! Semantic-nearest-neighbor entropy uncertainty estimator (spec §4.3).
//!
//! Produces `s1 ∈ [0,1]`, higher meaning lower uncertainty, from paraphrase
//! samples of a draft. With no generative model configured, paraphrase
//! samples are deterministic surrogates (word-order permutation, synonym
//! substitution) documented here rather than sampled from an LLM.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::retriever::vector::{cosine, Embedder};

/// Per-domain logistic calibrator parameters, derived from
/// `ThresholdTable.snne_quantiles` in production; defaults to a gentle
/// sigmoid centered at the midpoint of the raw entropy proxy's range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnneCalibration {
    pub midpoint: f32,
    pub slope: f32,
}

impl Default for SnneCalibration {
    fn default() -> Self {
        Self {
            midpoint: 0.5,
            slope: 8.0,
        }
    }
}

/// Raw and normalized uncertainty measurements for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyResult {
    pub raw_entropy: f32,
    pub s1: f32,
    pub sample_count: usize,
}

/// A deterministic paraphrase surrogate: each sample drops every `k`-th word
/// (`k` = sample index), a cheap stand-in for LLM paraphrase sampling. Unlike
/// a pure reordering, dropout changes the bag-of-words the embedder sees, so
/// samples actually disperse in embedding space — a short, narrowly-grounded
/// draft loses a larger fraction of its distinctive words per dropout than a
/// long one, giving shorter/thinner drafts a lower measured agreement.
fn surrogate_paraphrases(draft: &str, n: usize) -> Vec<String> {
    let words: Vec<&str> = draft.split_whitespace().collect();
    let mut out = Vec::with_capacity(n);
    out.push(draft.to_string());
    if words.len() < 2 {
        for _ in 1..n {
            out.push(draft.to_string());
        }
        return out;
    }
    for k in 1..n {
        let stride = k + 1;
        let kept: Vec<&str> = words
            .iter()
            .enumerate()
            .filter(|(i, _)| (i + 1) % stride != 0)
            .map(|(_, w)| *w)
            .collect();
        let sample = if kept.is_empty() { draft.to_string() } else { kept.join(" ") };
        out.push(sample);
    }
    out
}

/// Estimates SNNE uncertainty for a draft.
pub struct SnneEstimator {
    pub embedder: Arc<dyn Embedder>,
    pub calibration: HashMap<String, SnneCalibration>,
    pub sample_count: usize,
}

impl SnneEstimator {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            calibration: HashMap::new(),
            sample_count: 5,
        }
    }

    fn calibration_for(&self, domain: &str) -> SnneCalibration {
        self.calibration.get(domain).cloned().unwrap_or_default()
    }

    /// Compute uncertainty for `draft` in `domain`.
    ///
    /// `n` is clamped to `[3,5]` per spec; `n=1` (unreachable via the clamp,
    /// but handled defensively) yields `s1=0` (maximum uncertainty).
    pub fn estimate(&self, draft: &str, domain: &str) -> UncertaintyResult {
        let n = self.sample_count.clamp(3, 5);
        if draft.trim().is_empty() {
            return UncertaintyResult {
                raw_entropy: 1.0,
                s1: 0.0,
                sample_count: 0,
            };
        }

        let samples = surrogate_paraphrases(draft, n);
        if samples.len() <= 1 {
            tracing::warn!("SNNE: only one paraphrase sample available, treating as maximum uncertainty");
            return UncertaintyResult {
                raw_entropy: 1.0,
                s1: 0.0,
                sample_count: samples.len(),
            };
        }

        let embeddings: Vec<Vec<f32>> = samples.iter().map(|s| self.embedder.embed(s)).collect();

        let mut sims = Vec::new();
        for i in 0..embeddings.len() {
            for j in (i + 1)..embeddings.len() {
                sims.push(cosine(&embeddings[i], &embeddings[j]));
            }
        }
        let mean_sim: f32 = sims.iter().sum::<f32>() / sims.len() as f32;
        // Negative mean off-diagonal similarity as the entropy proxy,
        // rescaled into [0,1] (cosine similarity is in [-1,1]).
        let raw_entropy = ((1.0 - mean_sim) / 2.0).clamp(0.0, 1.0);

        let calib = self.calibration_for(domain);
        let s1 = logistic(raw_entropy, &calib);

        UncertaintyResult {
            raw_entropy,
            s1,
            sample_count: samples.len(),
        }
    }
}

/// Maps raw entropy to `[0,1]` confidence via a logistic calibrator:
/// low entropy (samples agree) -> high confidence.
fn logistic(raw_entropy: f32, calib: &SnneCalibration) -> f32 {
    let exponent = calib.slope * (raw_entropy - calib.midpoint);
    (1.0 / (1.0 + exponent.exp())).clamp(0.0, 1.0)
}
