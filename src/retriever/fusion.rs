//! Score fusion across sparse, dense, and entity-boost signals (spec §4.1).

use serde::{Deserialize, Serialize};

/// Fusion weights, overridable per workspace via the policy overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionWeights {
    pub w_sparse: f32,
    pub w_dense: f32,
    pub w_entity: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            w_sparse: 0.4,
            w_dense: 0.5,
            w_entity: 0.1,
        }
    }
}

/// Min-max normalize a slice of scores into `[0,1]`. An all-equal slice
/// normalizes to all zeros rather than dividing by zero.
pub fn normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range <= f32::EPSILON {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / range).collect()
}

/// Fuse a single item's three normalized signals into one score.
pub fn fuse(weights: &FusionWeights, sparse: f32, dense: f32, entity_boost: f32) -> f32 {
    weights.w_sparse * sparse + weights.w_dense * dense + weights.w_entity * entity_boost
}
