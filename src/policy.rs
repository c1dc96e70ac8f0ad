//! Workspace policy overlay (spec §6.5): a closed-key-set document that
//! tunes budgets, thresholds, and tool/table allowlists per workspace. Any
//! key outside the set is a deserialization error, not a silently-ignored
//! field — `#[serde(deny_unknown_fields)]` enforces the closed vocabulary a
//! workspace operator is allowed to touch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::retriever::fusion::FusionWeights;
use crate::types::error::{EngineError, PolicyError};
use crate::types::Domain;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyOverlay {
    pub accept_threshold: f32,
    pub borderline_delta: f32,
    pub max_refinements: u32,
    pub tool_budget_per_turn: u32,
    pub tool_budget_per_refinement: u32,
    pub tools_allowed: Vec<String>,
    pub tools_requiring_approval: Vec<String>,
    pub tables_allowed: Vec<String>,
    pub retriever_weights: FusionWeights,
    pub vector_backend: VectorBackendChoice,
    pub egress_require_tls: bool,
    pub egress_block_private_ips: bool,
    pub egress_max_redirects: u8,
    pub egress_max_payload_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackendChoice {
    #[default]
    InMemory,
    Qdrant,
}

impl Default for PolicyOverlay {
    fn default() -> Self {
        Self {
            accept_threshold: 0.7,
            borderline_delta: 0.1,
            max_refinements: 2,
            tool_budget_per_turn: 4,
            tool_budget_per_refinement: 2,
            tools_allowed: vec!["WEB_SEARCH".into(), "WEB_FETCH".into(), "MATH_EVAL".into(), "TABLE_QUERY".into()],
            tools_requiring_approval: Vec::new(),
            tables_allowed: vec!["memory".into(), "corpus".into()],
            retriever_weights: FusionWeights::default(),
            vector_backend: VectorBackendChoice::InMemory,
            egress_require_tls: true,
            egress_block_private_ips: true,
            egress_max_redirects: 3,
            egress_max_payload_bytes: 1_000_000,
        }
    }
}

impl PolicyOverlay {
    /// Validate field-level invariants that the type system can't express
    /// (thresholds in `[0,1]`, budgets nonzero).
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.accept_threshold) {
            return Err(PolicyError::InvalidValue {
                key: "accept_threshold".into(),
                reason: "must be in [0,1]".into(),
            }
            .into());
        }
        if !(0.0..=1.0).contains(&self.borderline_delta) {
            return Err(PolicyError::InvalidValue {
                key: "borderline_delta".into(),
                reason: "must be in [0,1]".into(),
            }
            .into());
        }
        if self.tool_budget_per_turn == 0 || self.tool_budget_per_refinement == 0 {
            return Err(PolicyError::InvalidValue {
                key: "tool_budget".into(),
                reason: "must be nonzero".into(),
            }
            .into());
        }
        Ok(())
    }

    /// Parse a TOML overlay document, rejecting unknown keys outright
    /// (rather than the `Internal` catch-all) so an operator typo surfaces
    /// as a clear `policy_denied`-class error.
    pub fn from_toml(raw: &str) -> Result<Self, EngineError> {
        let overlay: Self = toml::from_str(raw).map_err(|e| {
            EngineError::Policy(PolicyError::UnknownKey { key: e.to_string() })
        })?;
        overlay.validate()?;
        Ok(overlay)
    }

    pub fn check_tool_allowed(&self, tool: &str) -> Result<(), PolicyError> {
        if self.tools_allowed.iter().any(|t| t == tool) {
            Ok(())
        } else {
            Err(PolicyError::ToolNotAllowed { tool: tool.to_string() })
        }
    }

    pub fn check_table_allowed(&self, table: &str) -> Result<(), PolicyError> {
        if self.tables_allowed.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(PolicyError::TableNotAllowed { table: table.to_string() })
        }
    }

    pub fn requires_approval(&self, tool: &str) -> bool {
        self.tools_requiring_approval.iter().any(|t| t == tool)
    }
}

/// Per-workspace, per-domain overlay registry.
#[derive(Default)]
pub struct PolicyRegistry {
    overlays: HashMap<(String, Domain), PolicyOverlay>,
}

impl PolicyRegistry {
    pub fn set(&mut self, workspace: &str, domain: Domain, overlay: PolicyOverlay) {
        self.overlays.insert((workspace.to_string(), domain), overlay);
    }

    pub fn get(&self, workspace: &str, domain: &Domain) -> PolicyOverlay {
        self.overlays
            .get(&(workspace.to_string(), domain.clone()))
            .cloned()
            .unwrap_or_default()
    }
}
