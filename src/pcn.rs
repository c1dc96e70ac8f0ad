//! Proof-carrying numbers and the graph-of-verification (spec §3, §4.6 step
//! 5, design notes §9 "cyclic data → arena + indices").
//!
//! A PCN is a numeric/fact claim embedded in a draft as a placeholder token.
//! Before a draft can be emitted as `final`, every placeholder must resolve
//! to a verified value or be replaced with an explicit `unverified` marker —
//! never silently left as a raw token. GoV edges record which evidence or
//! tool output backs a PCN's resolution; because edges can reference each
//! other (a verification can cite another PCN), they live in a single
//! request-scoped arena keyed by id rather than as owned recursive types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::error::PcnError;
use crate::types::PcnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcnStatus {
    Pending,
    Verified,
    Unverified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pcn {
    pub id: PcnId,
    pub claim: String,
    pub status: PcnStatus,
    pub value: Option<String>,
    pub unit: Option<String>,
}

/// A single edge in the graph-of-verification: `pcn` is backed by
/// `source`, which is either a pack item id or another PCN id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovEdge {
    pub pcn: PcnId,
    pub source: GovSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GovSource {
    Evidence { item_id: String },
    Tool { tool_name: String, call_summary: String },
    Pcn { id: PcnId },
}

/// The governance delta reported alongside a PCN event: whether every minted
/// node in the arena currently verifies, and the claims of those that don't.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDelta {
    pub ok: bool,
    pub failing: Vec<String>,
}

/// A per-request arena owning all PCNs and GoV edges minted during
/// refinement. Dropped with the request; nothing here outlives one answer.
#[derive(Default)]
pub struct PcnArena {
    nodes: HashMap<PcnId, Pcn>,
    edges: Vec<GovEdge>,
}

impl PcnArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&mut self, claim: impl Into<String>) -> PcnId {
        let id = PcnId::new();
        self.nodes.insert(
            id,
            Pcn {
                id,
                claim: claim.into(),
                status: PcnStatus::Pending,
                value: None,
                unit: None,
            },
        );
        id
    }

    pub fn add_edge(&mut self, pcn: PcnId, source: GovSource) {
        self.edges.push(GovEdge { pcn, source });
    }

    pub fn resolve(&mut self, id: PcnId, value: String, unit: Option<String>) -> Result<(), PcnError> {
        let node = self.nodes.get_mut(&id).ok_or(PcnError::Failed {
            id,
            reason: "unknown pcn".into(),
        })?;
        if node.status != PcnStatus::Pending {
            return Err(PcnError::AlreadyResolved { id });
        }
        node.status = PcnStatus::Verified;
        node.value = Some(value);
        node.unit = unit;
        Ok(())
    }

    /// Mark a PCN as unable to be verified. Per spec invariant 3 this is
    /// still a terminal, explicit state — never a silent pass-through.
    pub fn mark_unverified(&mut self, id: PcnId, reason: &str) -> Result<(), PcnError> {
        let node = self.nodes.get_mut(&id).ok_or(PcnError::Failed {
            id,
            reason: reason.to_string(),
        })?;
        if node.status == PcnStatus::Verified {
            return Err(PcnError::AlreadyResolved { id });
        }
        node.status = PcnStatus::Unverified;
        Ok(())
    }

    pub fn get(&self, id: PcnId) -> Option<&Pcn> {
        self.nodes.get(&id)
    }

    pub fn edges_for(&self, id: PcnId) -> impl Iterator<Item = &GovEdge> {
        self.edges.iter().filter(move |e| e.pcn == id)
    }

    /// True once every minted PCN has left the `Pending` state — the
    /// precondition for substituting placeholders and emitting `final`.
    pub fn all_resolved(&self) -> bool {
        self.nodes.values().all(|n| n.status != PcnStatus::Pending)
    }

    /// The governance delta as of right now: `ok` iff every minted PCN is
    /// `Verified`; `failing` lists the claims of every node that is still
    /// `Pending` or ended up `Unverified`.
    pub fn dag_delta(&self) -> DagDelta {
        let failing: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.status != PcnStatus::Verified)
            .map(|n| n.claim.clone())
            .collect();
        DagDelta { ok: failing.is_empty(), failing }
    }

    /// Substitute every `{{pcn:<id>}}` placeholder in `text` with its
    /// resolved value, or the literal `unverified` marker.
    pub fn substitute(&self, text: &str, placeholders: &[crate::composer::Placeholder]) -> String {
        let mut out = text.to_string();
        for p in placeholders {
            let replacement = match self.nodes.get(&p.pcn_id) {
                Some(node) if node.status == PcnStatus::Verified => {
                    node.value.clone().unwrap_or_else(|| "unverified".to_string())
                }
                _ => "unverified".to_string(),
            };
            out = out.replace(&p.token, &replacement);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_resolve_and_substitute() {
        let mut arena = PcnArena::new();
        let id = arena.mint("distance between A and B");
        arena.add_edge(id, GovSource::Tool { tool_name: "MATH_EVAL".into(), call_summary: "12km + 3km".into() });
        arena.resolve(id, "15".into(), Some("km".into())).unwrap();

        let placeholder = crate::composer::Placeholder { pcn_id: id, token: "{{pcn:1}}".into() };
        let text = arena.substitute("The distance is {{pcn:1}}.", &[placeholder]);
        assert_eq!(text, "The distance is 15.");
        assert!(arena.all_resolved());
    }

    #[test]
    fn unresolved_pcn_substitutes_to_unverified() {
        let mut arena = PcnArena::new();
        let id = arena.mint("unknown claim");
        let placeholder = crate::composer::Placeholder { pcn_id: id, token: "{{pcn:1}}".into() };
        let text = arena.substitute("Value: {{pcn:1}}", &[placeholder]);
        assert_eq!(text, "Value: unverified");
        assert!(!arena.all_resolved());
    }

    #[test]
    fn resolve_twice_errors() {
        let mut arena = PcnArena::new();
        let id = arena.mint("x");
        arena.resolve(id, "1".into(), None).unwrap();
        let err = arena.resolve(id, "2".into(), None).unwrap_err();
        assert!(matches!(err, PcnError::AlreadyResolved { .. }));
    }

    #[test]
    fn dag_delta_reports_failing_claims() {
        let mut arena = PcnArena::new();
        let resolved = arena.mint("distance");
        arena.resolve(resolved, "15".into(), Some("km".into())).unwrap();
        let pending = arena.mint("elevation");
        let delta = arena.dag_delta();
        assert!(!delta.ok);
        assert_eq!(delta.failing, vec!["elevation".to_string()]);
        let _ = pending;
    }

    #[test]
    fn mark_unverified_then_resolve_is_rejected_after_verified() {
        let mut arena = PcnArena::new();
        let id = arena.mint("x");
        arena.resolve(id, "1".into(), None).unwrap();
        let err = arena.mark_unverified(id, "late").unwrap_err();
        assert!(matches!(err, PcnError::AlreadyResolved { .. }));
    }
}
