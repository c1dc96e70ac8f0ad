//! Structured verifier (spec §4.4): rule-engine scoring of a draft against
//! its grounding pack and PCN/GoV state, producing `s2`, issues, and
//! `needs_fix`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::composer::Draft;
use crate::retriever::types::Pack;

/// The kinds of issues the verifier can raise (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingCitations,
    NumericUnverified,
    Governance,
    UnsupportedClaim,
    InjectionSuspected,
    UnitMismatch,
    SqlViolation,
    MissingEvidence,
    ApprovalDenied,
    ApprovalExpired,
    VerifierDegenerate,
}

impl IssueKind {
    /// Whether refinement tooling could plausibly resolve this issue
    /// (spec §4.5 tie-break, §4.6 step 1 tool-selection priority).
    pub fn is_fixable(&self) -> bool {
        matches!(
            self,
            IssueKind::MissingEvidence | IssueKind::NumericUnverified | IssueKind::Governance
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierResult {
    pub s2: f32,
    pub issues: Vec<Issue>,
    pub needs_fix: bool,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, draft: &Draft, pack: &Pack) -> VerifierResult;
}

/// Rule-engine verifier covering citation coverage, unresolved numeric
/// placeholders, and (future) GoV edge checks.
#[derive(Default)]
pub struct RuleVerifier;

impl RuleVerifier {
    /// A claim "covers" against the pack if any pack item shares at least
    /// one content word with the claim — a coarse lexical overlap check
    /// standing in for a real citation-matching model.
    fn has_citation_coverage(draft_text: &str, pack: &Pack) -> bool {
        if pack.is_empty() {
            return false;
        }
        let draft_words: std::collections::HashSet<&str> =
            draft_text.split_whitespace().collect();
        pack.items.iter().any(|item| {
            item.text
                .split_whitespace()
                .any(|w| draft_words.contains(w))
        })
    }
}

#[async_trait]
impl Verifier for RuleVerifier {
    async fn verify(&self, draft: &Draft, pack: &Pack) -> VerifierResult {
        let mut issues = Vec::new();
        let mut score: f32 = 1.0;

        if pack.is_empty() {
            issues.push(Issue {
                kind: IssueKind::MissingEvidence,
                detail: "retriever returned no evidence".into(),
            });
            score -= 0.5;
        } else if !Self::has_citation_coverage(&draft.text, pack) {
            issues.push(Issue {
                kind: IssueKind::MissingCitations,
                detail: "draft claims are not matched by any pack item".into(),
            });
            score -= 0.3;
        }

        if !draft.placeholders.is_empty() {
            issues.push(Issue {
                kind: IssueKind::NumericUnverified,
                detail: format!("{} unresolved numeric placeholder(s)", draft.placeholders.len()),
            });
            score -= 0.2 * draft.placeholders.len() as f32;
        }

        let s2 = score.clamp(0.0, 1.0);
        let needs_fix = !issues.is_empty();

        VerifierResult { s2, issues, needs_fix }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::types::{EvidenceItem, SourceType};

    fn pack_with(text: &str) -> Pack {
        Pack {
            items: vec![EvidenceItem {
                item_id: "1".into(),
                source_type: SourceType::Corpus,
                text: text.into(),
                url: None,
                score: 1.0,
                provenance: "t".into(),
            }],
        }
    }

    #[tokio::test]
    async fn grounded_draft_scores_high() {
        let draft = Draft {
            text: "X is Y.".into(),
            placeholders: Vec::new(),
            used_tools: Vec::new(),
        };
        let result = RuleVerifier.verify(&draft, &pack_with("X is Y.")).await;
        assert!(result.s2 > 0.8);
        assert!(!result.needs_fix);
    }

    #[tokio::test]
    async fn empty_pack_flags_missing_evidence() {
        let draft = Draft {
            text: "Anything".into(),
            placeholders: Vec::new(),
            used_tools: Vec::new(),
        };
        let result = RuleVerifier.verify(&draft, &Pack::default()).await;
        assert!(result.issues.iter().any(|i| i.kind == IssueKind::MissingEvidence));
        assert!(result.needs_fix);
    }

    #[tokio::test]
    async fn unresolved_placeholder_flags_numeric_unverified() {
        let draft = Draft {
            text: "X is Y.".into(),
            placeholders: vec![crate::composer::Placeholder {
                pcn_id: crate::types::PcnId::new(),
                token: "{{pcn:1}}".into(),
            }],
            used_tools: Vec::new(),
        };
        let result = RuleVerifier.verify(&draft, &pack_with("X is Y.")).await;
        assert!(result
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::NumericUnverified));
    }
}
