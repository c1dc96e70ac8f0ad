//! Composer (spec §4.2): produces a draft answer from a question, pack, and
//! optional refinement context. The deterministic extractive fallback is the
//! baseline used by tests; a model-backed composer implements the same
//! trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retriever::types::Pack;
use crate::verifier::Issue;

/// A numeric/fact placeholder embedded in a draft, resolved by the PCN
/// machinery before final emission (spec §4.6 step 5, §3 invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placeholder {
    pub pcn_id: crate::types::PcnId,
    /// The literal token in `text`, e.g. `"{{pcn:<uuid>}}"`.
    pub token: String,
}

/// A produced draft answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub text: String,
    pub placeholders: Vec<Placeholder>,
    pub used_tools: Vec<String>,
}

impl Draft {
    /// Lazily split the draft into forward-streamable fragments. The
    /// sequence is restartable only by calling this again (spec §4.2).
    pub fn fragments(&self) -> impl Iterator<Item = String> + '_ {
        self.text.split_inclusive(' ').map(|s| s.to_string())
    }
}

/// One tool call's result from a refinement pass, already minted as a PCN —
/// the composer embeds `token`, never the raw value, so the placeholder
/// machinery (verifier, decision, final substitution) stays the only path a
/// numeric fact can reach the answer through.
#[derive(Debug, Clone)]
pub struct ToolResultRef {
    pub pcn_id: crate::types::PcnId,
    pub token: String,
    pub tool_name: String,
}

/// Context carried into a refinement pass.
#[derive(Debug, Clone, Default)]
pub struct RefinementContext {
    pub issues: Vec<Issue>,
    pub prior_draft: Option<String>,
    pub tool_outputs: Vec<ToolResultRef>,
}

#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(
        &self,
        question: &str,
        pack: &Pack,
        refinement: Option<&RefinementContext>,
    ) -> Draft;
}

/// Deterministic, model-free composer: restates the question's focus and
/// appends the top-ranked pack item's snippet verbatim. Incorporates tool
/// outputs from a refinement pass when present. This is the contract the
/// spec mandates as the testable baseline.
#[derive(Default)]
pub struct ExtractiveComposer;

#[async_trait]
impl Composer for ExtractiveComposer {
    async fn compose(
        &self,
        question: &str,
        pack: &Pack,
        refinement: Option<&RefinementContext>,
    ) -> Draft {
        let focus = question.trim().trim_end_matches('?');
        let mut used_tools = Vec::new();
        let mut placeholders = Vec::new();

        let mut text = match pack.top() {
            Some(item) => format!("Regarding {focus}: {}", item.text),
            None => format!("I don't have grounded evidence regarding {focus}."),
        };

        if let Some(ctx) = refinement {
            for result in &ctx.tool_outputs {
                text.push(' ');
                text.push_str(&result.token);
                placeholders.push(Placeholder { pcn_id: result.pcn_id, token: result.token.clone() });
                used_tools.push(result.tool_name.clone());
            }
        }

        Draft {
            text,
            placeholders,
            used_tools,
        }
    }
}
