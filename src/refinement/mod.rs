//! The refinement loop (spec §4.6): the largest component, cycling a
//! request through Compose → Assess → Decide → Refine until the decision
//! head accepts or abstains.
//!
//! Phase transitions are typestate-enforced with zero-sized markers so it
//! is structurally impossible to, say, decide before assessing or refine
//! without a decision. The outer driver in [`run`] trampolines back into
//! `AgentLoop<Composing>` after a `Refine` phase, the same shape the
//! teacher's reasoning loop uses for its Reasoning → PolicyCheck →
//! ToolDispatching → Observing cycle.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::approvals::{ApprovalStatus, ApprovalStore};
use crate::audit::{redact, AuditStore, StepRecord};
use crate::composer::{Composer, RefinementContext, ToolResultRef};
use crate::decision::{self, Action, Decision, ThresholdTable};
use crate::metrics::Metrics;
use crate::pcn::PcnArena;
use crate::policy::PolicyOverlay;
use crate::retriever::types::Pack;
use crate::stream::{Event, EventWriter, TraceSummary};
use crate::tools::{ToolBudget, ToolDispatcher, ToolOutcome};
use crate::types::RequestId;
use crate::uncertainty::{SnneEstimator, UncertaintyResult};
use crate::verifier::{Issue, IssueKind, Verifier, VerifierResult};

pub trait Phase {}
pub struct Composing;
pub struct Assessing;
pub struct Deciding;
pub struct Refining;
impl Phase for Composing {}
impl Phase for Assessing {}
impl Phase for Deciding {}
impl Phase for Refining {}

/// State carried across every phase of one request's refinement loop.
pub struct RefinementState {
    pub request_id: RequestId,
    pub question: String,
    pub domain: crate::types::Domain,
    pub pack: Pack,
    pub refinement_index: u32,
    pub pcn_arena: PcnArena,
    pub draft: Option<crate::composer::Draft>,
    pub uncertainty: Option<UncertaintyResult>,
    pub verifier_result: Option<VerifierResult>,
    pub decision: Option<Decision>,
    pub refinement_ctx: RefinementContext,
    /// Per-iteration trace summaries, accumulated for the final `AgentResult`.
    pub trace: Vec<TraceSummary>,
    /// Issues raised outside the verifier (approval denial/expiry) that the
    /// next `decide()` call must fold in, since the verifier itself never
    /// sees approval outcomes.
    pub carried_issues: Vec<Issue>,
}

impl RefinementState {
    pub fn new(request_id: RequestId, question: String, domain: crate::types::Domain, pack: Pack) -> Self {
        Self {
            request_id,
            question,
            domain,
            pack,
            refinement_index: 0,
            pcn_arena: PcnArena::new(),
            draft: None,
            uncertainty: None,
            verifier_result: None,
            decision: None,
            refinement_ctx: RefinementContext::default(),
            trace: Vec::new(),
            carried_issues: Vec::new(),
        }
    }
}

/// Shared, read-only collaborators every phase needs.
pub struct Collaborators {
    pub composer: Arc<dyn Composer>,
    pub uncertainty: Arc<SnneEstimator>,
    pub verifier: Arc<dyn Verifier>,
    pub tools: Arc<ToolDispatcher>,
    pub approvals: Arc<ApprovalStore>,
    pub audit: Arc<AuditStore>,
    pub metrics: Arc<Metrics>,
    pub policy: PolicyOverlay,
    pub threshold: Option<Arc<ThresholdTable>>,
    pub default_tau: f32,
    pub default_delta: f32,
}

pub struct AgentLoop<P: Phase> {
    pub state: RefinementState,
    _phase: PhantomData<P>,
}

impl AgentLoop<Composing> {
    pub fn new(state: RefinementState) -> Self {
        Self { state, _phase: PhantomData }
    }

    pub async fn compose(mut self, collab: &Collaborators, events: &EventWriter) -> AgentLoop<Assessing> {
        let refinement_ctx = if self.state.refinement_index > 0 {
            Some(self.state.refinement_ctx.clone())
        } else {
            None
        };
        let draft = collab
            .composer
            .compose(&self.state.question, &self.state.pack, refinement_ctx.as_ref())
            .await;
        for fragment in draft.fragments() {
            events.send(Event::Token { text: fragment }).await;
        }
        self.state.draft = Some(draft);
        AgentLoop { state: self.state, _phase: PhantomData }
    }
}

impl AgentLoop<Assessing> {
    pub async fn assess(mut self, collab: &Collaborators) -> AgentLoop<Deciding> {
        let draft = self.state.draft.as_ref().expect("composed before assess");
        let uncertainty = collab.uncertainty.estimate(&draft.text, &self.state.domain.0);
        let verifier_result = collab.verifier.verify(draft, &self.state.pack).await;
        self.state.uncertainty = Some(uncertainty);
        self.state.verifier_result = Some(verifier_result);
        AgentLoop { state: self.state, _phase: PhantomData }
    }
}

/// What the Deciding phase produced: either a terminal outcome or another
/// trip through Refining.
pub enum DecideOutcome {
    Terminal(AgentLoop<Deciding>),
    Continue(AgentLoop<Refining>),
}

impl AgentLoop<Deciding> {
    /// Combine `s1`/`s2`, ask the decision head, emit `score` then `trace`,
    /// and persist exactly one `StepRecord` for this decided step (spec §3
    /// invariant 1, §5 ordering guarantee) before returning.
    pub async fn decide(mut self, collab: &Collaborators, events: &EventWriter, max_refinements: u32) -> DecideOutcome {
        let uq = self.state.uncertainty.as_ref().expect("assessed before decide").clone();
        let verifier = self.state.verifier_result.as_ref().expect("assessed before decide").clone();

        let mut issues = verifier.issues.clone();
        issues.append(&mut self.state.carried_issues);

        let s = decision::combine_score(uq.s1, verifier.s2, 0.5, 0.5);
        let outcome = decision::decide(
            s,
            collab.threshold.as_deref(),
            collab.default_tau,
            collab.default_delta,
            self.state.refinement_index,
            max_refinements,
            &issues,
        );

        events
            .send(Event::Score {
                s1: uq.s1,
                s2: verifier.s2,
                final_score: outcome.s,
                cp_accept: outcome.cp_accept,
                cp_tau: outcome.cp_tau,
            })
            .await;

        self.state.decision = Some(outcome.clone());

        let draft = self.state.draft.as_ref().expect("composed before decide").clone();
        let answer_so_far = self.state.pcn_arena.substitute(&draft.text, &draft.placeholders);
        let issue_labels: Vec<String> = issues.iter().map(|i| format!("{:?}", i.kind)).collect();

        let trace = TraceSummary {
            step: self.state.refinement_index,
            is_refinement: self.state.refinement_index > 0,
            issues: issue_labels.clone(),
            tools_used: draft.used_tools.clone(),
            prompt_preview: Some(self.state.question.chars().take(120).collect()),
        };
        events.send(Event::Trace(trace.clone())).await;
        self.state.trace.push(trace);

        let record = StepRecord {
            id: crate::types::StepRecordId::new(),
            request_id: self.state.request_id,
            domain: self.state.domain.clone(),
            refinement_index: self.state.refinement_index,
            question_redacted: redact(&self.state.question),
            answer_redacted: redact(&answer_so_far),
            s1: uq.s1,
            s2: verifier.s2,
            s: outcome.s,
            cp_accept: outcome.cp_accept,
            action: outcome.action,
            pack_ids: self.state.pack.pack_ids(),
            tools_used: draft.used_tools.clone(),
            issues: issue_labels,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = collab.audit.write(&record).await {
            tracing::warn!(error = %e, "failed to persist step record");
        }

        match outcome.action {
            Action::Iterate => DecideOutcome::Continue(AgentLoop { state: self.state, _phase: PhantomData }),
            Action::Accept | Action::Abstain => DecideOutcome::Terminal(self),
        }
    }
}

impl AgentLoop<Refining> {
    /// Select the highest-priority fixable issue, dispatch the matching
    /// tool (subject to budget/allowlist/approval), mint+resolve a PCN for
    /// its output, and fold the result into the next compose pass.
    pub async fn refine(
        mut self,
        collab: &Collaborators,
        events: &EventWriter,
        budget: &ToolBudget,
    ) -> AgentLoop<Composing> {
        self.state.refinement_index += 1;
        let verifier = self.state.verifier_result.as_ref().expect("assessed before refine").clone();

        let mut tool_outputs: Vec<ToolResultRef> = Vec::new();
        let mut remaining_per_refinement = budget.per_refinement;

        for issue in verifier.issues.iter().filter(|i| i.kind.is_fixable()) {
            if remaining_per_refinement == 0 {
                break;
            }
            let tool_name = match issue.kind {
                IssueKind::NumericUnverified => "MATH_EVAL",
                IssueKind::MissingEvidence => "WEB_SEARCH",
                IssueKind::Governance => "TABLE_QUERY",
                _ => continue,
            };

            if collab.policy.check_tool_allowed(tool_name).is_err() {
                events
                    .send(Event::Tool {
                        name: tool_name.into(),
                        status: "blocked".into(),
                        detail: Some("tool not in workspace allowlist".into()),
                    })
                    .await;
                continue;
            }

            if collab.policy.requires_approval(tool_name) {
                let approval_id = collab.approvals.request(tool_name, &issue.detail);
                collab.metrics.approvals_requested.inc();
                events
                    .send(Event::Tool {
                        name: tool_name.into(),
                        status: "waiting_approval".into(),
                        detail: Some(approval_id.to_string()),
                    })
                    .await;
                let status = collab
                    .approvals
                    .wait(approval_id, Duration::from_secs(5))
                    .await
                    .unwrap_or(ApprovalStatus::Expired);
                match status {
                    ApprovalStatus::Approved => {}
                    ApprovalStatus::Denied => {
                        self.state.carried_issues.push(Issue {
                            kind: IssueKind::ApprovalDenied,
                            detail: format!("{tool_name}: {}", issue.detail),
                        });
                        continue;
                    }
                    ApprovalStatus::Expired | ApprovalStatus::Pending => {
                        collab.metrics.approvals_expired.inc();
                        self.state.carried_issues.push(Issue {
                            kind: IssueKind::ApprovalExpired,
                            detail: format!("{tool_name}: {}", issue.detail),
                        });
                        continue;
                    }
                }
            }

            events.send(Event::Tool { name: tool_name.into(), status: "start".into(), detail: None }).await;

            let args = serde_json::json!({ "expr": issue.detail, "query": issue.detail, "url": issue.detail, "sql": issue.detail });
            let outcome = collab.tools.dispatch(tool_name, &args, &collab.policy.tools_allowed).await;
            remaining_per_refinement -= 1;
            collab.metrics.tool_calls_total.inc();

            match outcome {
                ToolOutcome::Ok { output } => {
                    let pcn_id = self.state.pcn_arena.mint(issue.detail.clone());
                    self.state.pcn_arena.add_edge(
                        pcn_id,
                        crate::pcn::GovSource::Tool { tool_name: tool_name.to_string(), call_summary: output.to_string() },
                    );
                    events.send(Event::Pcn { id: pcn_id, status: "pcn_pending".into(), value: None }).await;

                    let value = output
                        .get("value")
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| output.to_string());
                    let unit = output.get("unit").and_then(|u| u.as_str()).map(str::to_string);

                    match self.state.pcn_arena.resolve(pcn_id, value.clone(), unit) {
                        Ok(()) => {
                            events
                                .send(Event::Pcn { id: pcn_id, status: "pcn_verified".into(), value: Some(value) })
                                .await;
                            let token = format!("{{{{pcn:{pcn_id}}}}}");
                            tool_outputs.push(ToolResultRef { pcn_id, token, tool_name: tool_name.to_string() });
                        }
                        Err(e) => {
                            let _ = self.state.pcn_arena.mark_unverified(pcn_id, &e.to_string());
                            events
                                .send(Event::Pcn { id: pcn_id, status: "pcn_failed".into(), value: None })
                                .await;
                        }
                    }

                    events
                        .send(Event::Gov { dag_delta: self.state.pcn_arena.dag_delta() })
                        .await;
                    events.send(Event::Tool { name: tool_name.into(), status: "stop".into(), detail: None }).await;
                }
                ToolOutcome::Blocked { reason } => {
                    collab.metrics.tool_calls_blocked.inc();
                    events
                        .send(Event::Tool { name: tool_name.into(), status: "blocked".into(), detail: Some(reason) })
                        .await;
                }
                ToolOutcome::Failed { error } => {
                    collab.metrics.tool_calls_failed.inc();
                    events
                        .send(Event::Tool { name: tool_name.into(), status: "error".into(), detail: Some(error) })
                        .await;
                }
                ToolOutcome::WaitingApproval { approval_id } => {
                    events
                        .send(Event::Tool {
                            name: tool_name.into(),
                            status: "waiting_approval".into(),
                            detail: Some(approval_id.to_string()),
                        })
                        .await;
                }
            }
        }

        self.state.refinement_ctx = RefinementContext {
            issues: verifier.issues.clone(),
            prior_draft: self.state.draft.as_ref().map(|d| d.text.clone()),
            tool_outputs,
        };

        AgentLoop { state: self.state, _phase: PhantomData }
    }
}

/// The outcome of the whole refinement loop: the accepted/abstained final
/// state, with placeholders substituted per the PCN arena.
pub struct LoopResult {
    pub answer: String,
    pub decision: Decision,
    pub state: RefinementState,
}

/// Drive the full Compose → Assess → Decide → (Refine →)* cycle to
/// completion, emitting events as it goes.
pub async fn run(
    mut state: RefinementState,
    collab: &Collaborators,
    events: &EventWriter,
    max_refinements: u32,
    budget: &ToolBudget,
) -> LoopResult {
    loop {
        let composing = AgentLoop::<Composing>::new(state);
        let assessing = composing.compose(collab, events).await;
        let deciding = assessing.assess(collab).await;
        match deciding.decide(collab, events, max_refinements).await {
            DecideOutcome::Terminal(terminal) => {
                let decision = terminal.state.decision.clone().expect("decided");
                let draft = terminal.state.draft.clone().expect("composed");
                let answer = terminal.state.pcn_arena.substitute(&draft.text, &draft.placeholders);
                return LoopResult { answer, decision, state: terminal.state };
            }
            DecideOutcome::Continue(refining) => {
                state = refining.refine(collab, events, budget).await.state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::ApprovalStore;
    use crate::audit::AuditStore;
    use crate::composer::ExtractiveComposer;
    use crate::decision::CalibrationStore;
    use crate::retriever::types::{EvidenceItem, SourceType};
    use crate::retriever::vector::HashEmbedder;
    use crate::tools::circuit_breaker::CircuitBreakerRegistry;
    use crate::verifier::RuleVerifier;

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

    fn test_collab(policy: PolicyOverlay) -> Collaborators {
        Collaborators {
            composer: Arc::new(ExtractiveComposer),
            uncertainty: Arc::new(SnneEstimator::new(Arc::new(HashEmbedder::default()))),
            verifier: Arc::new(RuleVerifier),
            tools: Arc::new(ToolDispatcher::new(Arc::new(CircuitBreakerRegistry::default()))),
            approvals: Arc::new(ApprovalStore::default()),
            audit: Arc::new(AuditStore::open_in_memory().unwrap()),
            metrics: Metrics::shared(),
            policy,
            threshold: None,
            default_tau: 0.6,
            default_delta: 0.1,
        }
    }

    #[tokio::test]
    async fn happy_path_accepts_without_refinement() {
        let collab = test_collab(PolicyOverlay::default());
        let (writer, mut rx) = EventWriter::new(64);
        let state = RefinementState::new(
            RequestId::new(),
            "What is X?".into(),
            crate::types::Domain::default_domain(),
            pack_with("X is Y."),
        );
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = run(state, &collab, &writer, 2, &ToolBudget::default()).await;
        assert_eq!(result.decision.action, Action::Accept);
        assert!(result.answer.contains("X is Y."));
        assert_eq!(collab.audit.recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_pack_iterates_then_abstains_when_still_ungrounded() {
        let collab = test_collab(PolicyOverlay::default());
        let (writer, mut rx) = EventWriter::new(256);
        let state = RefinementState::new(
            RequestId::new(),
            "What is X?".into(),
            crate::types::Domain::default_domain(),
            Pack::default(),
        );
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = run(state, &collab, &writer, 2, &ToolBudget::default()).await;
        assert_eq!(result.decision.action, Action::Abstain);
        assert_eq!(result.state.refinement_index, 2);
        // One StepRecord per decided step: iterate(0), iterate(1), abstain(2).
        assert_eq!(collab.audit.recent(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn disallowed_tool_is_blocked_and_loop_still_terminates() {
        let mut policy = PolicyOverlay::default();
        policy.tools_allowed = Vec::new();
        let collab = test_collab(policy);
        let (writer, mut rx) = EventWriter::new(256);
        let state = RefinementState::new(
            RequestId::new(),
            "What is X?".into(),
            crate::types::Domain::default_domain(),
            Pack::default(),
        );
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = run(state, &collab, &writer, 1, &ToolBudget::default()).await;
        assert_eq!(result.decision.action, Action::Abstain);
    }

    #[tokio::test]
    async fn resolved_tool_output_is_embedded_as_placeholder_not_inlined() {
        // A MissingEvidence issue against an empty pack dispatches WEB_SEARCH,
        // which has no registered tool and so fails; this exercises the
        // mint -> pending -> failed path without needing a live tool.
        let collab = test_collab(PolicyOverlay::default());
        let (writer, mut rx) = EventWriter::new(256);
        let state = RefinementState::new(
            RequestId::new(),
            "What is X?".into(),
            crate::types::Domain::default_domain(),
            Pack::default(),
        );
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = run(state, &collab, &writer, 1, &ToolBudget::default()).await;
        assert!(!result.state.pcn_arena.all_resolved() || result.state.pcn_arena.dag_delta().ok);
    }
}
