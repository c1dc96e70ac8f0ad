//! The engine: wires the retriever, composer, uncertainty estimator,
//! verifier, tools, policy, calibration, audit, idempotency, and metrics
//! subsystems together and drives one request through [`refinement::run`].

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::approvals::ApprovalStore;
use crate::audit::AuditStore;
use crate::composer::Composer;
use crate::decision::{Action, CalibrationStore};
use crate::idempotency::IdempotencyStore;
use crate::metrics::Metrics;
use crate::policy::PolicyRegistry;
use crate::refinement::{Collaborators, RefinementState};
use crate::retriever::types::RetrievalFilters;
use crate::retriever::HybridRetriever;
use crate::stream::{AgentResult, Event, EventWriter, Usage, HEARTBEAT_INTERVAL};
use crate::tools::{ToolBudget, ToolDispatcher};
use crate::types::error::{EngineError, EngineResult};
use crate::types::{Domain, RequestId, WorkspaceSlug};
use crate::uncertainty::SnneEstimator;
use crate::verifier::Verifier;

/// The final, caller-visible outcome of one `answer` request (spec §6.3).
pub type AnswerOutcome = AgentResult;

/// Everything one running instance of the engine needs. Constructed once at
/// startup and shared behind an `Arc` across all requests.
pub struct Engine {
    pub retriever: Arc<HybridRetriever>,
    pub composer: Arc<dyn Composer>,
    pub uncertainty: Arc<SnneEstimator>,
    pub verifier: Arc<dyn Verifier>,
    pub tools: Arc<ToolDispatcher>,
    pub approvals: Arc<ApprovalStore>,
    pub policy: Arc<PolicyRegistry>,
    pub calibration: Arc<CalibrationStore>,
    pub audit: Arc<AuditStore>,
    pub idempotency: Arc<IdempotencyStore>,
    pub metrics: Arc<Metrics>,
    pub memory_budget_default: usize,
}

impl Engine {
    /// Run a request to completion with no caller-visible streaming; events
    /// emitted during refinement are drained and discarded.
    pub async fn answer(
        &self,
        question: &str,
        workspace: &str,
        domain: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> EngineResult<AnswerOutcome> {
        if let Some(key) = idempotency_key {
            if let Some(cached) = self.idempotency.get(workspace, key) {
                return Ok(cached);
            }
        }
        let (events, mut rx) = EventWriter::new(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let request_id = RequestId::new();
        let result = self.run_request(request_id, question, workspace, domain, &events).await?;
        if let Some(key) = idempotency_key {
            self.idempotency.put(workspace, key, result.clone());
        }
        Ok(result)
    }

    /// Run a request to completion, forwarding every emitted event over
    /// `tx` as it happens, bracketed by `ready`/`final`/`error` and kept
    /// alive with a periodic heartbeat while the request is in flight. A
    /// replayed idempotent request skips refinement entirely and emits only
    /// `ready` followed by `final` (spec §4.9 stream coupling).
    pub async fn answer_streamed(
        self: Arc<Self>,
        question: &str,
        workspace: &str,
        domain: Option<&str>,
        idempotency_key: Option<&str>,
        tx: mpsc::Sender<Event>,
    ) {
        let events = EventWriter::from_sender(tx);
        let request_id = RequestId::new();
        events.send(Event::Ready { request_id }).await;

        if let Some(key) = idempotency_key {
            if let Some(cached) = self.idempotency.get(workspace, key) {
                events.send(Event::Final(Box::new(cached))).await;
                return;
            }
        }

        let fut = self.run_request(request_id, question, workspace, domain, &events);
        tokio::pin!(fut);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                result = &mut fut => {
                    match result {
                        Ok(outcome) => {
                            if let Some(key) = idempotency_key {
                                self.idempotency.put(workspace, key, outcome.clone());
                            }
                            events.send(Event::Final(Box::new(outcome))).await;
                        }
                        Err(e) => {
                            let (code, message) = e.safe_code();
                            events.send(Event::Error { code: code.to_string(), message }).await;
                        }
                    }
                    break;
                }
                _ = heartbeat.tick() => {
                    events.send(Event::Heartbeat).await;
                }
            }
        }
    }

    async fn run_request(
        &self,
        request_id: RequestId,
        question: &str,
        workspace: &str,
        domain: Option<&str>,
        events: &EventWriter,
    ) -> EngineResult<AnswerOutcome> {
        self.metrics.requests_total.inc();
        let started = std::time::Instant::now();

        WorkspaceSlug::parse(workspace)?;
        let domain = Domain(domain.unwrap_or("default").to_string());
        let policy = self.policy.get(workspace, &domain);

        let filters = RetrievalFilters { domain: Some(domain.clone()), source_type: None };
        let pack = self.retriever.retrieve(question, self.memory_budget_default, &filters).await?;
        let pack_ids = pack.pack_ids();

        let threshold = self.calibration.lookup(&domain);

        let collab = Collaborators {
            composer: self.composer.clone(),
            uncertainty: self.uncertainty.clone(),
            verifier: self.verifier.clone(),
            tools: self.tools.clone(),
            approvals: self.approvals.clone(),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
            default_tau: policy.accept_threshold,
            default_delta: policy.borderline_delta,
            threshold,
            policy: policy.clone(),
        };

        let budget = ToolBudget {
            per_turn: policy.tool_budget_per_turn,
            per_refinement: policy.tool_budget_per_refinement,
        };

        let state = RefinementState::new(request_id, question.to_string(), domain.clone(), pack);
        let result = crate::refinement::run(state, &collab, events, policy.max_refinements, &budget).await;

        let s1 = result.state.uncertainty.as_ref().map(|u| u.s1).unwrap_or(0.0);
        let s2 = result.state.verifier_result.as_ref().map(|v| v.s2).unwrap_or(0.0);

        match result.decision.action {
            Action::Accept => self.metrics.requests_accepted.inc(),
            Action::Iterate => self.metrics.requests_iterated.inc(),
            Action::Abstain => self.metrics.requests_abstained.inc(),
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.request_latency_ms.observe_ms(latency_ms);

        let issues: Vec<String> = result
            .state
            .verifier_result
            .as_ref()
            .map(|v| v.issues.iter().map(|i| format!("{:?}", i.kind)).collect())
            .unwrap_or_default();
        let tools_used: Vec<String> = result.state.draft.as_ref().map(|d| d.used_tools.clone()).unwrap_or_default();
        let tool_calls = result.state.trace.iter().map(|t| t.tools_used.len() as u32).sum();

        Ok(AnswerOutcome {
            request_id,
            answer: result.answer,
            action: result.decision.action,
            s1,
            s2,
            final_score: result.decision.s,
            cp_accept: result.decision.cp_accept,
            cp_tau: result.decision.cp_tau,
            issues,
            tools_used,
            pack_ids,
            trace: result.state.trace,
            latency_ms,
            usage: Usage { tool_calls, refinements: result.state.refinement_index },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::ExtractiveComposer;
    use crate::retriever::lexical::LexicalIndex;
    use crate::retriever::vector::InMemoryFlatIndex;
    use crate::tools::circuit_breaker::CircuitBreakerRegistry;
    use crate::uncertainty::SnneEstimator;
    use crate::verifier::RuleVerifier;

    fn test_engine() -> Engine {
        let mut lex = LexicalIndex::new();
        lex.add("1", "X is Y.", None, Some("default".into()));
        let retriever = HybridRetriever::new(Arc::new(lex), Arc::new(InMemoryFlatIndex::new()));
        Engine {
            retriever: Arc::new(retriever),
            composer: Arc::new(ExtractiveComposer),
            uncertainty: Arc::new(SnneEstimator::new(Arc::new(crate::retriever::vector::HashEmbedder::default()))),
            verifier: Arc::new(RuleVerifier),
            tools: Arc::new(ToolDispatcher::new(Arc::new(CircuitBreakerRegistry::default()))),
            approvals: Arc::new(ApprovalStore::default()),
            policy: Arc::new(PolicyRegistry::default()),
            calibration: Arc::new(CalibrationStore::new(0.7, 0.1)),
            audit: Arc::new(AuditStore::open_in_memory().unwrap()),
            idempotency: Arc::new(IdempotencyStore::default()),
            metrics: Metrics::shared(),
            memory_budget_default: 8,
        }
    }

    #[tokio::test]
    async fn answer_happy_path_accepts_and_persists_a_step() {
        let engine = test_engine();
        let outcome = engine.answer("What is X?", "ws1", None, None).await.unwrap();
        assert_eq!(outcome.action, Action::Accept);
        assert!(outcome.answer.contains("X is Y."));
        assert_eq!(engine.metrics.requests_total.get(), 1);
        let recent = engine.audit.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn answer_rejects_invalid_workspace_slug() {
        let engine = test_engine();
        let err = engine.answer("What is X?", "has space", None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn answer_streamed_emits_ready_and_final() {
        let engine = Arc::new(test_engine());
        let (tx, mut rx) = mpsc::channel(64);
        engine.answer_streamed("What is X?", "ws1", None, None, tx).await;

        let mut saw_ready = false;
        let mut saw_final = false;
        while let Some(event) = rx.recv().await {
            match event {
                Event::Ready { .. } => saw_ready = true,
                Event::Final(_) => saw_final = true,
                _ => {}
            }
        }
        assert!(saw_ready);
        assert!(saw_final);
    }

    #[tokio::test]
    async fn repeated_request_with_same_idempotency_key_replays_cached_answer() {
        let engine = test_engine();
        let first = engine.answer("What is X?", "ws1", None, Some("k1")).await.unwrap();
        let second = engine.answer("What is X?", "ws1", None, Some("k1")).await.unwrap();
        assert_eq!(first.answer, second.answer);
        assert_eq!(first.request_id, second.request_id);
        // Only the first call actually ran refinement and persisted a step.
        assert_eq!(engine.metrics.requests_total.get(), 1);
    }
}
