//! HTTP surface (spec §6.2), behind the `http-api` feature: `POST
//! /agent/answer`, its SSE sibling `/agent/answer/stream`, approval
//! resolution, conformal-prediction threshold/artifact endpoints, step
//! lookup, and metrics export.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use crate::decision::CalibrationArtifact;
use crate::engine::{AnswerOutcome, Engine};
use crate::pcn::PcnStatus;
use crate::stream::{encode_sse, Event};
use crate::types::error::EngineError;
use crate::types::{Domain, PcnId, StepRecordId};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    pub workspace: String,
    pub domain: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let (code, message) = self.safe_code();
        let status = match code {
            "bad_request" => axum::http::StatusCode::BAD_REQUEST,
            "not_found" => axum::http::StatusCode::NOT_FOUND,
            "policy_denied" => axum::http::StatusCode::FORBIDDEN,
            _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { code: code.to_string(), message })).into_response()
    }
}

async fn post_answer(
    State(state): State<ApiState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<AnswerOutcome>, EngineError> {
    let result = state
        .engine
        .answer(&req.question, &req.workspace, req.domain.as_deref(), req.idempotency_key.as_deref())
        .await?;
    Ok(Json(result))
}

async fn post_answer_stream(
    State(state): State<ApiState>,
    Json(req): Json<AnswerRequest>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);
    let engine = state.engine.clone();
    let question = req.question.clone();
    let workspace = req.workspace.clone();
    let domain = req.domain.clone();
    let idempotency_key = req.idempotency_key.clone();

    tokio::spawn(async move {
        engine
            .answer_streamed(&question, &workspace, domain.as_deref(), idempotency_key.as_deref(), tx)
            .await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let frame = encode_sse(&event);
        Ok(SseEvent::default().data(frame))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(crate::stream::HEARTBEAT_INTERVAL))
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approval_id: crate::types::ApprovalId,
    pub approved: bool,
}

async fn post_approve(
    State(state): State<ApiState>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    state.engine.approvals.resolve(req.approval_id, req.approved)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ThresholdQuery {
    pub domain: Option<String>,
}

async fn get_threshold(
    State(state): State<ApiState>,
    Query(q): Query<ThresholdQuery>,
) -> Json<serde_json::Value> {
    let domain = Domain(q.domain.unwrap_or_else(|| "default".to_string()));
    let table = state.engine.calibration.lookup(&domain);
    Json(serde_json::to_value(table.as_deref()).unwrap_or(serde_json::Value::Null))
}

async fn post_artifacts(
    State(state): State<ApiState>,
    Json(artifacts): Json<Vec<CalibrationArtifact>>,
) -> Json<serde_json::Value> {
    let count = artifacts.len();
    state.engine.calibration.import(artifacts);
    Json(serde_json::json!({ "imported": count }))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

async fn get_steps_recent(
    State(state): State<ApiState>,
    Query(q): Query<RecentQuery>,
) -> Result<Json<Vec<StepRecordId>>, EngineError> {
    let ids = state.engine.audit.recent(q.limit.unwrap_or(20)).await?;
    Ok(Json(ids))
}

async fn get_steps_by_id(
    State(state): State<ApiState>,
    Path(id): Path<StepRecordId>,
) -> Result<Json<crate::audit::StepRecord>, EngineError> {
    let record = state
        .engine
        .audit
        .get_by_id(id)
        .await?
        .ok_or(EngineError::StepNotFound { id })?;
    Ok(Json(record))
}

async fn get_metrics_prom(State(state): State<ApiState>) -> String {
    state.engine.metrics.render_prometheus()
}

async fn get_metrics_json(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(state.engine.metrics.render_json())
}

/// One node of a caller-submitted dag to check (spec §6.2 `{dag, ...}`). The
/// PCN arena itself is request-scoped and gone once a request completes, so
/// this endpoint re-verifies a dag the caller already has in hand rather
/// than looking one up server-side.
#[derive(Debug, Deserialize)]
pub struct GovCheckNode {
    pub pcn: PcnId,
    pub claim: String,
    pub status: PcnStatus,
    pub value: Option<f64>,
}

/// A property check against one node's resolved value (spec §4.7 "surface
/// per-column property checks from policy").
#[derive(Debug, Deserialize)]
pub struct GovAssertion {
    pub pcn: PcnId,
    pub property: String,
    pub bound: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct GovAssertionResult {
    pub pcn: PcnId,
    pub property: String,
    pub passed: bool,
}

#[derive(Debug, Deserialize)]
pub struct GovCheckRequest {
    pub dag: Vec<GovCheckNode>,
    pub verified_pcn: Vec<PcnId>,
    pub assertions: Vec<GovAssertion>,
}

#[derive(Debug, Serialize)]
pub struct GovCheckResponse {
    pub ok: bool,
    pub failures: Vec<String>,
    pub assertions: Vec<GovAssertionResult>,
}

fn check_assertion(node: Option<&GovCheckNode>, assertion: &GovAssertion) -> bool {
    let Some(value) = node.and_then(|n| n.value) else {
        return false;
    };
    match (assertion.property.as_str(), assertion.bound) {
        ("non_negative", _) => value >= 0.0,
        ("min", Some(bound)) => value >= bound,
        ("max", Some(bound)) => value <= bound,
        _ => false,
    }
}

/// Re-verify a caller-submitted graph-of-verification: every node must be
/// `Verified` and present in `verified_pcn`, and every assertion must hold
/// against its node's resolved value.
async fn post_gov_check(Json(req): Json<GovCheckRequest>) -> Json<GovCheckResponse> {
    let mut failures = Vec::new();
    for node in &req.dag {
        let verified = node.status == PcnStatus::Verified && req.verified_pcn.contains(&node.pcn);
        if !verified {
            failures.push(node.claim.clone());
        }
    }

    let assertions: Vec<GovAssertionResult> = req
        .assertions
        .iter()
        .map(|a| {
            let node = req.dag.iter().find(|n| n.pcn == a.pcn);
            GovAssertionResult { pcn: a.pcn, property: a.property.clone(), passed: check_assertion(node, a) }
        })
        .collect();

    let ok = failures.is_empty() && assertions.iter().all(|a| a.passed);
    Json(GovCheckResponse { ok, failures, assertions })
}

async fn health() -> &'static str {
    "ok"
}

pub fn build_router(engine: Arc<Engine>) -> Router {
    let state = ApiState { engine };
    Router::new()
        .route("/health", get(health))
        .route("/agent/answer", post(post_answer))
        .route("/agent/answer/stream", post(post_answer_stream))
        .route("/tools/approve", post(post_approve))
        .route("/cp/threshold", get(get_threshold))
        .route("/cp/artifacts", post(post_artifacts))
        .route("/steps/recent", get(get_steps_recent))
        .route("/steps/:id", get(get_steps_by_id))
        .route("/metrics/prom", get(get_metrics_prom))
        .route("/metrics", get(get_metrics_json))
        .route("/gov/check", post(post_gov_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(router: Router, bind_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = bind_addr, "listening");
    axum::serve(listener, router).await
}
