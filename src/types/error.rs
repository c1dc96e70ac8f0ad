//! Error taxonomy for the orchestration engine.
//!
//! Mirrors the kinds enumerated in spec §7: validation and policy errors are
//! user/caller visible, upstream tool failures and resource degradation are
//! recovered locally and folded into issues, and only `Internal` produces a
//! terminal `error` stream event with an opaque code.

use thiserror::Error;

use super::{ApprovalId, PcnId, RequestId, StepRecordId};

/// Top-level engine error.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("tool dispatch error: {0}")]
    ToolDispatch(#[from] ToolError),

    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("request {request_id} not found")]
    RequestNotFound { request_id: RequestId },

    #[error("step {id} not found")]
    StepNotFound { id: StepRecordId },

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Safe, caller-visible `(code, message)` pair for the `error` SSE event
    /// and 4xx/5xx HTTP mapping. Never leaks internal detail.
    pub fn safe_code(&self) -> (&'static str, String) {
        match self {
            EngineError::Validation(msg) => ("bad_request", msg.clone()),
            EngineError::Policy(e) => ("policy_denied", e.to_string()),
            EngineError::Retrieval(_) => ("retrieval_degraded", "retrieval unavailable".into()),
            EngineError::ToolDispatch(_) => ("tool_error", "a tool invocation failed".into()),
            EngineError::Approval(_) => ("approval_error", self.to_string()),
            EngineError::Audit(_) => ("server_error", "failed to persist step".into()),
            EngineError::Config(_) => ("server_error", "configuration error".into()),
            EngineError::RequestNotFound { .. } => ("not_found", "request not found".into()),
            EngineError::StepNotFound { .. } => ("not_found", "step not found".into()),
            EngineError::Internal(_) => ("server_error", "an internal error occurred".into()),
        }
    }
}

/// Workspace policy enforcement errors.
#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("tool '{tool}' is not in the workspace allowlist")]
    ToolNotAllowed { tool: String },

    #[error("table '{table}' is not in the workspace allowlist")]
    TableNotAllowed { table: String },

    #[error("egress denied for host '{host}'")]
    EgressDenied { host: String },

    #[error("unknown policy overlay key: {key}")]
    UnknownKey { key: String },

    #[error("invalid policy overlay value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Tool execution errors (spec §4.7). Non-fatal: recorded as an issue,
/// iteration continues.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request blocked by policy: {0}")]
    PolicyBlocked(String),
    #[error("TLS required but not used")]
    TlsRequired,
    #[error("target is a private or loopback address")]
    PrivateIpBlocked,
    #[error("response exceeded maximum payload size")]
    TooLarge,
    #[error("exceeded maximum redirect count")]
    RedirectLimit,
    #[error("prompt injection detected in fetched content")]
    InjectionBlocked,
    #[error("failed to parse expression: {0}")]
    ParseError(String),
    #[error("arithmetic domain error: {0}")]
    DomainError(String),
    #[error("unit mismatch: expected {expected}, got {actual}")]
    UnitMismatch { expected: String, actual: String },
    #[error("statement is not a single SELECT")]
    NotSelect,
    #[error("forbidden SQL construct: {0}")]
    ForbiddenConstruct(String),
    #[error("table '{0}' is not allowed")]
    TableNotAllowed(String),
    #[error("rate limit exceeded for table '{0}'")]
    RateLimited(String),
    #[error("row limit exceeded")]
    RowLimitExceeded,
    #[error("query timed out")]
    Timeout,
}

/// Approval store errors.
#[derive(Error, Debug, Clone)]
pub enum ApprovalError {
    #[error("approval {id} not found")]
    NotFound { id: ApprovalId },
    #[error("approval {id} already resolved")]
    AlreadyResolved { id: ApprovalId },
    #[error("approval {id} expired")]
    Expired { id: ApprovalId },
}

/// Audit/persistence errors.
#[derive(Error, Debug, Clone)]
pub enum AuditError {
    #[error("failed to persist step record: {0}")]
    WriteFailed(String),
    #[error("failed to read step record: {0}")]
    ReadFailed(String),
    #[error("migration failed: {0}")]
    MigrationFailed(String),
}

/// Errors minting or resolving a proof-carrying number.
#[derive(Error, Debug, Clone)]
pub enum PcnError {
    #[error("pcn {id} already resolved")]
    AlreadyResolved { id: PcnId },
    #[error("pcn {id} failed verification: {reason}")]
    Failed { id: PcnId, reason: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
