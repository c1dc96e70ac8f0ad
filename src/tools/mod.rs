//! Tool dispatch (spec §4.7): `WEB_SEARCH`, `WEB_FETCH`, `MATH_EVAL`,
//! `TABLE_QUERY`, plus the budget-enforcing dispatcher and egress/SQL guards.

pub mod circuit_breaker;
pub mod egress;
pub mod math_eval;
pub mod table_query;
#[cfg(feature = "web-tools")]
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::error::ToolError;
use circuit_breaker::CircuitBreakerRegistry;

/// The outcome of dispatching one tool call (Design Notes §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok { output: Value },
    Blocked { reason: String },
    Failed { error: String },
    WaitingApproval { approval_id: crate::types::ApprovalId },
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    async fn invoke(&self, args: &Value) -> Result<Value, ToolError>;
}

/// Per-turn/per-refinement tool call budget (spec §4.6 design notes).
#[derive(Debug, Clone, Copy)]
pub struct ToolBudget {
    pub per_turn: u32,
    pub per_refinement: u32,
}

impl Default for ToolBudget {
    fn default() -> Self {
        Self {
            per_turn: 4,
            per_refinement: 2,
        }
    }
}

/// Tracks consumption of a `ToolBudget` across a single request's lifetime.
#[derive(Debug, Default)]
pub struct BudgetTracker {
    turn_used: u32,
    refinement_used: u32,
}

impl BudgetTracker {
    pub fn reset_refinement(&mut self) {
        self.refinement_used = 0;
    }

    pub fn try_consume(&mut self, budget: &ToolBudget) -> bool {
        if self.turn_used >= budget.per_turn || self.refinement_used >= budget.per_refinement {
            return false;
        }
        self.turn_used += 1;
        self.refinement_used += 1;
        true
    }
}

/// Registry of tools keyed by name, plus shared circuit breaker state.
pub struct ToolDispatcher {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub call_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(circuit_breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            tools: HashMap::new(),
            circuit_breakers,
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Dispatch one call by name. Checks the workspace allowlist first (the
    /// caller provides it, since it is policy-specific), then the circuit
    /// breaker, then runs the tool under a timeout.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &Value,
        allowed_tools: &[String],
    ) -> ToolOutcome {
        if !allowed_tools.iter().any(|t| t == name) {
            return ToolOutcome::Blocked {
                reason: format!("tool '{name}' is not in the workspace allowlist"),
            };
        }

        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::Failed {
                error: format!("unknown tool '{name}'"),
            };
        };

        if let Err(cb_err) = self.circuit_breakers.check(name).await {
            return ToolOutcome::Blocked {
                reason: cb_err.to_string(),
            };
        }

        let result = tokio::time::timeout(self.call_timeout, tool.invoke(args)).await;

        match result {
            Ok(Ok(output)) => {
                self.circuit_breakers.record_success(name).await;
                ToolOutcome::Ok { output }
            }
            Ok(Err(err)) => {
                self.circuit_breakers.record_failure(name).await;
                ToolOutcome::Failed { error: err.to_string() }
            }
            Err(_) => {
                self.circuit_breakers.record_failure(name).await;
                ToolOutcome::Failed {
                    error: ToolError::Timeout.to_string(),
                }
            }
        }
    }
}
