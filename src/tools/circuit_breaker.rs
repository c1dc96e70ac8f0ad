//! Per-tool circuit breaker.
//!
//! Prevents cascade failures by tracking tool health and fast-failing when a
//! circuit is open. Implements the standard Closed → Open → Half-Open state
//! machine, keyed per tool name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

#[derive(Debug)]
struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("circuit open for tool '{tool_name}': {consecutive_failures} consecutive failures, recovery in {recovery_remaining:?}")]
pub struct CircuitOpenError {
    pub tool_name: String,
    pub consecutive_failures: u32,
    pub recovery_remaining: Duration,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
        }
    }

    fn check(&mut self, tool_name: &str) -> Result<(), CircuitOpenError> {
        match &self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 1;
                    tracing::info!(tool = tool_name, "circuit transitioning to half-open");
                    Ok(())
                } else {
                    let remaining = self.config.recovery_timeout - opened_at.elapsed();
                    Err(CircuitOpenError {
                        tool_name: tool_name.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: remaining,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        tool_name: tool_name.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: Duration::from_secs(0),
                    })
                }
            }
        }
    }

    fn record_success(&mut self, tool_name: &str) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.half_open_calls = 0;
                tracing::info!(tool = tool_name, "circuit recovered, now closed");
            }
            CircuitState::Open { .. } => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
            }
        }
    }

    fn record_failure(&mut self, tool_name: &str) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open { opened_at: Instant::now() };
                    tracing::warn!(tool = tool_name, failures = self.failure_count, "circuit tripped open");
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open { opened_at: Instant::now() };
                self.half_open_calls = 0;
                tracing::warn!(tool = tool_name, "circuit recovery failed, back to open");
            }
            CircuitState::Open { .. } => self.failure_count += 1,
        }
    }
}

/// Registry of circuit breakers for all tool endpoints.
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    pub async fn check(&self, tool_name: &str) -> Result<(), CircuitOpenError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(tool_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.check(tool_name)
    }

    pub async fn record_success(&self, tool_name: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(tool_name) {
            breaker.record_success(tool_name);
        }
    }

    pub async fn record_failure(&self, tool_name: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(tool_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.record_failure(tool_name);
    }

    pub async fn get_state(&self, tool_name: &str) -> Option<CircuitState> {
        let breakers = self.breakers.read().await;
        breakers.get(tool_name).map(|b| b.state.clone())
    }
}
