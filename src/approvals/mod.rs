//! Approvals (spec §4.8): process-wide store of pending human-in-the-loop
//! decisions for tools flagged `tools_requiring_approval`. Each approval has
//! a TTL after which it expires automatically; a background sweeper and a
//! per-approval notify handle let a waiting refinement turn wake up as soon
//! as a decision lands instead of polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::types::error::{ApprovalError, EngineResult};
use crate::types::ApprovalId;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub tool_name: String,
    pub args_summary: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl ApprovalRequest {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && now >= self.expires_at
    }
}

struct Entry {
    request: ApprovalRequest,
    notify: Arc<Notify>,
}

/// Process-wide, in-memory approval store. A real deployment would persist
/// this alongside `StepRecord`s, but the decision lifecycle itself (pending
/// → approved/denied/expired) is purely in-process.
pub struct ApprovalStore {
    entries: DashMap<ApprovalId, Entry>,
    ttl: Duration,
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ApprovalStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Register a new pending approval and return its id.
    pub fn request(&self, tool_name: &str, args_summary: &str) -> ApprovalId {
        let id = ApprovalId::new();
        let now = Utc::now();
        let request = ApprovalRequest {
            id,
            tool_name: tool_name.to_string(),
            args_summary: args_summary.to_string(),
            requested_at: now,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(1800)),
            status: ApprovalStatus::Pending,
        };
        self.entries.insert(
            id,
            Entry {
                request,
                notify: Arc::new(Notify::new()),
            },
        );
        id
    }

    pub fn get(&self, id: ApprovalId) -> EngineResult<ApprovalRequest> {
        self.entries
            .get(&id)
            .map(|e| e.request.clone())
            .ok_or_else(|| ApprovalError::NotFound { id }.into())
    }

    /// Resolve a pending approval as approved or denied.
    pub fn resolve(&self, id: ApprovalId, approved: bool) -> EngineResult<()> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or(ApprovalError::NotFound { id })?;
        if entry.request.is_expired(Utc::now()) {
            entry.request.status = ApprovalStatus::Expired;
            return Err(ApprovalError::Expired { id }.into());
        }
        if entry.request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved { id }.into());
        }
        entry.request.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        entry.notify.notify_waiters();
        Ok(())
    }

    /// Wait until the approval resolves (approved/denied/expired) or the
    /// given timeout elapses, whichever comes first. Returns the resolved
    /// status; a timed-out wait returns whatever status the approval has at
    /// that moment (usually still `Pending`, treated by the caller as
    /// `WaitingApproval`).
    pub async fn wait(&self, id: ApprovalId, timeout: Duration) -> EngineResult<ApprovalStatus> {
        let notify = {
            let entry = self.entries.get(&id).ok_or(ApprovalError::NotFound { id })?;
            if entry.request.status != ApprovalStatus::Pending {
                return Ok(entry.request.status);
            }
            entry.notify.clone()
        };
        let _ = tokio::time::timeout(timeout, notify.notified()).await;
        let status = self
            .entries
            .get(&id)
            .map(|e| e.request.status)
            .ok_or(ApprovalError::NotFound { id })?;
        Ok(status)
    }

    /// Sweep all pending approvals past their TTL, marking them expired and
    /// waking any waiters so they can surface the expiry. Intended to run on
    /// an interval from a background task.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut expired = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.request.is_expired(now) {
                entry.request.status = ApprovalStatus::Expired;
                entry.notify.notify_waiters();
                expired += 1;
            }
        }
        expired
    }

    /// Snapshot of all known approvals, for diagnostics/testing.
    pub fn snapshot(&self) -> HashMap<ApprovalId, ApprovalRequest> {
        self.entries.iter().map(|e| (*e.key(), e.request.clone())).collect()
    }
}

/// Spawn a background sweeper that periodically expires stale approvals.
pub fn spawn_sweeper(store: Arc<ApprovalStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let expired = store.sweep_expired();
            if expired > 0 {
                tracing::info!(expired, "swept expired approvals");
            }
        }
    })
}
