//! Idempotency replay (spec §6.2, §6.8): caches the terminal `AgentResult`
//! for a `(workspace, idempotency_key)` pair so a retried request within the
//! TTL window replays the same answer instead of re-running refinement.
//! Mirrors the approval store's TTL-map-plus-sweeper shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::stream::AgentResult;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

struct Entry {
    result: AgentResult,
    expires_at: DateTime<Utc>,
}

/// Process-wide cache of recent terminal results, keyed by workspace and
/// caller-supplied idempotency key.
pub struct IdempotencyStore {
    entries: DashMap<(String, String), Entry>,
    ttl: Duration,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Return the cached result for this key if present and unexpired.
    pub fn get(&self, workspace: &str, key: &str) -> Option<AgentResult> {
        let map_key = (workspace.to_string(), key.to_string());
        let entry = self.entries.get(&map_key)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(entry.result.clone())
    }

    /// Cache a terminal result for `ttl` from now, overwriting any prior
    /// entry for the same key.
    pub fn put(&self, workspace: &str, key: &str, result: AgentResult) {
        let expires_at = Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(600));
        self.entries.insert((workspace.to_string(), key.to_string()), Entry { result, expires_at });
    }

    /// Drop every entry past its TTL. Intended to run on an interval from a
    /// background task, same as the approval sweeper.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

/// Spawn a background sweeper that periodically evicts expired cache entries.
pub fn spawn_sweeper(store: Arc<IdempotencyStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = store.sweep_expired();
            if evicted > 0 {
                tracing::info!(evicted, "swept expired idempotency entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Action;
    use crate::stream::Usage;
    use crate::types::RequestId;

    fn sample() -> AgentResult {
        AgentResult {
            request_id: RequestId::new(),
            answer: "cached answer".into(),
            action: Action::Accept,
            s1: 0.9,
            s2: 0.9,
            final_score: 0.9,
            cp_accept: Some(true),
            cp_tau: Some(0.7),
            issues: Vec::new(),
            tools_used: Vec::new(),
            pack_ids: vec!["1".into()],
            trace: Vec::new(),
            latency_ms: 5,
            usage: Usage::default(),
        }
    }

    #[test]
    fn put_then_get_replays_same_result() {
        let store = IdempotencyStore::default();
        store.put("ws1", "key1", sample());
        let replayed = store.get("ws1", "key1").expect("cached");
        assert_eq!(replayed.answer, "cached answer");
    }

    #[test]
    fn different_workspace_is_a_cache_miss() {
        let store = IdempotencyStore::default();
        store.put("ws1", "key1", sample());
        assert!(store.get("ws2", "key1").is_none());
    }

    #[test]
    fn expired_entry_is_not_replayed() {
        let store = IdempotencyStore::new(Duration::from_millis(1));
        store.put("ws1", "key1", sample());
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.get("ws1", "key1").is_none());
    }

    #[test]
    fn sweep_evicts_only_expired_entries() {
        let store = IdempotencyStore::new(Duration::from_millis(1));
        store.put("ws1", "key1", sample());
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.sweep_expired(), 0);
    }
}
