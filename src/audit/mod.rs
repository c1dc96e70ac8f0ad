//! Step audit trail (spec §3, §4.9, §6.4): every completed step (compose →
//! assess → decide, possibly repeated through refinement) is persisted as a
//! `StepRecord`, with the question/answer text redacted before write.
//! Backed by SQLite in WAL mode with idempotent, ordered migrations run at
//! startup, mirroring the job-store pattern used elsewhere in this codebase.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::decision::Action;
use crate::types::error::{AuditError, EngineResult};
use crate::types::{Domain, RequestId, StepRecordId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: StepRecordId,
    pub request_id: RequestId,
    pub domain: Domain,
    pub refinement_index: u32,
    pub question_redacted: String,
    pub answer_redacted: String,
    pub s1: f32,
    pub s2: f32,
    pub s: f32,
    pub cp_accept: Option<bool>,
    pub action: Action,
    pub pack_ids: Vec<String>,
    pub tools_used: Vec<String>,
    pub issues: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Masks common personal-identifier patterns (emails, long digit runs
/// resembling phone/SSN-like sequences) before a question or answer is
/// persisted, per spec §6.4.
pub fn redact(text: &str) -> String {
    let email = Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap();
    let digits = Regex::new(r"\b\d{7,}\b").unwrap();
    let redacted = email.replace_all(text, "[redacted-email]");
    digits.replace_all(&redacted, "[redacted-number]").into_owned()
}

const MIGRATIONS: &[&str] = &[
    // v1: schema_version bookkeeping + steps table.
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
     INSERT OR IGNORE INTO schema_version (version) VALUES (0);
     CREATE TABLE IF NOT EXISTS steps (
         id               TEXT PRIMARY KEY,
         request_id       TEXT NOT NULL,
         domain           TEXT NOT NULL,
         refinement_index INTEGER NOT NULL,
         question_redacted TEXT NOT NULL,
         answer_redacted  TEXT NOT NULL,
         s1               REAL NOT NULL,
         s2               REAL NOT NULL,
         s                REAL NOT NULL,
         action           TEXT NOT NULL,
         created_at       TEXT NOT NULL
     );",
    // v2: indices required by spec §6.4.
    "CREATE INDEX IF NOT EXISTS idx_steps_request_created ON steps(request_id, created_at DESC);
     CREATE INDEX IF NOT EXISTS idx_steps_domain ON steps(domain);",
    // v3: calibration artifacts table + its indices.
    "CREATE TABLE IF NOT EXISTS cp_artifacts (
         run_id    TEXT NOT NULL,
         domain    TEXT NOT NULL,
         score     REAL NOT NULL,
         accepted  INTEGER NOT NULL,
         correct   INTEGER NOT NULL,
         created_at TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_cp_artifacts_run ON cp_artifacts(run_id);
     CREATE INDEX IF NOT EXISTS idx_cp_artifacts_domain ON cp_artifacts(domain);",
    // v4: per-step cp_accept/pack_ids/tools_used/issues, added for the full
    // AgentResult shape (spec §6.3, §6.4). JSON-encoded arrays rather than a
    // side table since steps are never queried by pack/tool/issue membership.
    "ALTER TABLE steps ADD COLUMN cp_accept INTEGER;
     ALTER TABLE steps ADD COLUMN pack_ids TEXT NOT NULL DEFAULT '[]';
     ALTER TABLE steps ADD COLUMN tools_used TEXT NOT NULL DEFAULT '[]';
     ALTER TABLE steps ADD COLUMN issues TEXT NOT NULL DEFAULT '[]';",
];

/// SQLite-backed step audit store. Migrations are idempotent (`CREATE TABLE
/// IF NOT EXISTS`) and ordered, applied once at `open()` based on the
/// current `schema_version` row.
pub struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AuditError::MigrationFailed(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| AuditError::WriteFailed(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AuditError::MigrationFailed(e.to_string()))?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| AuditError::WriteFailed(e.to_string()))?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &Connection) -> EngineResult<()> {
        conn.execute_batch(MIGRATIONS[0]).map_err(|e| AuditError::MigrationFailed(e.to_string()))?;
        let current: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .map_err(|e| AuditError::MigrationFailed(e.to_string()))?;
        for (i, migration) in MIGRATIONS.iter().enumerate().skip(1) {
            let version = i as i64;
            if version > current {
                conn.execute_batch(migration).map_err(|e| AuditError::MigrationFailed(e.to_string()))?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
                    .map_err(|e| AuditError::MigrationFailed(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub async fn write(&self, record: &StepRecord) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO steps (id, request_id, domain, refinement_index, question_redacted, answer_redacted, s1, s2, s, cp_accept, action, pack_ids, tools_used, issues, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            rusqlite::params![
                record.id.to_string(),
                record.request_id.to_string(),
                record.domain.0,
                record.refinement_index,
                record.question_redacted,
                record.answer_redacted,
                record.s1,
                record.s2,
                record.s,
                record.cp_accept,
                serde_json::to_string(&record.action).unwrap_or_default(),
                serde_json::to_string(&record.pack_ids).unwrap_or_default(),
                serde_json::to_string(&record.tools_used).unwrap_or_default(),
                serde_json::to_string(&record.issues).unwrap_or_default(),
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| AuditError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Fetch one step record by id for `GET /steps/{id}` (spec §6.2).
    pub async fn get_by_id(&self, id: StepRecordId) -> EngineResult<Option<StepRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, request_id, domain, refinement_index, question_redacted, answer_redacted,
                        s1, s2, s, cp_accept, action, pack_ids, tools_used, issues, created_at
                 FROM steps WHERE id = ?1",
            )
            .map_err(|e| AuditError::ReadFailed(e.to_string()))?;
        let record = stmt
            .query_row([id.to_string()], |row| {
                let action_raw: String = row.get(10)?;
                let pack_ids_raw: String = row.get(11)?;
                let tools_used_raw: String = row.get(12)?;
                let issues_raw: String = row.get(13)?;
                let created_at_raw: String = row.get(14)?;
                Ok(StepRecord {
                    id: row.get::<_, String>(0)?.parse().unwrap_or(id),
                    request_id: row.get::<_, String>(1)?.parse().unwrap_or_else(|_| RequestId::new()),
                    domain: Domain(row.get(2)?),
                    refinement_index: row.get(3)?,
                    question_redacted: row.get(4)?,
                    answer_redacted: row.get(5)?,
                    s1: row.get(6)?,
                    s2: row.get(7)?,
                    s: row.get(8)?,
                    cp_accept: row.get(9)?,
                    action: serde_json::from_str(&action_raw).unwrap_or(Action::Abstain),
                    pack_ids: serde_json::from_str(&pack_ids_raw).unwrap_or_default(),
                    tools_used: serde_json::from_str(&tools_used_raw).unwrap_or_default(),
                    issues: serde_json::from_str(&issues_raw).unwrap_or_default(),
                    created_at: created_at_raw.parse().unwrap_or_else(|_| Utc::now()),
                })
            })
            .optional()
            .map_err(|e| AuditError::ReadFailed(e.to_string()))?;
        Ok(record)
    }

    pub async fn recent(&self, limit: usize) -> EngineResult<Vec<StepRecordId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM steps ORDER BY created_at DESC LIMIT ?1")
            .map_err(|e| AuditError::ReadFailed(e.to_string()))?;
        let ids = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| AuditError::ReadFailed(e.to_string()))?
            .filter_map(|r| r.ok())
            .filter_map(|s| s.parse().ok())
            .collect();
        Ok(ids)
    }

    /// Delete steps older than `ttl` (default 30-90 days per spec §6.4);
    /// `cp_artifacts` use a separate, longer-lived TTL (>=90 days).
    pub async fn sweep_older_than(&self, ttl: Duration) -> EngineResult<usize> {
        let conn = self.conn.lock().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(30));
        let deleted = conn
            .execute("DELETE FROM steps WHERE created_at < ?1", [cutoff.to_rfc3339()])
            .map_err(|e| AuditError::WriteFailed(e.to_string()))?;
        Ok(deleted)
    }
}

/// Spawn a background TTL sweeper for the step table.
pub fn spawn_sweeper(store: Arc<AuditStore>, ttl: Duration, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.sweep_older_than(ttl).await {
                Ok(n) if n > 0 => tracing::info!(deleted = n, "swept expired step records"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "step sweep failed"),
            }
        }
    })
}
