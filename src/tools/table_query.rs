//! `TABLE_QUERY`: read-only SQL access to workspace corpus/memory tables
//! (spec §4.7). Enforces a SELECT-only guard, a table allowlist, a
//! per-table token-bucket rate limit, and row/time limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{json, Value};

use super::Tool;
use crate::types::error::ToolError;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "attach", "pragma", "union", "exec",
    "replace", "vacuum", "reindex",
];

/// Validate that `sql` is a single read-only SELECT statement touching only
/// allowed tables. Returns the lowercase statement on success.
pub fn guard_sql(sql: &str, allowed_tables: &[String]) -> Result<String, ToolError> {
    let trimmed = sql.trim();
    // A single trailing semicolon is tolerated; anything else containing
    // ';' is a stacked statement and rejected below.
    let stripped = trimmed.trim_end_matches(';');
    if stripped.contains(';') {
        return Err(ToolError::ForbiddenConstruct("stacked statements".into()));
    }
    if stripped.contains("--") || stripped.contains("/*") {
        return Err(ToolError::ForbiddenConstruct("inline comment".into()));
    }
    let lower = stripped.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return Err(ToolError::NotSelect);
    }
    for kw in FORBIDDEN_KEYWORDS {
        if lower.split(|c: char| !c.is_alphanumeric()).any(|tok| tok == *kw) {
            return Err(ToolError::ForbiddenConstruct(kw.to_string()));
        }
    }

    let referenced = extract_table_names(&lower);
    for table in &referenced {
        if !allowed_tables.iter().any(|t| t == table) {
            return Err(ToolError::TableNotAllowed(table.clone()));
        }
    }

    Ok(stripped.to_string())
}

/// Very small `FROM`/`JOIN` table-name extractor sufficient for the
/// single-table and simple-join queries this tool permits.
fn extract_table_names(lower_sql: &str) -> Vec<String> {
    let tokens: Vec<&str> = lower_sql.split_whitespace().collect();
    let mut tables = Vec::new();
    for (i, tok) in tokens.iter().enumerate() {
        if (*tok == "from" || *tok == "join") && i + 1 < tokens.len() {
            let name = tokens[i + 1].trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
            if !name.is_empty() {
                tables.push(name.to_string());
            }
        }
    }
    tables
}

/// Token-bucket rate limiter, one bucket per table name.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            refill_per_sec,
        }
    }

    pub fn check(&self, table: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(table.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_per_sec));
        bucket.try_take()
    }
}

pub struct TableQueryTool {
    pub conn: Arc<Mutex<Connection>>,
    pub allowed_tables: Vec<String>,
    pub rate_limiter: Arc<RateLimiter>,
    pub max_rows: usize,
    pub timeout: Duration,
}

#[async_trait]
impl Tool for TableQueryTool {
    fn name(&self) -> &'static str {
        "TABLE_QUERY"
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let sql = args
            .get("sql")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ParseError("missing 'sql' argument".into()))?;
        let guarded = guard_sql(sql, &self.allowed_tables)?;

        let referenced = extract_table_names(&guarded.to_lowercase());
        for table in &referenced {
            if !self.rate_limiter.check(table) {
                return Err(ToolError::RateLimited(table.clone()));
            }
        }

        let conn = self.conn.clone();
        let max_rows = self.max_rows;
        let result = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || run_query(&conn, &guarded, max_rows)),
        )
        .await
        .map_err(|_| ToolError::Timeout)?
        .map_err(|e| ToolError::ParseError(e.to_string()))??;

        Ok(result)
    }
}

fn run_query(conn: &Mutex<Connection>, sql: &str, max_rows: usize) -> Result<Value, ToolError> {
    let conn = conn.lock();
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| ToolError::ParseError(e.to_string()))?;
    let col_count = stmt.column_count();
    let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt.query([]).map_err(|e| ToolError::ParseError(e.to_string()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| ToolError::ParseError(e.to_string()))? {
        if out.len() >= max_rows {
            return Err(ToolError::RowLimitExceeded);
        }
        let mut obj = serde_json::Map::new();
        for i in 0..col_count {
            let value: rusqlite::types::Value =
                row.get(i).map_err(|e| ToolError::ParseError(e.to_string()))?;
            obj.insert(col_names[i].clone(), sqlite_value_to_json(value));
        }
        out.push(Value::Object(obj));
    }
    Ok(json!({ "rows": out }))
}

fn sqlite_value_to_json(value: rusqlite::types::Value) -> Value {
    match value {
        rusqlite::types::Value::Null => Value::Null,
        rusqlite::types::Value::Integer(i) => json!(i),
        rusqlite::types::Value::Real(f) => json!(f),
        rusqlite::types::Value::Text(s) => json!(s),
        rusqlite::types::Value::Blob(b) => json!(hex::encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_accepts_plain_select() {
        let out = guard_sql("SELECT * FROM memory", &["memory".to_string()]).unwrap();
        assert!(out.to_lowercase().starts_with("select"));
    }

    #[test]
    fn guard_rejects_non_select() {
        let err = guard_sql("DELETE FROM memory", &["memory".to_string()]).unwrap_err();
        assert!(matches!(err, ToolError::NotSelect));
    }

    #[test]
    fn guard_rejects_stacked_statements() {
        let err = guard_sql("SELECT * FROM memory; DROP TABLE memory", &["memory".to_string()])
            .unwrap_err();
        assert!(matches!(err, ToolError::ForbiddenConstruct(_)));
    }

    #[test]
    fn guard_rejects_disallowed_table() {
        let err = guard_sql("SELECT * FROM secrets", &["memory".to_string()]).unwrap_err();
        assert!(matches!(err, ToolError::TableNotAllowed(_)));
    }

    #[test]
    fn guard_rejects_union() {
        let err = guard_sql(
            "SELECT * FROM memory UNION SELECT * FROM memory",
            &["memory".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::ForbiddenConstruct(_)));
    }

    #[test]
    fn guard_rejects_comment_injection() {
        let err = guard_sql("SELECT * FROM memory -- ; DROP TABLE memory", &["memory".to_string()])
            .unwrap_err();
        assert!(matches!(err, ToolError::ForbiddenConstruct(_)));
    }

    #[test]
    fn rate_limiter_blocks_after_capacity_exhausted() {
        let limiter = RateLimiter::new(2.0, 0.0);
        assert!(limiter.check("memory"));
        assert!(limiter.check("memory"));
        assert!(!limiter.check("memory"));
    }

    #[tokio::test]
    async fn table_query_tool_runs_select_against_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE memory (id INTEGER, text TEXT)", []).unwrap();
        conn.execute("INSERT INTO memory VALUES (1, 'hello')", []).unwrap();
        let tool = TableQueryTool {
            conn: Arc::new(Mutex::new(conn)),
            allowed_tables: vec!["memory".to_string()],
            rate_limiter: Arc::new(RateLimiter::new(10.0, 10.0)),
            max_rows: 100,
            timeout: Duration::from_secs(5),
        };
        let out = tool.invoke(&json!({ "sql": "SELECT * FROM memory" })).await.unwrap();
        assert_eq!(out["rows"][0]["text"], "hello");
    }
}
