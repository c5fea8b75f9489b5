//! SQLite side index
//!
//! One `index.sqlite` per day folder carrying `(file, offset)` locations,
//! plus a `global.sqlite` summary for cross-day scans and preview
//! full-text search. Both open in WAL mode with NORMAL synchronous and a
//! checked schema version.

use crate::shard::AppendLocation;
use chrono::Utc;
use flowscope_core::error::{Error, Result};
use flowscope_core::flow::Flow;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::collections::HashSet;
use std::path::Path;

const SCHEMA_VERSION: i32 = 1;

/// Summary row shared by the per-day and global databases. Location fields
/// are only persisted in the per-day index.
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub id: String,
    pub created_at: String,
    pub day: String,
    pub provider: String,
    pub model: String,
    pub state: String,
    pub duration_ms: Option<i64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub has_error: bool,
    pub has_tool_calls: bool,
    pub has_thinking: bool,
    pub is_streaming: bool,
    pub starred: bool,
    /// Comma-fenced (",a,b,") so exact tag match is a LIKE.
    pub tags: String,
    pub file: String,
    pub offset: i64,
    pub content_preview: String,
    pub request_preview: String,
}

pub fn fence_tags<'a>(tags: impl Iterator<Item = &'a String>) -> String {
    let joined: Vec<&str> = tags.map(String::as_str).collect();
    if joined.is_empty() {
        String::new()
    } else {
        format!(",{},", joined.join(","))
    }
}

impl IndexRow {
    pub fn from_flow(flow: &Flow, location: &AppendLocation) -> Self {
        let usage = flow.response.as_ref().map(|r| r.usage);
        Self {
            id: flow.id.clone(),
            created_at: flow.timestamps.created.to_rfc3339(),
            day: location.day.clone(),
            provider: flow.metadata.provider.clone(),
            model: flow.request.model.clone(),
            state: flow.state.as_str().to_string(),
            duration_ms: flow.timestamps.duration_ms.map(|d| d as i64),
            input_tokens: usage.map(|u| u.input_tokens as i64).unwrap_or(0),
            output_tokens: usage.map(|u| u.output_tokens as i64).unwrap_or(0),
            total_tokens: usage.map(|u| u.total() as i64).unwrap_or(0),
            has_error: flow.has_error(),
            has_tool_calls: flow.has_tool_calls(),
            has_thinking: flow.has_thinking(),
            is_streaming: flow.is_streaming(),
            starred: flow.annotations.starred,
            tags: fence_tags(flow.annotations.tags.iter()),
            file: location.file.clone(),
            offset: location.offset as i64,
            content_preview: flow.content_preview(),
            request_preview: flow.request_preview(),
        }
    }
}

/// Index-friendly predicates pushed down from the filter engine.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub provider: Option<String>,
    /// SQL LIKE patterns (`%` wildcards), any-of.
    pub model_like_any: Vec<String>,
    pub states: Vec<String>,
    pub has_error: Option<bool>,
    pub has_tool_calls: Option<bool>,
    pub has_thinking: Option<bool>,
    pub is_streaming: Option<bool>,
    pub starred: Option<bool>,
    pub tags: Vec<String>,
    pub min_total_tokens: Option<i64>,
    pub max_total_tokens: Option<i64>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    /// RFC3339 bounds on created_at.
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<i64>,
}

/// A matching row, enough to hydrate the Flow from disk.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub day: String,
    pub created_at: String,
}

enum Kind {
    Global,
    Day,
}

pub struct IndexDb {
    pool: SqlitePool,
    kind: Kind,
}

impl IndexDb {
    pub async fn open_global(path: &Path) -> Result<Self> {
        let db = Self {
            pool: open_pool(path, 5).await?,
            kind: Kind::Global,
        };
        db.init_schema().await?;
        Ok(db)
    }

    pub async fn open_day(path: &Path) -> Result<Self> {
        let db = Self {
            pool: open_pool(path, 2).await?,
            kind: Kind::Day,
        };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        exec(&self.pool, "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)").await?;
        exec(
            &self.pool,
            &format!("INSERT OR IGNORE INTO schema_version (version) VALUES ({SCHEMA_VERSION})"),
        )
        .await?;
        let version: i32 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        if version != SCHEMA_VERSION {
            return Err(Error::Database(format!(
                "Unsupported index schema version: {version}"
            )));
        }

        exec(
            &self.pool,
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                day TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                state TEXT NOT NULL,
                duration_ms INTEGER,
                input_tokens INTEGER DEFAULT 0,
                output_tokens INTEGER DEFAULT 0,
                total_tokens INTEGER DEFAULT 0,
                has_error INTEGER DEFAULT 0,
                has_tool_calls INTEGER DEFAULT 0,
                has_thinking INTEGER DEFAULT 0,
                is_streaming INTEGER DEFAULT 0,
                starred INTEGER DEFAULT 0,
                tags TEXT DEFAULT '',
                file TEXT DEFAULT '',
                file_offset INTEGER DEFAULT 0,
                content_preview TEXT DEFAULT '',
                request_preview TEXT DEFAULT ''
            )
            "#,
        )
        .await?;

        exec(&self.pool, "CREATE INDEX IF NOT EXISTS idx_flows_created ON flows(created_at DESC)").await?;
        exec(&self.pool, "CREATE INDEX IF NOT EXISTS idx_flows_provider ON flows(provider, created_at DESC)").await?;
        exec(&self.pool, "CREATE INDEX IF NOT EXISTS idx_flows_model ON flows(model, created_at DESC)").await?;
        exec(&self.pool, "CREATE INDEX IF NOT EXISTS idx_flows_state ON flows(state, created_at DESC)").await?;

        // Tombstones for explicit purges; replay checks these before it
        // re-inserts a shard line the index does not know about.
        exec(
            &self.pool,
            r#"
            CREATE TABLE IF NOT EXISTS deleted_flows (
                id TEXT PRIMARY KEY,
                day TEXT NOT NULL,
                deleted_at TEXT NOT NULL
            )
            "#,
        )
        .await?;

        if matches!(self.kind, Kind::Global) {
            exec(
                &self.pool,
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS flows_fts USING fts5(
                    flow_id UNINDEXED,
                    content_preview,
                    request_preview
                )
                "#,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn upsert(&self, row: &IndexRow) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::upsert_in(&mut tx, matches!(self.kind, Kind::Global), row).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Batch upsert in one transaction, used by startup replay.
    pub async fn upsert_many(&self, rows: &[IndexRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let global = matches!(self.kind, Kind::Global);
        for row in rows {
            Self::upsert_in(&mut tx, global, row).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn upsert_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        global: bool,
        row: &IndexRow,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flows (
                id, created_at, day, provider, model, state, duration_ms,
                input_tokens, output_tokens, total_tokens,
                has_error, has_tool_calls, has_thinking, is_streaming, starred,
                tags, file, file_offset, content_preview, request_preview
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                duration_ms = excluded.duration_ms,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                total_tokens = excluded.total_tokens,
                has_error = excluded.has_error,
                has_tool_calls = excluded.has_tool_calls,
                has_thinking = excluded.has_thinking,
                is_streaming = excluded.is_streaming,
                starred = excluded.starred,
                tags = excluded.tags,
                file = excluded.file,
                file_offset = excluded.file_offset,
                content_preview = excluded.content_preview,
                request_preview = excluded.request_preview
            "#,
        )
        .bind(&row.id)
        .bind(&row.created_at)
        .bind(&row.day)
        .bind(&row.provider)
        .bind(&row.model)
        .bind(&row.state)
        .bind(row.duration_ms)
        .bind(row.input_tokens)
        .bind(row.output_tokens)
        .bind(row.total_tokens)
        .bind(row.has_error)
        .bind(row.has_tool_calls)
        .bind(row.has_thinking)
        .bind(row.is_streaming)
        .bind(row.starred)
        .bind(&row.tags)
        .bind(if global { "" } else { row.file.as_str() })
        .bind(if global { 0 } else { row.offset })
        .bind(&row.content_preview)
        .bind(&row.request_preview)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        if global {
            sqlx::query("DELETE FROM flows_fts WHERE flow_id = ?")
                .bind(&row.id)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            sqlx::query(
                "INSERT INTO flows_fts (flow_id, content_preview, request_preview) VALUES (?, ?, ?)",
            )
            .bind(&row.id)
            .bind(&row.content_preview)
            .bind(&row.request_preview)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    /// Global: which day folder holds this id.
    pub async fn locate_day(&self, id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT day FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get::<String, _>("day")))
    }

    /// Per-day: where on disk this id lives.
    pub async fn locate(&self, id: &str) -> Result<Option<(String, u64)>> {
        let row = sqlx::query("SELECT file, file_offset FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| {
            (
                r.get::<String, _>("file"),
                r.get::<i64, _>("file_offset").max(0) as u64,
            )
        }))
    }

    /// Candidate rows matching the pushed-down predicates, newest first.
    pub async fn candidates(&self, query: &IndexQuery) -> Result<Vec<Candidate>> {
        let (where_clause, binds) = build_where_clause(query);
        let mut sql = format!(
            "SELECT id, day, created_at FROM flows{} ORDER BY created_at DESC, id DESC",
            where_clause
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query(&sql);
        for value in &binds {
            q = q.bind(value);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| Candidate {
                id: r.get("id"),
                day: r.get("day"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Coarse preview search over the FTS table; results must be rechecked
    /// against hydrated flows.
    pub async fn search_previews(&self, text: &str, limit: usize) -> Result<Vec<String>> {
        let match_expr = fts_match_expr(text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT flow_id FROM flows_fts WHERE flows_fts MATCH ? LIMIT ?",
        )
        .bind(match_expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("flow_id")).collect())
    }

    /// Remove every row (and FTS entry) for a reclaimed day.
    pub async fn delete_day(&self, day: &str) -> Result<u64> {
        if matches!(self.kind, Kind::Global) {
            sqlx::query(
                "DELETE FROM flows_fts WHERE flow_id IN (SELECT id FROM flows WHERE day = ?)",
            )
            .bind(day)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        let result = sqlx::query("DELETE FROM flows WHERE day = ?")
            .bind(day)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        // Tombstones outlive their flow rows, not their day
        sqlx::query("DELETE FROM deleted_flows WHERE day = ?")
            .bind(day)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// Record tombstones for an explicit purge. Idempotent; the id may
    /// never be reused, so the rows only leave with their day.
    pub async fn mark_deleted(&self, ids: &[String], day: &str) -> Result<()> {
        let deleted_at = Utc::now().to_rfc3339();
        for id in ids {
            sqlx::query(
                "INSERT OR IGNORE INTO deleted_flows (id, day, deleted_at) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(day)
            .bind(&deleted_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    /// Every tombstoned id this index knows about.
    pub async fn deleted_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM deleted_flows")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    pub async fn delete_ids(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            if matches!(self.kind, Kind::Global) {
                sqlx::query("DELETE FROM flows_fts WHERE flow_id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
            sqlx::query("DELETE FROM flows WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Per-day: ids and offsets recorded for one shard file, offset order.
    pub async fn rows_for_file(&self, file: &str) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query("SELECT id, file_offset FROM flows WHERE file = ? ORDER BY file_offset ASC")
            .bind(file)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get::<i64, _>("file_offset").max(0) as u64))
            .collect())
    }

    /// Per-day: drop index rows pointing at or past `offset` in `file`.
    pub async fn delete_rows_past(&self, file: &str, offset: u64) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM flows WHERE file = ? AND file_offset >= ?")
            .bind(file)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let ids: Vec<String> = rows.into_iter().map(|r| r.get("id")).collect();
        sqlx::query("DELETE FROM flows WHERE file = ? AND file_offset >= ?")
            .bind(file)
            .bind(offset as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(ids)
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as u64)
    }
}

async fn open_pool(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
        )
        .await
        .map_err(db_err)
}

async fn exec(pool: &SqlitePool, sql: &str) -> Result<()> {
    sqlx::query(sql).execute(pool).await.map_err(db_err)?;
    Ok(())
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn build_where_clause(query: &IndexQuery) -> (String, Vec<String>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(provider) = &query.provider {
        clauses.push("LOWER(provider) = LOWER(?)".to_string());
        binds.push(provider.clone());
    }
    if !query.model_like_any.is_empty() {
        let ors: Vec<String> = query
            .model_like_any
            .iter()
            .map(|pattern| {
                binds.push(pattern.clone());
                "LOWER(model) LIKE LOWER(?)".to_string()
            })
            .collect();
        clauses.push(format!("({})", ors.join(" OR ")));
    }
    if !query.states.is_empty() {
        let ors: Vec<String> = query
            .states
            .iter()
            .map(|state| {
                binds.push(state.clone());
                "state = ?".to_string()
            })
            .collect();
        clauses.push(format!("({})", ors.join(" OR ")));
    }
    for (column, value) in [
        ("has_error", query.has_error),
        ("has_tool_calls", query.has_tool_calls),
        ("has_thinking", query.has_thinking),
        ("is_streaming", query.is_streaming),
        ("starred", query.starred),
    ] {
        if let Some(value) = value {
            clauses.push(format!("{column} = {}", value as i32));
        }
    }
    for tag in &query.tags {
        clauses.push("tags LIKE ?".to_string());
        binds.push(format!("%,{tag},%"));
    }
    if let Some(min) = query.min_total_tokens {
        clauses.push(format!("total_tokens >= {min}"));
    }
    if let Some(max) = query.max_total_tokens {
        clauses.push(format!("total_tokens <= {max}"));
    }
    if let Some(min) = query.min_duration_ms {
        clauses.push(format!("duration_ms >= {min}"));
    }
    if let Some(max) = query.max_duration_ms {
        clauses.push(format!("duration_ms <= {max}"));
    }
    if let Some(since) = &query.since {
        clauses.push("created_at >= ?".to_string());
        binds.push(since.clone());
    }
    if let Some(until) = &query.until {
        clauses.push("created_at <= ?".to_string());
        binds.push(until.clone());
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

/// Quote each term so user text cannot inject FTS syntax.
fn fts_match_expr(text: &str) -> String {
    text.split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
