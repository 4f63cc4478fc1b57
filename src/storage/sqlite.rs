//! SQLite execution sink.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::models::{RunQuery, RunRecord};
use super::sink::ExecutionSink;
use crate::engine::{ExecutionResult, ResultStatus, RunMode, RunState, RunStatus};
use crate::error::{Error, Result};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conversion_error(Box::new(e)))
}

fn conversion_error(e: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e)
}

fn parse_mode(s: &str) -> RunMode {
    match s {
        "trigger" => RunMode::Trigger,
        "retry" => RunMode::Retry,
        "error_handler" => RunMode::ErrorHandler,
        _ => RunMode::Manual,
    }
}

fn parse_result_status(s: &str) -> ResultStatus {
    match s {
        "success" => ResultStatus::Success,
        "skipped" => ResultStatus::Skipped,
        _ => ResultStatus::Error,
    }
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

/// SQLite-backed execution sink.
#[derive(Clone)]
pub struct SqliteSink {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                failure TEXT,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_results (
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                run_index INTEGER NOT NULL,
                node_name TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                branches TEXT NOT NULL,
                item_errors TEXT NOT NULL,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                PRIMARY KEY (run_id, node_id, run_index),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_node_results_run ON node_results(run_id, started_at);
            "#,
        )?;
        Ok(())
    }

    fn upsert_run(conn: &Connection, state: &RunState) -> Result<()> {
        let failure = state
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let serialized = serde_json::to_string(state)?;

        conn.execute(
            "INSERT INTO runs
             (id, workflow_id, workflow_name, mode, status, started_at, finished_at, failure, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                failure = excluded.failure,
                state = excluded.state,
                updated_at = excluded.updated_at",
            params![
                state.run_id,
                state.workflow_id,
                state.workflow_name,
                state.mode.as_str(),
                state.status.as_str(),
                state.started_at.to_rfc3339(),
                state.finished_at.map(|t| t.to_rfc3339()),
                failure,
                serialized,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Node results stored for a run, in execution order.
    pub async fn node_results(&self, run_id: &str) -> Result<Vec<ExecutionResult>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT node_id, node_name, run_index, status, attempts, branches, item_errors, error,
                    started_at, finished_at, duration_ms
             FROM node_results WHERE run_id = ?1 ORDER BY started_at, rowid",
        )?;

        let results = stmt
            .query_map([run_id], |row| {
                let error: Option<String> = row.get(7)?;
                Ok(ExecutionResult {
                    node_id: row.get(0)?,
                    node_name: row.get(1)?,
                    run_index: row.get(2)?,
                    status: parse_result_status(&row.get::<_, String>(3)?),
                    attempts: row.get(4)?,
                    branches: parse_json(&row.get::<_, String>(5)?)?,
                    item_errors: parse_json(&row.get::<_, String>(6)?)?,
                    error: error.as_deref().map(parse_json).transpose()?,
                    started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
                    finished_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
                    duration_ms: row.get::<_, i64>(10)?.max(0) as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(results)
    }

    /// List runs, newest first.
    pub async fn list_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock().await;

        let mut sql = String::from(
            "SELECT id, workflow_id, workflow_name, mode, status, started_at, finished_at, failure
             FROM runs WHERE 1=1",
        );
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(workflow_id) = &query.workflow_id {
            sql.push_str(" AND workflow_id = ?");
            bind.push(SqlValue::Text(workflow_id.clone()));
        }

        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            bind.push(SqlValue::Text(status.as_str().to_string()));
        }

        if let Some(started_after) = &query.started_after {
            sql.push_str(" AND started_at >= ?");
            bind.push(SqlValue::Text(started_after.to_rfc3339()));
        }

        sql.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");
        let limit = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit.min(MAX_QUERY_LIMIT)
        };
        bind.push(SqlValue::Integer(limit as i64));
        bind.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// Delete a run and its node results.
    pub async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM runs WHERE id = ?1", [run_id])?;
        Ok(deleted > 0)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
        let status: String = row.get(4)?;
        let failure: Option<String> = row.get(7)?;
        Ok(RunRecord {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            mode: parse_mode(&row.get::<_, String>(3)?),
            status: status.parse().unwrap_or(RunStatus::Error),
            started_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            finished_at: row
                .get::<_, Option<String>>(6)?
                .map(|s| parse_datetime_utc(&s))
                .transpose()?,
            failure: failure.as_deref().map(parse_json).transpose()?,
        })
    }
}

#[async_trait]
impl ExecutionSink for SqliteSink {
    async fn run_started(&self, state: &RunState) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::upsert_run(&conn, state)
    }

    async fn record_result(&self, run_id: &str, result: &ExecutionResult) -> Result<()> {
        let conn = self.conn.lock().await;
        let error = result
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO node_results
             (run_id, node_id, run_index, node_name, status, attempts, branches, item_errors, error,
              started_at, finished_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(run_id, node_id, run_index) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                branches = excluded.branches,
                item_errors = excluded.item_errors,
                error = excluded.error,
                finished_at = excluded.finished_at,
                duration_ms = excluded.duration_ms",
            params![
                run_id,
                result.node_id,
                result.run_index,
                result.node_name,
                result.status.as_str(),
                result.attempts,
                serde_json::to_string(&result.branches)?,
                serde_json::to_string(&result.item_errors)?,
                error,
                result.started_at.to_rfc3339(),
                result.finished_at.to_rfc3339(),
                result.duration_ms as i64,
            ],
        )?;
        Ok(())
    }

    async fn save_state(&self, state: &RunState) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::upsert_run(&conn, state)
    }

    async fn load_state(&self, run_id: &str) -> Result<Option<RunState>> {
        let conn = self.conn.lock().await;
        let serialized: Option<String> = conn
            .query_row("SELECT state FROM runs WHERE id = ?1", [run_id], |row| {
                row.get(0)
            })
            .optional()?;

        serialized
            .map(|s| {
                serde_json::from_str(&s).map_err(|e| {
                    Error::Storage(format!("Corrupt state for run {}: {}", run_id, e))
                })
            })
            .transpose()
    }
}
