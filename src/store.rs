//! Idempotent SQLite sink for harvested log entries.
//!
//! Two tables:
//! - `runs`: one row per process invocation, carrying the version and the
//!   full download config as JSON; `end_ts` is NULL while active (or after a
//!   crash).
//! - `logs`: one row per entry, `insertId` UNIQUE. Entries without an
//!   `insertId` have no natural key and are always inserted.
//!
//! Each batch is written in one IMMEDIATE transaction, so a crash never
//! leaves half a page on disk.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::gcp::LogEntry;

// =============================================================================
// Schema
// =============================================================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL,
    config TEXT NOT NULL,
    start_ts TEXT NOT NULL,
    end_ts TEXT
);

CREATE TABLE IF NOT EXISTS logs (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(run_id),
    insertId TEXT UNIQUE,
    severity TEXT,
    textPayload TEXT,
    jsonPayload TEXT,
    protoPayload TEXT,
    receiveTimestamp TEXT,
    timestamp TEXT,
    resource TEXT,
    logName TEXT,
    labels TEXT,
    trace TEXT
);

CREATE INDEX IF NOT EXISTS i_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS i_logs_receive_timestamp ON logs(receiveTimestamp);
"#;

const INSERT_LOG_SQL: &str = r#"
INSERT INTO logs (
    run_id, insertId, severity, textPayload, jsonPayload, protoPayload,
    receiveTimestamp, timestamp, resource, logName, labels, trace
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(insertId) DO NOTHING
"#;

const SELECT_LOG_COLUMNS: &str = "log_id, run_id, insertId, severity, textPayload, jsonPayload, \
     protoPayload, receiveTimestamp, timestamp, resource, logName, labels, trace";

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: i64,
    pub version: String,
    /// JSON of the `DownloadConfig` the run was started with.
    pub config: String,
    pub start_ts: String,
    pub end_ts: Option<String>,
}

impl RunRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            version: row.get(1)?,
            config: row.get(2)?,
            start_ts: row.get(3)?,
            end_ts: row.get(4)?,
        })
    }
}

/// A row of `logs`. Structured fields hold JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLog {
    pub log_id: i64,
    pub run_id: i64,
    pub insert_id: Option<String>,
    pub severity: Option<String>,
    pub text_payload: Option<String>,
    pub json_payload: Option<String>,
    pub proto_payload: Option<String>,
    pub receive_timestamp: Option<String>,
    pub timestamp: Option<String>,
    pub resource: Option<String>,
    pub log_name: Option<String>,
    pub labels: Option<String>,
    pub trace: Option<String>,
}

impl StoredLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            log_id: row.get(0)?,
            run_id: row.get(1)?,
            insert_id: row.get(2)?,
            severity: row.get(3)?,
            text_payload: row.get(4)?,
            json_payload: row.get(5)?,
            proto_payload: row.get(6)?,
            receive_timestamp: row.get(7)?,
            timestamp: row.get(8)?,
            resource: row.get(9)?,
            log_name: row.get(10)?,
            labels: row.get(11)?,
            trace: row.get(12)?,
        })
    }
}

/// Outcome of one `persist` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub inserted: usize,
    /// Entries whose `insertId` was already stored.
    pub skipped: usize,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct LogStore {
    conn: Arc<Mutex<Connection>>,
}

impl LogStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;

        info!(path = %path.display(), journal_mode = %mode, "Log store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a run row and return its id.
    pub fn begin_run(&self, version: &str, config_json: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runs (version, config, start_ts) VALUES (?1, ?2, datetime('now'))",
            params![version, config_json],
        )
        .context("Failed to insert run")?;
        Ok(conn.last_insert_rowid())
    }

    /// Stamp `end_ts` on a run.
    pub fn close_run(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET end_ts = datetime('now') WHERE run_id = ?1",
            params![run_id],
        )
        .with_context(|| format!("Failed to close run {}", run_id))?;
        Ok(())
    }

    /// The oldest run, whose scope every later run must match.
    pub fn first_run(&self) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT run_id, version, config, start_ts, end_ts FROM runs ORDER BY run_id ASC LIMIT 1",
            [],
            RunRecord::from_row,
        )
        .optional()
        .context("Failed to read first run")
    }

    pub fn run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT run_id, version, config, start_ts, end_ts FROM runs WHERE run_id = ?1",
            params![run_id],
            RunRecord::from_row,
        )
        .optional()
        .context("Failed to read run")
    }

    /// Persist one batch atomically, skipping entries whose `insertId` exists.
    pub fn persist(&self, run_id: i64, entries: &[LogEntry]) -> Result<PersistStats> {
        if entries.is_empty() {
            return Ok(PersistStats::default());
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin batch transaction")?;

        let mut stats = PersistStats::default();
        {
            let mut stmt = tx.prepare_cached(INSERT_LOG_SQL)?;
            for entry in entries {
                let changed = stmt
                    .execute(params![
                        run_id,
                        entry.insert_id,
                        entry.severity,
                        entry.text_payload,
                        json_text(entry.json_payload.as_ref())?,
                        json_text(entry.proto_payload.as_ref())?,
                        entry.receive_timestamp,
                        entry.timestamp,
                        json_text(entry.resource.as_ref())?,
                        entry.log_name,
                        json_text(entry.labels.as_ref())?,
                        entry.trace,
                    ])
                    .with_context(|| format!("Failed to insert entry {:?}", entry.insert_id))?;

                if changed == 0 {
                    stats.skipped += 1;
                } else {
                    stats.inserted += 1;
                }
            }
        }

        tx.commit().context("Failed to commit batch")?;
        Ok(stats)
    }

    /// All rows sharing the highest stored `receiveTimestamp`.
    pub fn max_receive_timestamp_rows(&self) -> Result<Vec<StoredLog>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM logs WHERE receiveTimestamp = (SELECT MAX(receiveTimestamp) FROM logs)",
            SELECT_LOG_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], StoredLog::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read high-watermark rows")?;
        Ok(rows)
    }

    pub fn count_logs(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_runs(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Stored `insertId`s in insertion order.
    pub fn insert_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT insertId FROM logs WHERE insertId IS NOT NULL ORDER BY log_id ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

fn json_text(value: Option<&Value>) -> Result<Option<String>> {
    value
        .map(|v| serde_json::to_string(v).context("Failed to serialize field"))
        .transpose()
}
