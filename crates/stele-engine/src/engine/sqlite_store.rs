//! SQLite-backed step store.
//!
//! This module is feature-gated behind `sqlite-persistence`.
//!
//! Reservations run under `BEGIN IMMEDIATE` so two workers racing on the same
//! fresh key cannot both observe "absent" and both insert; concurrent
//! reservers of one key are totally ordered. Transient busy/locked conditions
//! are retried with bounded linear backoff. Only the claim and the commit are
//! transactional; the user step function never runs inside a transaction.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::engine::record::{Reservation, StepRecord, StepStatus};
use crate::engine::store::{EngineError, StepStore};

pub const DEFAULT_BUSY_RETRIES: u32 = 8;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 40;
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const SELECT_COLUMNS: &str = "workflow_id, step_key, step_id, status, output_json, \
     output_type, error_message, attempt, owner, started_at_ms, updated_at_ms";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn map_store_err(prefix: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Store(format!("{prefix}: {err}"))
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(cause, _)
            if cause.code == rusqlite::ErrorCode::DatabaseBusy
                || cause.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// SQLite-backed step store. One file per store; connections are opened per
/// operation in WAL mode so multiple processes can target the same database.
pub struct SqliteStepStore {
    db_path: PathBuf,
    lock: Mutex<()>,
    busy_retries: u32,
    retry_backoff_ms: u64,
}

impl SqliteStepStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_retry(path, DEFAULT_BUSY_RETRIES, DEFAULT_RETRY_BACKOFF_MS)
    }

    /// Store with an explicit transient-contention retry budget.
    pub fn with_retry(path: impl Into<PathBuf>, busy_retries: u32, retry_backoff_ms: u64) -> Self {
        Self {
            db_path: path.into(),
            lock: Mutex::new(()),
            busy_retries,
            retry_backoff_ms,
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, EngineError> {
        self.lock
            .lock()
            .map_err(|_| EngineError::Store("sqlite store lock poisoned".into()))
    }

    fn open_connection(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    /// Runs `op`, retrying busy/locked failures with linear backoff
    /// (`retry_backoff_ms × (attempt + 1)`), at most `busy_retries` retries.
    fn with_busy_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, rusqlite::Error>,
    ) -> Result<T, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt < self.busy_retries => {
                    let delay = self.retry_backoff_ms * u64::from(attempt + 1);
                    tracing::debug!(what, attempt, delay_ms = delay, "sqlite busy, backing off");
                    std::thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(err) => return Err(map_store_err(what, err)),
            }
        }
    }
}

fn select_step(
    conn: &Connection,
    workflow_id: &str,
    step_key: &str,
) -> Result<Option<StepRecord>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {SELECT_COLUMNS} FROM steps WHERE workflow_id = ?1 AND step_key = ?2"
        ),
        params![workflow_id, step_key],
        map_step_row,
    )
    .optional()
}

fn map_step_row(row: &rusqlite::Row<'_>) -> Result<StepRecord, rusqlite::Error> {
    let status: String = row.get(3)?;
    let status = StepStatus::parse(&status).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(StepRecord {
        workflow_id: row.get(0)?,
        step_key: row.get(1)?,
        step_id: row.get(2)?,
        status,
        output_json: row.get(4)?,
        output_type: row.get(5)?,
        error_message: row.get(6)?,
        attempt: row.get(7)?,
        owner: row.get(8)?,
        started_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
    })
}

impl StepStore for SqliteStepStore {
    fn initialize(&self) -> Result<(), EngineError> {
        let _guard = self.guard()?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| map_store_err("create database parent dir", e))?;
        }
        self.with_busy_retry("initialize schema", || {
            let conn = self.open_connection()?;
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS steps (
                    workflow_id   TEXT NOT NULL,
                    step_key      TEXT NOT NULL,
                    step_id       TEXT NOT NULL,
                    status        TEXT NOT NULL,
                    output_json   TEXT,
                    output_type   TEXT,
                    error_message TEXT,
                    attempt       INTEGER NOT NULL DEFAULT 0,
                    owner         TEXT,
                    started_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL,
                    PRIMARY KEY (workflow_id, step_key)
                ) WITHOUT ROWID;
                CREATE INDEX IF NOT EXISTS idx_steps_workflow_status
                ON steps (workflow_id, status);
                ",
            )
        })
    }

    fn reserve(
        &self,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, EngineError> {
        let _guard = self.guard()?;
        self.with_busy_retry("reserve step", || {
            let mut conn = self.open_connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = select_step(&tx, workflow_id, step_key)?;
            let now = now_ms();

            let reservation = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO steps (
                            workflow_id, step_key, step_id, status,
                            attempt, owner, started_at_ms, updated_at_ms
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            workflow_id,
                            step_key,
                            step_id,
                            StepStatus::Running.as_str(),
                            1_i64,
                            owner,
                            now,
                            now
                        ],
                    )?;
                    Reservation::Acquired(StepRecord {
                        workflow_id: workflow_id.to_string(),
                        step_key: step_key.to_string(),
                        step_id: step_id.to_string(),
                        status: StepStatus::Running,
                        output_json: None,
                        output_type: None,
                        error_message: None,
                        attempt: 1,
                        owner: Some(owner.to_string()),
                        started_at_ms: now,
                        updated_at_ms: now,
                    })
                }
                Some(existing) if existing.status == StepStatus::Completed => {
                    Reservation::Cached(existing)
                }
                Some(existing) => {
                    let stale = now - existing.updated_at_ms > lease_ms as i64;
                    let same_owner = existing.owner.as_deref() == Some(owner);
                    if existing.status == StepStatus::Running && !stale && !same_owner {
                        Reservation::RunningElsewhere(existing)
                    } else {
                        let attempt = existing.attempt + 1;
                        tx.execute(
                            "UPDATE steps
                             SET status = ?1,
                                 owner = ?2,
                                 output_json = NULL,
                                 output_type = NULL,
                                 error_message = NULL,
                                 attempt = ?3,
                                 updated_at_ms = ?4
                             WHERE workflow_id = ?5
                               AND step_key = ?6",
                            params![
                                StepStatus::Running.as_str(),
                                owner,
                                attempt,
                                now,
                                workflow_id,
                                step_key
                            ],
                        )?;
                        Reservation::Acquired(StepRecord {
                            status: StepStatus::Running,
                            output_json: None,
                            output_type: None,
                            error_message: None,
                            attempt,
                            owner: Some(owner.to_string()),
                            started_at_ms: if existing.started_at_ms > 0 {
                                existing.started_at_ms
                            } else {
                                now
                            },
                            updated_at_ms: now,
                            ..existing
                        })
                    }
                }
            };
            tx.commit()?;
            Ok(reservation)
        })
    }

    fn complete(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        output_json: Option<&str>,
        output_type: &str,
    ) -> Result<(), EngineError> {
        let _guard = self.guard()?;
        let changed = self.with_busy_retry("complete step", || {
            let conn = self.open_connection()?;
            conn.execute(
                "UPDATE steps
                 SET status = ?1,
                     output_json = ?2,
                     output_type = ?3,
                     error_message = NULL,
                     updated_at_ms = ?4
                 WHERE workflow_id = ?5
                   AND step_key = ?6
                   AND owner = ?7",
                params![
                    StepStatus::Completed.as_str(),
                    output_json,
                    output_type,
                    now_ms(),
                    workflow_id,
                    step_key,
                    owner
                ],
            )
        })?;
        if changed == 0 {
            return Err(EngineError::OwnershipLost {
                step_key: step_key.to_string(),
            });
        }
        Ok(())
    }

    fn fail(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        error_message: &str,
    ) -> Result<(), EngineError> {
        let _guard = self.guard()?;
        let changed = self.with_busy_retry("fail step", || {
            let conn = self.open_connection()?;
            conn.execute(
                "UPDATE steps
                 SET status = ?1,
                     error_message = ?2,
                     updated_at_ms = ?3
                 WHERE workflow_id = ?4
                   AND step_key = ?5
                   AND owner = ?6",
                params![
                    StepStatus::Failed.as_str(),
                    error_message,
                    now_ms(),
                    workflow_id,
                    step_key,
                    owner
                ],
            )
        })?;
        if changed == 0 {
            return Err(EngineError::OwnershipLost {
                step_key: step_key.to_string(),
            });
        }
        Ok(())
    }

    fn scan(
        &self,
        workflow_id: &str,
        status: Option<StepStatus>,
    ) -> Result<Vec<StepRecord>, EngineError> {
        let _guard = self.guard()?;
        self.with_busy_retry("scan steps", || {
            let conn = self.open_connection()?;
            let mut out = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM steps
                         WHERE workflow_id = ?1 AND status = ?2
                         ORDER BY started_at_ms, step_key"
                    ))?;
                    let rows =
                        stmt.query_map(params![workflow_id, status.as_str()], map_step_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM steps
                         WHERE workflow_id = ?1
                         ORDER BY started_at_ms, step_key"
                    ))?;
                    let rows = stmt.query_map(params![workflow_id], map_step_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }
}
