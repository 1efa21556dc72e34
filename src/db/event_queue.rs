//! Event ingestion queue persistence
//!
//! Rows are keyed by external id and retained indefinitely. Scheduling uses
//! `available_at_ms` (unix millis): the backoff deadline for `failed` rows and
//! the lease deadline for `processing` rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{get_opt_ts, get_ts, sql_text_enum, ts};
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Quarantined,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Succeeded => "succeeded",
            QueueStatus::Failed => "failed",
            QueueStatus::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "succeeded" => Ok(QueueStatus::Succeeded),
            "failed" => Ok(QueueStatus::Failed),
            "quarantined" => Ok(QueueStatus::Quarantined),
            other => Err(LedgerError::InvalidInput(format!("unknown queue status '{}'", other))),
        }
    }
}

sql_text_enum!(QueueStatus);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedEventRow {
    pub external_id: String,
    pub tx_hash: String,
    pub log_index: u32,
    pub block_number: u64,
    pub kind: String,
    /// JSON of the typed event
    pub payload: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub available_at_ms: i64,
    pub consumer_id: Option<String>,
    pub error_message: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedEventRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            external_id: row.get("external_id")?,
            tx_hash: row.get("tx_hash")?,
            log_index: row.get("log_index")?,
            block_number: row.get("block_number")?,
            kind: row.get("kind")?,
            payload: row.get("payload")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            last_attempt_at: get_opt_ts(row, "last_attempt_at")?,
            available_at_ms: row.get("available_at_ms")?,
            consumer_id: row.get("consumer_id")?,
            error_message: row.get("error_message")?,
            ingested_at: get_ts(row, "ingested_at")?,
            completed_at: get_opt_ts(row, "completed_at")?,
        })
    }
}

/// Input for enqueueing
#[derive(Debug, Clone)]
pub struct NewQueuedEvent<'a> {
    pub external_id: &'a str,
    pub tx_hash: &'a str,
    pub log_index: u32,
    pub block_number: u64,
    pub kind: &'a str,
    pub payload: &'a str,
    pub ingested_at: DateTime<Utc>,
}

/// A row observed as claimable, with the fields the claim CAS compares against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCandidate {
    pub external_id: String,
    pub status: QueueStatus,
    pub available_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub quarantined: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.succeeded + self.failed + self.quarantined
    }
}

// ============================================================================
// Read Operations
// ============================================================================

pub fn get_event(conn: &Connection, external_id: &str) -> Result<Option<QueuedEventRow>> {
    conn.query_row(
        "SELECT * FROM event_queue WHERE external_id = ?",
        params![external_id],
        QueuedEventRow::from_row,
    )
    .optional()
    .map_err(|e| LedgerError::db("Query failed", e))
}

/// Claimable rows in sequence order
pub fn claim_candidates(
    conn: &Connection,
    now_ms: i64,
    max_attempts: u32,
    limit: u32,
) -> Result<Vec<ClaimCandidate>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT external_id, status, available_at_ms FROM event_queue
            WHERE status = 'pending'
               OR (status = 'failed' AND attempts < ?2 AND available_at_ms <= ?1)
               OR (status = 'processing' AND available_at_ms <= ?1)
            ORDER BY block_number, log_index
            LIMIT ?3
            "#,
        )
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![now_ms, max_attempts, limit], |row| {
            Ok(ClaimCandidate {
                external_id: row.get(0)?,
                status: row.get(1)?,
                available_at_ms: row.get(2)?,
            })
        })
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}

pub fn list_by_status(conn: &Connection, status: QueueStatus, limit: u32) -> Result<Vec<QueuedEventRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM event_queue WHERE status = ? ORDER BY block_number, log_index LIMIT ?")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![status, limit], QueuedEventRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}

pub fn stats(conn: &Connection) -> Result<QueueStats> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM event_queue GROUP BY status")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, QueueStatus>(0)?, row.get::<_, i64>(1)? as u64)))
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    let mut stats = QueueStats::default();
    for (status, count) in counts {
        match status {
            QueueStatus::Pending => stats.pending = count,
            QueueStatus::Processing => stats.processing = count,
            QueueStatus::Succeeded => stats.succeeded = count,
            QueueStatus::Failed => stats.failed = count,
            QueueStatus::Quarantined => stats.quarantined = count,
        }
    }
    Ok(stats)
}

// ============================================================================
// Write Operations
// ============================================================================

/// Insert unless the external id is already known. Returns whether a row was added.
pub fn insert_if_absent(conn: &Connection, event: &NewQueuedEvent<'_>) -> Result<bool> {
    let changed = conn
        .execute(
            r#"
            INSERT OR IGNORE INTO event_queue (
                external_id, tx_hash, log_index, block_number, kind, payload, ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.external_id,
                event.tx_hash,
                event.log_index,
                event.block_number,
                event.kind,
                event.payload,
                ts(&event.ingested_at),
            ],
        )
        .map_err(|e| LedgerError::db("Insert failed", e))?;

    Ok(changed == 1)
}

/// Compare-and-set a candidate into `processing`. True only if this call won.
pub fn try_claim(
    conn: &Connection,
    candidate: &ClaimCandidate,
    consumer_id: &str,
    now: DateTime<Utc>,
    lease_until_ms: i64,
) -> Result<bool> {
    let changed = conn
        .execute(
            r#"
            UPDATE event_queue
            SET status = 'processing', consumer_id = ?4, last_attempt_at = ?5, available_at_ms = ?6
            WHERE external_id = ?1 AND status = ?2 AND available_at_ms = ?3
            "#,
            params![
                candidate.external_id,
                candidate.status,
                candidate.available_at_ms,
                consumer_id,
                ts(&now),
                lease_until_ms,
            ],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    Ok(changed == 1)
}

/// Returns false when the consumer no longer holds the event
pub fn mark_succeeded(conn: &Connection, external_id: &str, consumer_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .execute(
            r#"
            UPDATE event_queue SET status = 'succeeded', completed_at = ?3, error_message = NULL
            WHERE external_id = ?1 AND status = 'processing' AND consumer_id = ?2
            "#,
            params![external_id, consumer_id, ts(&now)],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    Ok(changed == 1)
}

/// Record a failed attempt, moving the row to `failed` or `quarantined`
pub fn mark_failed(
    conn: &Connection,
    external_id: &str,
    consumer_id: &str,
    status: QueueStatus,
    attempts: u32,
    error: &str,
    retry_at_ms: i64,
) -> Result<bool> {
    let changed = conn
        .execute(
            r#"
            UPDATE event_queue
            SET status = ?3, attempts = ?4, error_message = ?5, available_at_ms = ?6
            WHERE external_id = ?1 AND status = 'processing' AND consumer_id = ?2
            "#,
            params![external_id, consumer_id, status, attempts, error, retry_at_ms],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    Ok(changed == 1)
}

/// Operator action: give a quarantined event a fresh set of attempts
pub fn requeue_quarantined(conn: &Connection, external_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            r#"
            UPDATE event_queue
            SET status = 'pending', attempts = 0, available_at_ms = 0, consumer_id = NULL
            WHERE external_id = ?1 AND status = 'quarantined'
            "#,
            params![external_id],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    Ok(changed == 1)
}
