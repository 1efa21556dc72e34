//! Epoch persistence

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::requests::RequestType;
use super::{get_opt_ts, get_ts, sql_text_enum, ts};
use crate::error::{LedgerError, Result};

pub type EpochId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochStatus {
    Active,
    Processing,
    Completed,
}

impl EpochStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochStatus::Active => "active",
            EpochStatus::Processing => "processing",
            EpochStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for EpochStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpochStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(EpochStatus::Active),
            "processing" => Ok(EpochStatus::Processing),
            "completed" => Ok(EpochStatus::Completed),
            other => Err(LedgerError::InvalidInput(format!("unknown epoch status '{}'", other))),
        }
    }
}

sql_text_enum!(EpochStatus);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochRow {
    pub id: EpochId,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: EpochStatus,
    pub deposits_processed: u64,
    pub withdrawals_processed: u64,
    pub borrows_processed: u64,
    pub processed_at: Option<DateTime<Utc>>,
}

impl EpochRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            start_at: get_ts(row, "start_at")?,
            end_at: get_opt_ts(row, "end_at")?,
            status: row.get("status")?,
            deposits_processed: row.get("deposits_processed")?,
            withdrawals_processed: row.get("withdrawals_processed")?,
            borrows_processed: row.get("borrows_processed")?,
            processed_at: get_opt_ts(row, "processed_at")?,
        })
    }

    pub fn processed_count(&self, request_type: RequestType) -> u64 {
        match request_type {
            RequestType::Deposit => self.deposits_processed,
            RequestType::Withdrawal => self.withdrawals_processed,
            RequestType::Borrow => self.borrows_processed,
        }
    }
}

fn counter_column(request_type: RequestType) -> &'static str {
    match request_type {
        RequestType::Deposit => "deposits_processed",
        RequestType::Withdrawal => "withdrawals_processed",
        RequestType::Borrow => "borrows_processed",
    }
}

pub fn get_epoch(conn: &Connection, id: EpochId) -> Result<Option<EpochRow>> {
    conn.query_row("SELECT * FROM epochs WHERE id = ?", params![id], EpochRow::from_row)
        .optional()
        .map_err(|e| LedgerError::db("Query failed", e))
}

pub fn get_active_epoch(conn: &Connection) -> Result<Option<EpochRow>> {
    conn.query_row("SELECT * FROM epochs WHERE status = 'active'", [], EpochRow::from_row)
        .optional()
        .map_err(|e| LedgerError::db("Query failed", e))
}

/// Highest epoch id ever created (0 if none)
pub fn latest_epoch_id(conn: &Connection) -> Result<EpochId> {
    conn.query_row("SELECT COALESCE(MAX(id), 0) FROM epochs", [], |row| row.get(0))
        .map_err(|e| LedgerError::db("Query failed", e))
}

/// Most recent epochs first
pub fn list_epochs(conn: &Connection, limit: u32) -> Result<Vec<EpochRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM epochs ORDER BY id DESC LIMIT ?")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![limit], EpochRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}

/// Open `id` as the active epoch. Fails if another epoch is still active.
pub fn insert_active_epoch(conn: &Connection, id: EpochId, start_at: DateTime<Utc>) -> Result<EpochRow> {
    conn.execute(
        "INSERT INTO epochs (id, start_at, status) VALUES (?1, ?2, 'active')",
        params![id, ts(&start_at)],
    )
    .map_err(|e| LedgerError::db("Insert failed", e))?;

    get_epoch(conn, id)?.ok_or_else(|| LedgerError::NotFound(format!("epoch {}", id)))
}

pub fn set_status(conn: &Connection, id: EpochId, from: EpochStatus, to: EpochStatus) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE epochs SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![id, from, to],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    if changed == 0 {
        return Err(LedgerError::Database(format!(
            "epoch {} is not {} (cannot move to {})",
            id, from, to
        )));
    }
    Ok(())
}

/// Stamp end/processed timestamps on a processing epoch and complete it
pub fn complete_epoch(conn: &Connection, id: EpochId, at: DateTime<Utc>) -> Result<()> {
    let stamp = ts(&at);
    let changed = conn
        .execute(
            r#"
            UPDATE epochs SET status = 'completed', end_at = ?2, processed_at = ?2
            WHERE id = ?1 AND status = 'processing'
            "#,
            params![id, stamp],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    if changed == 0 {
        return Err(LedgerError::Database(format!("epoch {} is not processing", id)));
    }
    Ok(())
}

/// Bump a processed counter on the active epoch only
pub fn increment_counter(conn: &Connection, id: EpochId, request_type: RequestType) -> Result<()> {
    let sql = format!(
        "UPDATE epochs SET {col} = {col} + 1 WHERE id = ?1 AND status = 'active'",
        col = counter_column(request_type)
    );
    conn.execute(&sql, params![id])
        .map_err(|e| LedgerError::db("Update failed", e))?;
    Ok(())
}
