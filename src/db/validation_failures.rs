//! Requests rejected on-chain
//!
//! The contract emits a validation failure instead of a request when its own
//! checks fail. These rows are kept for operators; nothing here touches a
//! balance.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::requests::RequestType;
use super::{get_ts, ts};
use crate::amount::Amount;
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailureRow {
    pub id: u64,
    pub wallet: String,
    pub request_type: Option<RequestType>,
    pub amount: Amount,
    pub reason: Option<String>,
    pub source_event_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ValidationFailureRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            wallet: row.get("wallet")?,
            request_type: row.get("request_type")?,
            amount: row.get("amount")?,
            reason: row.get("reason")?,
            source_event_id: row.get("source_event_id")?,
            recorded_at: get_ts(row, "recorded_at")?,
        })
    }
}

/// Input for recording a validation failure
#[derive(Debug, Clone)]
pub struct NewValidationFailure<'a> {
    pub wallet: &'a str,
    pub request_type: Option<RequestType>,
    pub amount: Amount,
    pub reason: Option<&'a str>,
    pub source_event_id: Option<&'a str>,
}

/// Insert unless `source_event_id` is already recorded. Returns whether a row was added.
pub fn insert_if_absent(conn: &Connection, failure: &NewValidationFailure<'_>, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .execute(
            r#"
            INSERT OR IGNORE INTO validation_failures (
                wallet, request_type, amount, reason, source_event_id, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                failure.wallet,
                failure.request_type,
                failure.amount,
                failure.reason,
                failure.source_event_id,
                ts(&now),
            ],
        )
        .map_err(|e| LedgerError::db("Insert failed", e))?;

    Ok(changed == 1)
}

pub fn list_for_wallet(conn: &Connection, wallet: &str) -> Result<Vec<ValidationFailureRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM validation_failures WHERE wallet = ? ORDER BY id")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![wallet], ValidationFailureRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}
