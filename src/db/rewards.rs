//! Reward accrual records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::epochs::EpochId;
use super::{get_opt_ts, get_ts, sql_text_enum, ts};
use crate::amount::Amount;
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Pending,
    Claimed,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardStatus::Pending => "pending",
            RewardStatus::Claimed => "claimed",
        }
    }
}

impl fmt::Display for RewardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RewardStatus::Pending),
            "claimed" => Ok(RewardStatus::Claimed),
            other => Err(LedgerError::InvalidInput(format!("unknown reward status '{}'", other))),
        }
    }
}

sql_text_enum!(RewardStatus);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewardAccrualRow {
    pub id: u64,
    pub wallet: String,
    pub epoch_id: Option<EpochId>,
    pub amount: Amount,
    pub apr_bps: u32,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: RewardStatus,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl RewardAccrualRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            wallet: row.get("wallet")?,
            epoch_id: row.get("epoch_id")?,
            amount: row.get("amount")?,
            apr_bps: row.get("apr_bps")?,
            period_start: get_ts(row, "period_start")?,
            period_end: get_ts(row, "period_end")?,
            status: row.get("status")?,
            claimed_at: get_opt_ts(row, "claimed_at")?,
        })
    }
}

pub fn insert_accrual(
    conn: &Connection,
    wallet: &str,
    epoch_id: Option<EpochId>,
    amount: Amount,
    apr_bps: u32,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<u64> {
    conn.execute(
        r#"
        INSERT INTO reward_accruals (wallet, epoch_id, amount, apr_bps, period_start, period_end)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![wallet, epoch_id, amount, apr_bps, ts(&period_start), ts(&period_end)],
    )
    .map_err(|e| LedgerError::db("Insert failed", e))?;

    Ok(conn.last_insert_rowid() as u64)
}

pub fn list_for_wallet(conn: &Connection, wallet: &str, status: Option<RewardStatus>) -> Result<Vec<RewardAccrualRow>> {
    let rows = match status {
        Some(status) => {
            let mut stmt = conn
                .prepare("SELECT * FROM reward_accruals WHERE wallet = ? AND status = ? ORDER BY id")
                .map_err(|e| LedgerError::db("Prepare failed", e))?;
            let rows = stmt
                .query_map(params![wallet, status], RewardAccrualRow::from_row)
                .map_err(|e| LedgerError::db("Query failed", e))?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT * FROM reward_accruals WHERE wallet = ? ORDER BY id")
                .map_err(|e| LedgerError::db("Prepare failed", e))?;
            let rows = stmt
                .query_map(params![wallet], RewardAccrualRow::from_row)
                .map_err(|e| LedgerError::db("Query failed", e))?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        }
    };

    rows.map_err(|e| LedgerError::db("Row parse failed", e))
}

/// Mark every pending record of `wallet` claimed; returns how many changed
pub fn mark_claimed(conn: &Connection, wallet: &str, at: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "UPDATE reward_accruals SET status = 'claimed', claimed_at = ?2 WHERE wallet = ?1 AND status = 'pending'",
        params![wallet, ts(&at)],
    )
    .map_err(|e| LedgerError::db("Update failed", e))
}
