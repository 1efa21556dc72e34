//! Request CRUD operations

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{get_opt_ts, get_ts, sql_text_enum, ts};
use crate::amount::Amount;
use crate::error::{LedgerError, Result};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    #[serde(alias = "Deposit")]
    Deposit,
    #[serde(alias = "Withdrawal")]
    Withdrawal,
    #[serde(alias = "Borrow")]
    Borrow,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Deposit => "deposit",
            RequestType::Withdrawal => "withdrawal",
            RequestType::Borrow => "borrow",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deposit" => Ok(RequestType::Deposit),
            "withdrawal" => Ok(RequestType::Withdrawal),
            "borrow" => Ok(RequestType::Borrow),
            other => Err(LedgerError::InvalidInput(format!("unknown request type '{}'", other))),
        }
    }
}

sql_text_enum!(RequestType);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    /// Closed; the remainder lives on in `successor_id`
    PartiallyProcessed,
    Processed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::PartiallyProcessed => "partially_processed",
            RequestStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "partially_processed" => Ok(RequestStatus::PartiallyProcessed),
            "processed" => Ok(RequestStatus::Processed),
            other => Err(LedgerError::InvalidInput(format!("unknown request status '{}'", other))),
        }
    }
}

sql_text_enum!(RequestStatus);

/// Request row from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRow {
    pub id: RequestId,
    pub request_type: RequestType,
    pub wallet: String,
    pub amount: Amount,
    pub collateral_amount: Option<Amount>,
    pub status: RequestStatus,
    pub processed_amount: Amount,
    pub parent_id: Option<RequestId>,
    pub successor_id: Option<RequestId>,
    pub on_chain_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RequestRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            request_type: row.get("request_type")?,
            wallet: row.get("wallet")?,
            amount: row.get("amount")?,
            collateral_amount: row.get("collateral_amount")?,
            status: row.get("status")?,
            processed_amount: row.get("processed_amount")?,
            parent_id: row.get("parent_id")?,
            successor_id: row.get("successor_id")?,
            on_chain_id: row.get("on_chain_id")?,
            created_at: get_ts(row, "created_at")?,
            processed_at: get_opt_ts(row, "processed_at")?,
        })
    }

    /// Terminal for processing: fully processed, or partially processed with a successor
    pub fn is_processed(&self) -> bool {
        self.status != RequestStatus::Pending
    }

    pub fn remaining(&self) -> Amount {
        self.amount.saturating_sub(self.processed_amount)
    }
}

/// Input for inserting a request
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub request_type: RequestType,
    pub wallet: String,
    pub amount: Amount,
    pub collateral_amount: Option<Amount>,
    pub parent_id: Option<RequestId>,
    pub on_chain_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Query parameters for listing requests
#[derive(Debug, Clone, Deserialize)]
pub struct RequestQuery {
    pub wallet: Option<String>,
    pub request_type: Option<RequestType>,
    pub status: Option<RequestStatus>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

impl Default for RequestQuery {
    fn default() -> Self {
        Self {
            wallet: None,
            request_type: None,
            status: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

// ============================================================================
// Read Operations
// ============================================================================

pub fn get_request(conn: &Connection, id: RequestId) -> Result<Option<RequestRow>> {
    conn.query_row("SELECT * FROM requests WHERE id = ?", params![id], RequestRow::from_row)
        .optional()
        .map_err(|e| LedgerError::db("Query failed", e))
}

pub fn get_by_on_chain_id(conn: &Connection, on_chain_id: u64) -> Result<Option<RequestRow>> {
    conn.query_row(
        "SELECT * FROM requests WHERE on_chain_id = ?",
        params![on_chain_id],
        RequestRow::from_row,
    )
    .optional()
    .map_err(|e| LedgerError::db("Query failed", e))
}

/// List requests with optional filters, oldest first
pub fn list_requests(conn: &Connection, query: &RequestQuery) -> Result<Vec<RequestRow>> {
    let mut sql = String::from("SELECT * FROM requests WHERE 1=1");
    let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(ref wallet) = query.wallet {
        sql.push_str(" AND wallet = ?");
        params_vec.push(Box::new(wallet.clone()));
    }

    if let Some(request_type) = query.request_type {
        sql.push_str(" AND request_type = ?");
        params_vec.push(Box::new(request_type));
    }

    if let Some(status) = query.status {
        sql.push_str(" AND status = ?");
        params_vec.push(Box::new(status));
    }

    sql.push_str(" ORDER BY id LIMIT ? OFFSET ?");
    params_vec.push(Box::new(query.limit));
    params_vec.push(Box::new(query.offset));

    let param_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(param_refs.as_slice(), RequestRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}

// ============================================================================
// Write Operations
// ============================================================================

pub fn insert_request(conn: &Connection, input: &NewRequest) -> Result<RequestRow> {
    conn.execute(
        r#"
        INSERT INTO requests (
            request_type, wallet, amount, collateral_amount, parent_id, on_chain_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            input.request_type,
            input.wallet,
            input.amount,
            input.collateral_amount,
            input.parent_id,
            input.on_chain_id,
            ts(&input.created_at),
        ],
    )
    .map_err(|e| LedgerError::db("Insert failed", e))?;

    let id = conn.last_insert_rowid() as RequestId;
    debug!(request_id = id, request_type = %input.request_type, wallet = %input.wallet, "Inserted request");

    get_request(conn, id)?.ok_or_else(|| LedgerError::NotFound(format!("request {}", id)))
}

/// Close a pending request. Only a `pending` row is updated.
pub fn mark_processed(
    conn: &Connection,
    id: RequestId,
    status: RequestStatus,
    processed_amount: Amount,
    successor_id: Option<RequestId>,
    processed_at: DateTime<Utc>,
) -> Result<()> {
    let changed = conn
        .execute(
            r#"
            UPDATE requests SET status = ?2, processed_amount = ?3, successor_id = ?4, processed_at = ?5
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![id, status, processed_amount, successor_id, ts(&processed_at)],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    if changed == 0 {
        return Err(LedgerError::AlreadyProcessed(id));
    }
    Ok(())
}

pub fn count_by_status(conn: &Connection, status: RequestStatus) -> Result<u64> {
    conn.query_row(
        "SELECT COUNT(*) FROM requests WHERE status = ?",
        params![status],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u64)
    .map_err(|e| LedgerError::db("Query failed", e))
}
