//! Request execution audit trail

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::epochs::EpochId;
use super::requests::{RequestId, RequestType};
use super::{get_ts, ts};
use crate::amount::Amount;
use crate::error::{LedgerError, Result};

/// One immutable record per processed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestExecutionRow {
    pub id: u64,
    pub request_id: RequestId,
    pub wallet: String,
    pub request_type: RequestType,
    pub processed_amount: Amount,
    pub remaining_amount: Amount,
    pub successor_id: Option<RequestId>,
    pub epoch_id: Option<EpochId>,
    pub source_event_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl RequestExecutionRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            request_id: row.get("request_id")?,
            wallet: row.get("wallet")?,
            request_type: row.get("request_type")?,
            processed_amount: row.get("processed_amount")?,
            remaining_amount: row.get("remaining_amount")?,
            successor_id: row.get("successor_id")?,
            epoch_id: row.get("epoch_id")?,
            source_event_id: row.get("source_event_id")?,
            executed_at: get_ts(row, "executed_at")?,
        })
    }
}

/// Input for recording an execution
#[derive(Debug, Clone)]
pub struct NewExecution<'a> {
    pub request_id: RequestId,
    pub wallet: &'a str,
    pub request_type: RequestType,
    pub processed_amount: Amount,
    pub remaining_amount: Amount,
    pub successor_id: Option<RequestId>,
    pub epoch_id: Option<EpochId>,
    pub source_event_id: Option<&'a str>,
    pub executed_at: DateTime<Utc>,
}

pub fn insert_execution(conn: &Connection, execution: &NewExecution<'_>) -> Result<u64> {
    conn.execute(
        r#"
        INSERT INTO request_executions (
            request_id, wallet, request_type, processed_amount, remaining_amount,
            successor_id, epoch_id, source_event_id, executed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            execution.request_id,
            execution.wallet,
            execution.request_type,
            execution.processed_amount,
            execution.remaining_amount,
            execution.successor_id,
            execution.epoch_id,
            execution.source_event_id,
            ts(&execution.executed_at),
        ],
    )
    .map_err(|e| LedgerError::db("Insert failed", e))?;

    Ok(conn.last_insert_rowid() as u64)
}

/// The execution a given chain event already produced, if any
pub fn get_by_source(conn: &Connection, source_event_id: &str) -> Result<Option<RequestExecutionRow>> {
    conn.query_row(
        "SELECT * FROM request_executions WHERE source_event_id = ?",
        params![source_event_id],
        RequestExecutionRow::from_row,
    )
    .optional()
    .map_err(|e| LedgerError::db("Query failed", e))
}

pub fn list_for_request(conn: &Connection, request_id: RequestId) -> Result<Vec<RequestExecutionRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM request_executions WHERE request_id = ? ORDER BY id")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![request_id], RequestExecutionRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}

pub fn list_for_wallet(conn: &Connection, wallet: &str, limit: u32) -> Result<Vec<RequestExecutionRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM request_executions WHERE wallet = ? ORDER BY id DESC LIMIT ?")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![wallet, limit], RequestExecutionRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{requests, users, LedgerDb, NewRequest};

    fn execution(request_id: RequestId, source_event_id: Option<&str>) -> NewExecution<'_> {
        NewExecution {
            request_id,
            wallet: "0xalice",
            request_type: RequestType::Deposit,
            processed_amount: Amount::new(100),
            remaining_amount: Amount::ZERO,
            successor_id: None,
            epoch_id: None,
            source_event_id,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_source_event_is_unique() {
        let db = LedgerDb::open_in_memory().unwrap();
        let request_id = db
            .with_tx(|tx| {
                users::insert_user(tx, "0xalice", Utc::now())?;
                requests::insert_request(
                    tx,
                    &NewRequest {
                        request_type: RequestType::Deposit,
                        wallet: "0xalice".into(),
                        amount: Amount::new(100),
                        collateral_amount: None,
                        parent_id: None,
                        on_chain_id: Some(1),
                        created_at: Utc::now(),
                    },
                )
                .map(|r| r.id)
            })
            .unwrap();

        db.with_tx(|tx| insert_execution(tx, &execution(request_id, Some("0xabc:0")))).unwrap();
        // Executions without a chain source never collide
        db.with_tx(|tx| insert_execution(tx, &execution(request_id, None))).unwrap();
        db.with_tx(|tx| insert_execution(tx, &execution(request_id, None))).unwrap();

        let duplicate = db.with_tx(|tx| insert_execution(tx, &execution(request_id, Some("0xabc:0"))));
        assert!(matches!(duplicate, Err(LedgerError::Database(_))));

        let found = db.with_conn(|c| get_by_source(c, "0xabc:0")).unwrap().unwrap();
        assert_eq!(found.request_id, request_id);
        assert_eq!(found.source_event_id.as_deref(), Some("0xabc:0"));
        assert!(db.with_conn(|c| get_by_source(c, "0xdef:0")).unwrap().is_none());
        assert_eq!(db.with_conn(|c| list_for_request(c, request_id)).unwrap().len(), 3);
    }
}
