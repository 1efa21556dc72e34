//! Processing events and their batch items (append-only)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::epochs::EpochId;
use super::requests::{RequestId, RequestType};
use super::{get_ts, sql_text_enum, ts};
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Processed,
    Failed,
}

impl BatchItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchItemStatus::Processed => "processed",
            BatchItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchItemStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processed" => Ok(BatchItemStatus::Processed),
            "failed" => Ok(BatchItemStatus::Failed),
            other => Err(LedgerError::InvalidInput(format!("unknown batch item status '{}'", other))),
        }
    }
}

sql_text_enum!(BatchItemStatus);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemRow {
    pub position: u32,
    pub request_id: RequestId,
    pub status: BatchItemStatus,
    pub detail: Option<String>,
}

impl BatchItemRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            position: row.get("position")?,
            request_id: row.get("request_id")?,
            status: row.get("status")?,
            detail: row.get("detail")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingEventRow {
    pub id: u64,
    pub epoch_id: Option<EpochId>,
    pub request_type: RequestType,
    pub processed_count: u32,
    pub failed_count: u32,
    pub principal: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<BatchItemRow>,
}

impl ProcessingEventRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            epoch_id: row.get("epoch_id")?,
            request_type: row.get("request_type")?,
            processed_count: row.get("processed_count")?,
            failed_count: row.get("failed_count")?,
            principal: row.get("principal")?,
            created_at: get_ts(row, "created_at")?,
            items: vec![], // Loaded separately
        })
    }
}

/// Batch item outcome to persist
#[derive(Debug, Clone)]
pub struct NewBatchItem {
    pub request_id: RequestId,
    pub status: BatchItemStatus,
    pub detail: Option<String>,
}

/// Persist a processing event and its items; counts are derived from the items
pub fn insert_processing_event(
    conn: &Connection,
    epoch_id: Option<EpochId>,
    request_type: RequestType,
    principal: &str,
    items: &[NewBatchItem],
    created_at: DateTime<Utc>,
) -> Result<ProcessingEventRow> {
    let processed = items.iter().filter(|i| i.status == BatchItemStatus::Processed).count() as u32;
    let failed = items.len() as u32 - processed;

    conn.execute(
        r#"
        INSERT INTO processing_events (epoch_id, request_type, processed_count, failed_count, principal, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![epoch_id, request_type, processed, failed, principal, ts(&created_at)],
    )
    .map_err(|e| LedgerError::db("Insert failed", e))?;

    let event_id = conn.last_insert_rowid() as u64;

    let mut stmt = conn
        .prepare(
            "INSERT INTO batch_items (processing_event_id, position, request_id, status, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    for (position, item) in items.iter().enumerate() {
        stmt.execute(params![event_id, position as u32, item.request_id, item.status, item.detail])
            .map_err(|e| LedgerError::db("Insert batch item failed", e))?;
    }

    get_processing_event(conn, event_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("processing event {}", event_id)))
}

pub fn get_processing_event(conn: &Connection, id: u64) -> Result<Option<ProcessingEventRow>> {
    let event = conn
        .query_row(
            "SELECT * FROM processing_events WHERE id = ?",
            params![id],
            ProcessingEventRow::from_row,
        )
        .optional()
        .map_err(|e| LedgerError::db("Query failed", e))?;

    match event {
        Some(mut event) => {
            event.items = get_batch_items(conn, id)?;
            Ok(Some(event))
        }
        None => Ok(None),
    }
}

fn get_batch_items(conn: &Connection, processing_event_id: u64) -> Result<Vec<BatchItemRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM batch_items WHERE processing_event_id = ? ORDER BY position")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let items = stmt
        .query_map(params![processing_event_id], BatchItemRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    #[test]
    fn test_insert_with_items() {
        let db = LedgerDb::open_in_memory().unwrap();
        let items = vec![
            NewBatchItem { request_id: 1, status: BatchItemStatus::Processed, detail: None },
            NewBatchItem { request_id: 99, status: BatchItemStatus::Failed, detail: Some("Not found: request 99".into()) },
            NewBatchItem { request_id: 1, status: BatchItemStatus::Failed, detail: Some("Request already processed: 1".into()) },
        ];

        let event = db
            .with_tx(|tx| insert_processing_event(tx, Some(1), RequestType::Deposit, "admin", &items, Utc::now()))
            .unwrap();

        assert_eq!(event.processed_count, 1);
        assert_eq!(event.failed_count, 2);
        assert_eq!(event.items.len(), 3);
        assert_eq!(event.items[1].request_id, 99);
        assert_eq!(event.items[2].position, 2);
    }
}
