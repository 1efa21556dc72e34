//! SQLite ledger store
//!
//! Durable keyed storage for users, requests, epochs, reward records, batch
//! records and the event ingestion queue. The single source of mutable
//! off-chain truth.
//!
//! ## Tables
//!
//! - `users` - balances, KYC status, accrual marker
//! - `requests` - deposit/withdrawal/borrow requests and partial-fulfillment links
//! - `epochs` - settlement windows and per-type processed counters
//! - `processing_events` / `batch_items` - append-only batch audit trail
//! - `request_executions` - one immutable row per processed request
//! - `reward_accruals` - accrued reward records
//! - `validation_failures` - requests the contract rejected
//! - `event_queue` - externally sourced events awaiting reconciliation
//!
//! Amounts are decimal TEXT of integer base units, timestamps are RFC 3339
//! TEXT with an explicit UTC offset, identifiers are never-reused INTEGERs.

pub mod schema;
pub mod users;
pub mod requests;
pub mod epochs;
pub mod batches;
pub mod executions;
pub mod rewards;
pub mod event_queue;
pub mod validation_failures;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{LedgerError, Result};

/// Fixed-width RFC 3339 (microseconds, `+00:00`) so TEXT order is time order
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Read an RFC 3339 timestamp column
pub(crate) fn get_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(column)?;
    parse_ts(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

/// Read a nullable RFC 3339 timestamp column
pub(crate) fn get_opt_ts(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(column)?;
    text.map(|t| parse_ts(&t))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn parse_ts(text: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc))
}

/// Implements `ToSql`/`FromSql` for enums stored as their `as_str()` text
macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse::<$ty>()
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}
pub(crate) use sql_text_enum;

/// SQLite database holding the ledger
pub struct LedgerDb {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
}

impl LedgerDb {
    /// Open or create `ledger.db` under the storage directory
    pub fn open(storage_dir: &Path, lock_timeout: Duration) -> Result<Self> {
        let db_path = storage_dir.join("ledger.db");
        info!("Opening ledger database at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| LedgerError::db("Failed to open SQLite", e))?;

        // WAL for concurrent readers; FULL sync because this is money
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;")
            .map_err(|e| LedgerError::db("Failed to set PRAGMA", e))?;
        conn.busy_timeout(lock_timeout)
            .map_err(|e| LedgerError::db("Failed to set busy timeout", e))?;

        Self::from_connection(conn, lock_timeout)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory ledger database");

        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::db("Failed to open in-memory SQLite", e))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| LedgerError::db("Failed to set PRAGMA", e))?;

        Self::from_connection(conn, Duration::from_secs(5))
    }

    fn from_connection(conn: Connection, lock_timeout: Duration) -> Result<Self> {
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            lock_timeout,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| LedgerError::Busy("ledger connection".to_string()))
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one IMMEDIATE transaction; commits only if `f` succeeds
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LedgerError::db("Transaction failed", e))?;

        // Dropping an uncommitted transaction rolls it back
        let value = f(&tx)?;

        tx.commit()
            .map_err(|e| LedgerError::db("Commit failed", e))?;
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| LedgerError::db("Query failed", e))
            };

            Ok(DbStats {
                user_count: count("SELECT COUNT(*) FROM users")?,
                request_count: count("SELECT COUNT(*) FROM requests")?,
                pending_request_count: requests::count_by_status(conn, RequestStatus::Pending)?,
                partially_processed_count: requests::count_by_status(conn, RequestStatus::PartiallyProcessed)?,
                epoch_count: count("SELECT COUNT(*) FROM epochs")?,
                processing_event_count: count("SELECT COUNT(*) FROM processing_events")?,
                queued_event_count: count("SELECT COUNT(*) FROM event_queue")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub user_count: u64,
    pub request_count: u64,
    pub pending_request_count: u64,
    pub partially_processed_count: u64,
    pub epoch_count: u64,
    pub processing_event_count: u64,
    pub queued_event_count: u64,
}

// Re-exports
pub use users::{KycStatus, UserRow};
pub use requests::{NewRequest, RequestId, RequestQuery, RequestRow, RequestStatus, RequestType};
pub use epochs::{EpochId, EpochRow, EpochStatus};
pub use batches::{BatchItemRow, BatchItemStatus, NewBatchItem, ProcessingEventRow};
pub use executions::{NewExecution, RequestExecutionRow};
pub use rewards::{RewardAccrualRow, RewardStatus};
pub use event_queue::{ClaimCandidate, NewQueuedEvent, QueueStats, QueueStatus, QueuedEventRow};
pub use validation_failures::{NewValidationFailure, ValidationFailureRow};
