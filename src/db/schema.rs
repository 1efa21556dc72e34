//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::{LedgerError, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| LedgerError::db("Failed to create schema_version table", e))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| LedgerError::db("Failed to clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| LedgerError::db("Failed to set schema_version", e))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| LedgerError::db("Failed to create ledger tables", e))?;

    conn.execute_batch(AUDIT_SCHEMA)
        .map_err(|e| LedgerError::db("Failed to create audit tables", e))?;

    conn.execute_batch(QUEUE_SCHEMA)
        .map_err(|e| LedgerError::db("Failed to create event queue", e))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| LedgerError::db("Failed to create indexes", e))?;

    Ok(())
}

/// Users, requests and epochs
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    wallet TEXT PRIMARY KEY NOT NULL,
    kyc_status TEXT NOT NULL DEFAULT 'pending',

    -- Balances in base units, decimal TEXT
    active_balance TEXT NOT NULL DEFAULT '0',
    pending_deposits TEXT NOT NULL DEFAULT '0',
    pending_withdrawals TEXT NOT NULL DEFAULT '0',
    reward_balance TEXT NOT NULL DEFAULT '0',

    -- Lifetime counters
    total_deposited TEXT NOT NULL DEFAULT '0',
    total_withdrawn TEXT NOT NULL DEFAULT '0',
    total_borrowed TEXT NOT NULL DEFAULT '0',

    last_accrual_at TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

-- AUTOINCREMENT so ids are never reused
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_type TEXT NOT NULL,
    wallet TEXT NOT NULL,
    amount TEXT NOT NULL,
    collateral_amount TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    processed_amount TEXT NOT NULL DEFAULT '0',

    -- Partial withdrawal chain
    parent_id INTEGER,
    successor_id INTEGER,

    on_chain_id INTEGER UNIQUE,
    created_at TEXT NOT NULL,
    processed_at TEXT,
    FOREIGN KEY (wallet) REFERENCES users(wallet),
    FOREIGN KEY (parent_id) REFERENCES requests(id)
);

CREATE TABLE IF NOT EXISTS epochs (
    id INTEGER PRIMARY KEY NOT NULL,
    start_at TEXT NOT NULL,
    end_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    deposits_processed INTEGER NOT NULL DEFAULT 0,
    withdrawals_processed INTEGER NOT NULL DEFAULT 0,
    borrows_processed INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT
);
"#;

/// Append-only audit records
const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processing_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    epoch_id INTEGER,
    request_type TEXT NOT NULL,
    processed_count INTEGER NOT NULL,
    failed_count INTEGER NOT NULL,
    principal TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_items (
    processing_event_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    request_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    detail TEXT,
    PRIMARY KEY (processing_event_id, position),
    FOREIGN KEY (processing_event_id) REFERENCES processing_events(id)
);

CREATE TABLE IF NOT EXISTS request_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL,
    wallet TEXT NOT NULL,
    request_type TEXT NOT NULL,
    processed_amount TEXT NOT NULL,
    remaining_amount TEXT NOT NULL,
    successor_id INTEGER,
    epoch_id INTEGER,
    -- External id of the chain event that drove this execution, if any
    source_event_id TEXT,
    executed_at TEXT NOT NULL,
    FOREIGN KEY (request_id) REFERENCES requests(id)
);

-- Requests the contract rejected; recorded, never applied to balances
CREATE TABLE IF NOT EXISTS validation_failures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    request_type TEXT,
    amount TEXT NOT NULL,
    reason TEXT,
    source_event_id TEXT UNIQUE,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reward_accruals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    epoch_id INTEGER,
    amount TEXT NOT NULL,
    apr_bps INTEGER NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    claimed_at TEXT,
    FOREIGN KEY (wallet) REFERENCES users(wallet)
);
"#;

/// Event ingestion queue, keyed by source tx hash + log index
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_queue (
    external_id TEXT PRIMARY KEY NOT NULL,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,

    -- Scheduling in unix millis: backoff for failed, lease for processing
    available_at_ms INTEGER NOT NULL DEFAULT 0,

    consumer_id TEXT,
    error_message TEXT,
    ingested_at TEXT NOT NULL,
    completed_at TEXT
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_requests_wallet ON requests(wallet);
CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status, request_type);

-- At most one active epoch
CREATE UNIQUE INDEX IF NOT EXISTS idx_epochs_one_active ON epochs(status) WHERE status = 'active';

CREATE INDEX IF NOT EXISTS idx_batch_items_request ON batch_items(request_id);
CREATE INDEX IF NOT EXISTS idx_executions_request ON request_executions(request_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_source ON request_executions(source_event_id)
    WHERE source_event_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_validation_failures_wallet ON validation_failures(wallet);
CREATE INDEX IF NOT EXISTS idx_reward_accruals_wallet ON reward_accruals(wallet, status);
CREATE INDEX IF NOT EXISTS idx_event_queue_claim ON event_queue(status, block_number, log_index);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_second_active_epoch_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute("INSERT INTO epochs (id, start_at, status) VALUES (1, 'x', 'active')", [])
            .unwrap();
        let second = conn.execute("INSERT INTO epochs (id, start_at, status) VALUES (2, 'x', 'active')", []);
        assert!(second.is_err());
    }
}
