//! Vault Ledger - settlement ledger for a deposit/withdrawal/borrow vault
//!
//! Keeps the off-chain accounting for a vault contract in step with the chain.
//!
//! ## Architecture
//!
//! - **Ledger store**: SQLite (`ledger.db`) holding users, requests, epochs,
//!   batch records, reward accruals and the ingestion queue
//! - **Lifecycle**: request state machine and every balance mutation
//! - **Epochs**: one active epoch, rolled over without id gaps
//! - **Ingestion**: on-chain events deduplicated into a durable queue and
//!   reconciled into the ledger by one or more consumers
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/vault-ledger/
//! ├── ledger.db      # SQLite ledger (WAL mode)
//! └── config.toml    # Configuration
//! ```
//!
//! ## Amounts
//!
//! All amounts are integer base units ([`Amount`], a `u128`), stored as
//! decimal text so 18-decimal tokens never lose precision.

pub mod amount;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod locks;
pub mod rewards;
pub mod services;

pub use amount::Amount;
pub use auth::{Operation, PermissionLevel, Principal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ErrorKind, LedgerError, Result};
pub use ingest::{ChainEvent, EnqueueOutcome, EventPosition, ExternalEventId, RawEvent, ReconciliationSync};
pub use services::{EpochRollover, Ledger, LedgerStatus, ProcessOutcome};
