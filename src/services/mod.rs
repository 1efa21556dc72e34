//! Service layer for vault-ledger
//!
//! Services hold the ledger rules between callers and the repositories:
//! - Input validation and permission checks
//! - Lock acquisition (user → epoch → connection)
//! - Transaction boundaries
//! - Notification emission after commit
//!
//! ## Architecture
//!
//! ```text
//! Boundary (CLI, sync consumer, API)
//!     ↓
//! Ledger facade
//!     ↓
//! Lifecycle / Batch / Epoch / Queue services
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod batch;
pub mod epochs;
pub mod events;
pub mod lifecycle;

pub use batch::{BatchItem, BatchProcessor};
pub use epochs::{EpochRollover, EpochScheduler};
pub use events::{spawn_logging_listener, EventBus, EventListener, LedgerNotification, LoggingEventListener};
pub use lifecycle::{LifecycleService, ProcessOutcome, VaultParams};

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::amount::Amount;
use crate::auth::Principal;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{DbStats, EpochRow, LedgerDb, ProcessingEventRow, QueueStats, RequestId, RequestRow, RequestType, UserRow};
use crate::error::Result;
use crate::ingest::{ChainEvent, EnqueueOutcome, EventPosition, EventQueue, ExternalEventId, QueueSettings, ReconciliationSync};
use crate::locks::LockTable;

/// Service container and boundary facade
///
/// Holds every service over one shared database, lock table, clock and
/// event bus.
pub struct Ledger {
    pub db: Arc<LedgerDb>,
    pub lifecycle: Arc<LifecycleService>,
    pub epochs: Arc<EpochScheduler>,
    pub batch: Arc<BatchProcessor>,
    pub queue: Arc<EventQueue>,
    pub events: Arc<EventBus>,
    config: Config,
}

/// Point-in-time view for operators
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub current_epoch: Option<EpochRow>,
    pub db: DbStats,
    pub queue: QueueStats,
}

impl Ledger {
    /// Open the on-disk ledger under `config.storage_dir` with the system clock
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_dir)?;
        let db = LedgerDb::open(&config.storage_dir, config.lock_timeout())?;
        Self::new(Arc::new(db), config, Arc::new(SystemClock))
    }

    /// In-memory ledger (for testing)
    pub fn in_memory(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(Arc::new(LedgerDb::open_in_memory()?), config, clock)
    }

    /// Wire services together and make sure an epoch is active
    pub fn new(db: Arc<LedgerDb>, config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let events = Arc::new(EventBus::new());
        let locks = Arc::new(LockTable::new(config.lock_timeout()));

        let lifecycle = Arc::new(LifecycleService::new(
            db.clone(),
            locks.clone(),
            clock.clone(),
            events.clone(),
            VaultParams::from(config),
        ));
        let epochs = Arc::new(EpochScheduler::new(
            db.clone(),
            locks,
            clock.clone(),
            events.clone(),
            config.epoch_duration_secs,
        ));
        let batch = Arc::new(BatchProcessor::new(db.clone(), lifecycle.clone(), clock.clone(), events.clone()));
        let queue = Arc::new(EventQueue::new(db.clone(), clock, events.clone(), QueueSettings::from(config)));

        let epoch = epochs.ensure_initial_epoch()?;
        info!(epoch_id = epoch.id, "Ledger ready");

        Ok(Self {
            db,
            lifecycle,
            epochs,
            batch,
            queue,
            events,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A reconciliation consumer with its own consumer id
    pub fn sync(&self) -> ReconciliationSync {
        ReconciliationSync::new(
            self.queue.clone(),
            self.lifecycle.clone(),
            self.epochs.clone(),
            self.batch.clone(),
            self.config.claim_batch_size,
        )
    }

    // =========================================================================
    // Users and requests
    // =========================================================================

    pub fn register_user(&self, wallet: &str) -> Result<UserRow> {
        self.lifecycle.register_user(wallet)
    }

    pub fn create_deposit_request(&self, wallet: &str, amount: Amount) -> Result<RequestId> {
        self.lifecycle.create_deposit(wallet, amount, None).map(|r| r.id)
    }

    pub fn create_withdrawal_request(&self, wallet: &str, amount: Amount) -> Result<RequestId> {
        self.lifecycle.create_withdrawal(wallet, amount, None).map(|r| r.id)
    }

    pub fn create_borrow_request(&self, wallet: &str, amount: Amount, collateral: Amount) -> Result<RequestId> {
        self.lifecycle.create_borrow(wallet, amount, collateral, None).map(|r| r.id)
    }

    // =========================================================================
    // Privileged processing
    // =========================================================================

    pub fn process_deposit(&self, principal: &Principal, id: RequestId) -> Result<ProcessOutcome> {
        self.lifecycle.process_deposit(principal, id)
    }

    /// Release up to the eligible amount; `cap` limits it further
    pub fn process_withdrawal(&self, principal: &Principal, id: RequestId, cap: Option<Amount>) -> Result<ProcessOutcome> {
        self.lifecycle.process_withdrawal(principal, id, cap)
    }

    pub fn process_borrow(&self, principal: &Principal, id: RequestId) -> Result<ProcessOutcome> {
        self.lifecycle.process_borrow(principal, id)
    }

    pub fn batch_process(
        &self,
        principal: &Principal,
        request_type: RequestType,
        ids: &[RequestId],
    ) -> Result<ProcessingEventRow> {
        let items: Vec<BatchItem> = ids.iter().copied().map(BatchItem::from).collect();
        self.batch.process(principal, request_type, &items)
    }

    pub fn close_current_epoch(&self, principal: &Principal) -> Result<EpochRollover> {
        self.epochs.close_current_epoch(principal)
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    pub fn enqueue_event(
        &self,
        external_id: &ExternalEventId,
        event: &ChainEvent,
        position: EventPosition,
    ) -> Result<EnqueueOutcome> {
        self.queue.enqueue(external_id, event, position)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn get_user(&self, wallet: &str) -> Result<Option<UserRow>> {
        self.lifecycle.get_user(wallet)
    }

    pub fn list_users(&self, limit: u32, offset: u32) -> Result<Vec<UserRow>> {
        self.lifecycle.list_users(limit, offset)
    }

    pub fn get_request(&self, id: RequestId) -> Result<Option<RequestRow>> {
        self.lifecycle.get_request(id)
    }

    pub fn get_current_epoch(&self) -> Result<Option<EpochRow>> {
        self.epochs.current_epoch()
    }

    pub fn status(&self) -> Result<LedgerStatus> {
        Ok(LedgerStatus {
            current_epoch: self.get_current_epoch()?,
            db: self.db.stats()?,
            queue: self.queue.stats()?,
        })
    }
}
