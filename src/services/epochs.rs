//! Epoch scheduler
//!
//! Epochs move linearly `active -> processing -> completed`. Exactly one epoch
//! is active at a time; closing it opens `id + 1` in the same transaction so
//! ids never skip.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::auth::{Operation, Principal};
use crate::clock::{elapsed_secs, Clock};
use crate::db::{epochs, EpochId, EpochRow, EpochStatus, LedgerDb};
use crate::error::{LedgerError, Result};
use crate::locks::{LockTable, CURRENT_EPOCH_KEY};

use super::events::{EventBus, LedgerNotification};

/// The epoch that was closed and the one opened in its place
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochRollover {
    pub closed: EpochRow,
    pub opened: EpochRow,
}

pub struct EpochScheduler {
    db: Arc<LedgerDb>,
    locks: Arc<LockTable>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    /// 0 disables automatic rollover
    epoch_duration_secs: u64,
}

impl EpochScheduler {
    pub fn new(
        db: Arc<LedgerDb>,
        locks: Arc<LockTable>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        epoch_duration_secs: u64,
    ) -> Self {
        Self {
            db,
            locks,
            clock,
            events,
            epoch_duration_secs,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn current_epoch(&self) -> Result<Option<EpochRow>> {
        self.db.with_conn(epochs::get_active_epoch)
    }

    pub fn get_epoch(&self, id: EpochId) -> Result<Option<EpochRow>> {
        self.db.with_conn(|conn| epochs::get_epoch(conn, id))
    }

    /// Most recent first
    pub fn list_epochs(&self, limit: u32) -> Result<Vec<EpochRow>> {
        self.db.with_conn(|conn| epochs::list_epochs(conn, limit))
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Open epoch 1 on a fresh ledger; otherwise return the active epoch
    pub fn ensure_initial_epoch(&self) -> Result<EpochRow> {
        let _epoch_lock = self.locks.acquire(CURRENT_EPOCH_KEY)?;
        let now = self.clock.now();

        let (epoch, opened) = self.db.with_tx(|tx| {
            if let Some(active) = epochs::get_active_epoch(tx)? {
                return Ok((active, false));
            }
            let next = epochs::latest_epoch_id(tx)? + 1;
            Ok((epochs::insert_active_epoch(tx, next, now)?, true))
        })?;

        if opened {
            info!(epoch_id = epoch.id, "Epoch opened");
            self.events.emit(LedgerNotification::EpochOpened { epoch_id: epoch.id });
        }
        Ok(epoch)
    }

    /// Close the active epoch and open the next one
    pub fn close_current_epoch(&self, principal: &Principal) -> Result<EpochRollover> {
        principal.require(Operation::CloseEpoch)?;
        self.close_where(|_, _| true)?.ok_or(LedgerError::NoActiveEpoch)
    }

    /// Roll over if the active epoch has run for `epoch_duration_secs`
    pub fn close_if_expired(&self, principal: &Principal) -> Result<Option<EpochRollover>> {
        principal.require(Operation::CloseEpoch)?;
        if self.epoch_duration_secs == 0 {
            return Ok(None);
        }
        let duration = self.epoch_duration_secs;
        match self.close_where(|epoch, now| elapsed_secs(epoch.start_at, now) >= duration) {
            Err(LedgerError::NoActiveEpoch) => Ok(None),
            other => other,
        }
    }

    /// Close epoch `epoch_id` if it is the active one.
    ///
    /// `Ok(None)` when it was already completed; `NotFound` when it has not
    /// been opened yet.
    pub fn close_epoch(&self, principal: &Principal, epoch_id: EpochId) -> Result<Option<EpochRollover>> {
        principal.require(Operation::CloseEpoch)?;

        if let Some(rollover) = self.close_where(|epoch, _| epoch.id == epoch_id)? {
            return Ok(Some(rollover));
        }
        match self.get_epoch(epoch_id)? {
            Some(epoch) if epoch.status == EpochStatus::Completed => Ok(None),
            _ => Err(LedgerError::NotFound(format!("epoch {}", epoch_id))),
        }
    }

    /// Make sure epoch `epoch_id` exists, rolling over from `epoch_id - 1` if needed
    pub fn open_epoch(&self, principal: &Principal, epoch_id: EpochId) -> Result<Option<EpochRollover>> {
        principal.require(Operation::CloseEpoch)?;

        if self.get_epoch(epoch_id)?.is_some() {
            debug!(epoch_id = epoch_id, "Epoch already exists");
            return Ok(None);
        }
        if let Some(rollover) = self.close_where(|epoch, _| epoch.id + 1 == epoch_id)? {
            return Ok(Some(rollover));
        }
        // A later epoch than we can reach in one step; its predecessors come first
        match self.get_epoch(epoch_id)? {
            Some(_) => Ok(None),
            None => Err(LedgerError::NotFound(format!("epoch {}", epoch_id.saturating_sub(1)))),
        }
    }

    /// Close the active epoch if `should_close` holds; `NoActiveEpoch` when none is active
    fn close_where<F>(&self, should_close: F) -> Result<Option<EpochRollover>>
    where
        F: FnOnce(&EpochRow, DateTime<Utc>) -> bool,
    {
        let _epoch_lock = self.locks.acquire(CURRENT_EPOCH_KEY)?;
        let now = self.clock.now();

        let rollover = self.db.with_tx(|tx| {
            let active = epochs::get_active_epoch(tx)?.ok_or(LedgerError::NoActiveEpoch)?;
            if !should_close(&active, now) {
                return Ok(None);
            }

            epochs::set_status(tx, active.id, EpochStatus::Active, EpochStatus::Processing)?;
            epochs::complete_epoch(tx, active.id, now)?;
            let opened = epochs::insert_active_epoch(tx, active.id + 1, now)?;
            let closed = epochs::get_epoch(tx, active.id)?
                .ok_or_else(|| LedgerError::NotFound(format!("epoch {}", active.id)))?;

            Ok(Some(EpochRollover { closed, opened }))
        })?;

        if let Some(ref rollover) = rollover {
            info!(
                epoch_id = rollover.closed.id,
                next_epoch_id = rollover.opened.id,
                deposits = rollover.closed.deposits_processed,
                withdrawals = rollover.closed.withdrawals_processed,
                borrows = rollover.closed.borrows_processed,
                "Epoch rolled over"
            );
            self.events.emit(LedgerNotification::EpochClosed {
                epoch_id: rollover.closed.id,
                next_epoch_id: rollover.opened.id,
            });
            self.events.emit(LedgerNotification::EpochOpened {
                epoch_id: rollover.opened.id,
            });
        }
        Ok(rollover)
    }
}
