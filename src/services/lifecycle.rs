//! Request lifecycle manager
//!
//! Owns the per-request state machine and every balance mutation:
//!
//! ```text
//! create_* ──> Pending ──process──> Processed
//!                 │
//!                 └──(withdrawal, eligible < amount)──> PartiallyProcessed
//!                                                         └─ successor: Pending(remainder)
//! ```
//!
//! Each transition takes the owning user's lock, then the current-epoch lock,
//! then runs inside one SQLite transaction. Rewards are accrued before any
//! balance is read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::amount::Amount;
use crate::auth::{Operation, Principal};
use crate::clock::{elapsed_secs, Clock};
use crate::config::Config;
use crate::db::{
    self, epochs, executions, requests, users, validation_failures, EpochId, KycStatus, LedgerDb, NewExecution,
    NewRequest, NewValidationFailure, RequestId, RequestQuery, RequestRow, RequestStatus, RequestType, UserRow,
    ValidationFailureRow,
};
use crate::error::{LedgerError, Result};
use crate::locks::{user_key, LockTable, CURRENT_EPOCH_KEY};
use crate::rewards;

use super::events::{EventBus, LedgerNotification};

/// Vault parameters the lifecycle rules depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultParams {
    pub min_deposit_amount: Amount,
    pub min_withdrawal_amount: Amount,
    pub min_borrow_amount: Amount,
    pub reward_apr_bps: u32,
    pub collateral_ratio_bps: u32,
}

impl From<&Config> for VaultParams {
    fn from(config: &Config) -> Self {
        Self {
            min_deposit_amount: config.min_deposit_amount,
            min_withdrawal_amount: config.min_withdrawal_amount,
            min_borrow_amount: config.min_borrow_amount,
            reward_apr_bps: config.reward_apr_bps,
            collateral_ratio_bps: config.collateral_ratio_bps,
        }
    }
}

/// Result of processing one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub request_id: RequestId,
    pub request_type: RequestType,
    pub wallet: String,
    pub processed_amount: Amount,
    pub remaining: Amount,
    /// Set when a withdrawal was partially fulfilled
    pub successor_id: Option<RequestId>,
    pub fully_processed: bool,
    pub epoch_id: Option<EpochId>,
}

/// How much of a withdrawal one transition releases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The partial fulfillment rule, optionally capped
    Eligible { cap: Option<Amount> },
    /// Exactly this much (bounded by the request amount), as executed on-chain
    Exact(Amount),
}

pub struct LifecycleService {
    db: Arc<LedgerDb>,
    locks: Arc<LockTable>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    params: VaultParams,
}

impl LifecycleService {
    pub fn new(
        db: Arc<LedgerDb>,
        locks: Arc<LockTable>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        params: VaultParams,
    ) -> Self {
        Self {
            db,
            locks,
            clock,
            events,
            params,
        }
    }

    pub fn params(&self) -> &VaultParams {
        &self.params
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get_user(&self, wallet: &str) -> Result<Option<UserRow>> {
        self.db.with_conn(|conn| users::get_user(conn, wallet))
    }

    /// Users in registration order, archived ones included
    pub fn list_users(&self, limit: u32, offset: u32) -> Result<Vec<UserRow>> {
        self.db.with_conn(|conn| users::list_users(conn, limit, offset))
    }

    pub fn get_request(&self, id: RequestId) -> Result<Option<RequestRow>> {
        self.db.with_conn(|conn| requests::get_request(conn, id))
    }

    pub fn get_request_by_on_chain_id(&self, on_chain_id: u64) -> Result<Option<RequestRow>> {
        self.db.with_conn(|conn| requests::get_by_on_chain_id(conn, on_chain_id))
    }

    pub fn list_requests(&self, query: &RequestQuery) -> Result<Vec<RequestRow>> {
        self.db.with_conn(|conn| requests::list_requests(conn, query))
    }

    pub fn executions_for_request(&self, id: RequestId) -> Result<Vec<db::RequestExecutionRow>> {
        self.db.with_conn(|conn| executions::list_for_request(conn, id))
    }

    /// Most recent first
    pub fn executions_for_wallet(&self, wallet: &str, limit: u32) -> Result<Vec<db::RequestExecutionRow>> {
        self.db.with_conn(|conn| executions::list_for_wallet(conn, wallet, limit))
    }

    pub fn validation_failures(&self, wallet: &str) -> Result<Vec<ValidationFailureRow>> {
        self.db.with_conn(|conn| validation_failures::list_for_wallet(conn, wallet))
    }

    pub fn reward_history(&self, wallet: &str) -> Result<Vec<db::RewardAccrualRow>> {
        self.db.with_conn(|conn| db::rewards::list_for_wallet(conn, wallet, None))
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub fn register_user(&self, wallet: &str) -> Result<UserRow> {
        validate_wallet(wallet)?;
        let _user_lock = self.locks.acquire(user_key(wallet))?;

        let now = self.clock.now();
        let user = self.db.with_tx(|tx| users::insert_user(tx, wallet, now))?;

        info!(wallet = %wallet, "User registered");
        self.events.emit(LedgerNotification::UserRegistered {
            wallet: wallet.to_string(),
        });
        Ok(user)
    }

    /// Boundary for the KYC collaborator; the core never decides KYC itself
    pub fn record_kyc_status(&self, principal: &Principal, wallet: &str, status: KycStatus) -> Result<()> {
        principal.require(Operation::RecordKycStatus)?;
        let _user_lock = self.locks.acquire(user_key(wallet))?;

        let now = self.clock.now();
        self.db.with_tx(|tx| users::set_kyc_status(tx, wallet, status, now))?;

        self.events.emit(LedgerNotification::KycStatusRecorded {
            wallet: wallet.to_string(),
            status,
        });
        Ok(())
    }

    /// Soft-archive a user; archived users cannot open new requests
    pub fn archive_user(&self, principal: &Principal, wallet: &str) -> Result<()> {
        principal.require(Operation::ArchiveUser)?;
        let _user_lock = self.locks.acquire(user_key(wallet))?;

        let now = self.clock.now();
        self.db.with_tx(|tx| users::set_archived(tx, wallet, now))?;

        info!(wallet = %wallet, principal = %principal.id, "User archived");
        self.events.emit(LedgerNotification::UserArchived {
            wallet: wallet.to_string(),
        });
        Ok(())
    }

    /// Record a request the contract rejected. Balances are untouched.
    ///
    /// Returns false when `source_event_id` was already recorded.
    pub fn record_validation_failure(&self, failure: &NewValidationFailure<'_>) -> Result<bool> {
        let now = self.clock.now();
        let recorded = self.db.with_tx(|tx| validation_failures::insert_if_absent(tx, failure, now))?;

        if recorded {
            info!(
                wallet = %failure.wallet,
                request_type = ?failure.request_type,
                amount = %failure.amount,
                reason = ?failure.reason,
                "On-chain validation failure recorded"
            );
            self.events.emit(LedgerNotification::ValidationFailureRecorded {
                wallet: failure.wallet.to_string(),
                request_type: failure.request_type,
                amount: failure.amount,
            });
        }
        Ok(recorded)
    }

    // =========================================================================
    // Request Creation
    // =========================================================================

    /// Open a pending deposit. A known `on_chain_id` returns the existing request unchanged.
    pub fn create_deposit(&self, wallet: &str, amount: Amount, on_chain_id: Option<u64>) -> Result<RequestRow> {
        check_amount(amount, self.params.min_deposit_amount)?;
        let _user_lock = self.locks.acquire(user_key(wallet))?;
        let now = self.clock.now();

        let (request, created) = self.db.with_tx(|tx| {
            if let Some(existing) = find_on_chain(tx, on_chain_id)? {
                return Ok((existing, false));
            }

            let mut user = users::require_active_user(tx, wallet)?;
            user.pending_deposits = user.pending_deposits.try_add(amount, "pending deposits")?;
            user.updated_at = now;
            users::save_balances(tx, &user)?;

            let request = requests::insert_request(
                tx,
                &NewRequest {
                    request_type: RequestType::Deposit,
                    wallet: wallet.to_string(),
                    amount,
                    collateral_amount: None,
                    parent_id: None,
                    on_chain_id,
                    created_at: now,
                },
            )?;
            Ok((request, true))
        })?;

        if created {
            self.announce_created(&request);
        }
        Ok(request)
    }

    /// Open a pending withdrawal, reserving `amount` out of the active balance
    pub fn create_withdrawal(&self, wallet: &str, amount: Amount, on_chain_id: Option<u64>) -> Result<RequestRow> {
        check_amount(amount, self.params.min_withdrawal_amount)?;
        let _user_lock = self.locks.acquire(user_key(wallet))?;
        let now = self.clock.now();

        let (request, accrued, created) = self.db.with_tx(|tx| {
            if let Some(existing) = find_on_chain(tx, on_chain_id)? {
                return Ok((existing, Amount::ZERO, false));
            }

            let mut user = users::require_active_user(tx, wallet)?;
            let epoch_id = epochs::get_active_epoch(tx)?.map(|e| e.id);
            let accrued = self.accrue_into(tx, &mut user, now, epoch_id)?;

            if amount > user.active_balance {
                return Err(LedgerError::InsufficientBalance {
                    requested: amount,
                    available: user.active_balance,
                });
            }

            user.active_balance = user.active_balance.try_sub(amount, "active balance")?;
            user.pending_withdrawals = user.pending_withdrawals.try_add(amount, "pending withdrawals")?;
            user.updated_at = now;
            users::save_balances(tx, &user)?;

            let request = requests::insert_request(
                tx,
                &NewRequest {
                    request_type: RequestType::Withdrawal,
                    wallet: wallet.to_string(),
                    amount,
                    collateral_amount: None,
                    parent_id: None,
                    on_chain_id,
                    created_at: now,
                },
            )?;
            Ok((request, accrued, true))
        })?;

        self.announce_accrual(wallet, accrued);
        if created {
            self.announce_created(&request);
        }
        Ok(request)
    }

    /// Open a pending borrow. Collateral is checked before the minimum amount.
    pub fn create_borrow(
        &self,
        wallet: &str,
        amount: Amount,
        collateral: Amount,
        on_chain_id: Option<u64>,
    ) -> Result<RequestRow> {
        if amount.is_zero() {
            return Err(LedgerError::AmountZero);
        }
        let required = rewards::required_collateral(amount, self.params.collateral_ratio_bps)?;
        if collateral < required {
            return Err(LedgerError::InsufficientCollateral {
                required,
                provided: collateral,
            });
        }
        if amount < self.params.min_borrow_amount {
            return Err(LedgerError::AmountTooLow {
                amount,
                minimum: self.params.min_borrow_amount,
            });
        }

        let _user_lock = self.locks.acquire(user_key(wallet))?;
        let now = self.clock.now();

        let (request, created) = self.db.with_tx(|tx| {
            if let Some(existing) = find_on_chain(tx, on_chain_id)? {
                return Ok((existing, false));
            }

            users::require_active_user(tx, wallet)?;

            let request = requests::insert_request(
                tx,
                &NewRequest {
                    request_type: RequestType::Borrow,
                    wallet: wallet.to_string(),
                    amount,
                    collateral_amount: Some(collateral),
                    parent_id: None,
                    on_chain_id,
                    created_at: now,
                },
            )?;
            Ok((request, true))
        })?;

        if created {
            self.announce_created(&request);
        }
        Ok(request)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    pub fn process_deposit(&self, principal: &Principal, id: RequestId) -> Result<ProcessOutcome> {
        self.process(principal, id, RequestType::Deposit, None)
    }

    /// `cap` further limits how much of the withdrawal may be released
    pub fn process_withdrawal(&self, principal: &Principal, id: RequestId, cap: Option<Amount>) -> Result<ProcessOutcome> {
        self.process(principal, id, RequestType::Withdrawal, cap)
    }

    pub fn process_borrow(&self, principal: &Principal, id: RequestId) -> Result<ProcessOutcome> {
        self.process(principal, id, RequestType::Borrow, None)
    }

    /// Process request `id`, which must be of `expected` type and still pending
    pub fn process(
        &self,
        principal: &Principal,
        id: RequestId,
        expected: RequestType,
        cap: Option<Amount>,
    ) -> Result<ProcessOutcome> {
        principal.require(Operation::ProcessRequest)?;

        // Resolve the owner first so the user lock is taken before the epoch lock
        let wallet = self.owner_of(id)?;
        let _user_lock = self.locks.acquire(user_key(&wallet))?;
        let _epoch_lock = self.locks.acquire(CURRENT_EPOCH_KEY)?;
        let now = self.clock.now();

        let (outcome, accrued) = self.db.with_tx(|tx| {
            let request = requests::get_request(tx, id)?
                .ok_or_else(|| LedgerError::NotFound(format!("request {}", id)))?;
            check_processable(&request, expected)?;
            self.apply_transition(tx, request, Release::Eligible { cap }, None, now)
        })?;

        self.announce_processed(principal, &outcome, accrued);
        Ok(outcome)
    }

    /// Settle the open tail of the chain starting at request `id`.
    ///
    /// A partially fulfilled request hands its remainder to a successor; this
    /// follows `successor_id` to the request still pending. With a
    /// `source_event_id`, a second settlement from the same chain event fails
    /// with `AlreadyProcessed` and changes nothing.
    pub fn settle_chain(
        &self,
        principal: &Principal,
        id: RequestId,
        expected: Option<RequestType>,
        release: Release,
        source_event_id: Option<&str>,
    ) -> Result<ProcessOutcome> {
        principal.require(Operation::ProcessRequest)?;

        let wallet = self.owner_of(id)?;
        let _user_lock = self.locks.acquire(user_key(&wallet))?;
        let _epoch_lock = self.locks.acquire(CURRENT_EPOCH_KEY)?;
        let now = self.clock.now();

        let (outcome, accrued) = self.db.with_tx(|tx| {
            if let Some(source) = source_event_id {
                if let Some(done) = executions::get_by_source(tx, source)? {
                    debug!(source_event_id = %source, request_id = done.request_id, "Chain event already settled");
                    return Err(LedgerError::AlreadyProcessed(done.request_id));
                }
            }

            let mut request = requests::get_request(tx, id)?
                .ok_or_else(|| LedgerError::NotFound(format!("request {}", id)))?;
            if let Some(expected) = expected {
                check_type(&request, expected)?;
            }
            while request.is_processed() {
                let next = request.successor_id.ok_or(LedgerError::AlreadyProcessed(request.id))?;
                request = requests::get_request(tx, next)?
                    .ok_or_else(|| LedgerError::NotFound(format!("request {}", next)))?;
            }

            self.apply_transition(tx, request, release, source_event_id, now)
        })?;

        self.announce_processed(principal, &outcome, accrued);
        Ok(outcome)
    }

    /// Settle the request recorded under `on_chain_id` as the chain executed it.
    ///
    /// `released` is the amount the contract paid out; for withdrawals it
    /// replaces the eligibility rule.
    pub fn settle_on_chain(
        &self,
        principal: &Principal,
        on_chain_id: u64,
        released: Option<Amount>,
        source_event_id: Option<&str>,
    ) -> Result<ProcessOutcome> {
        let request = self
            .get_request_by_on_chain_id(on_chain_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("on-chain request {}", on_chain_id)))?;

        let release = match (request.request_type, released) {
            (RequestType::Withdrawal, Some(amount)) => Release::Exact(amount),
            _ => Release::Eligible { cap: None },
        };
        self.settle_chain(principal, request.id, None, release, source_event_id)
    }

    fn owner_of(&self, id: RequestId) -> Result<String> {
        match self.get_request(id)? {
            Some(request) => Ok(request.wallet),
            None => Err(LedgerError::NotFound(format!("request {}", id))),
        }
    }

    /// Apply one pending request inside `tx`; returns the outcome and the rewards accrued on the way
    fn apply_transition(
        &self,
        tx: &Connection,
        request: RequestRow,
        release: Release,
        source_event_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(ProcessOutcome, Amount)> {
        let mut user = users::get_user(tx, &request.wallet)?
            .ok_or_else(|| LedgerError::NotRegistered(request.wallet.clone()))?;
        let epoch = epochs::get_active_epoch(tx)?;
        let epoch_id = epoch.as_ref().map(|e| e.id);
        let accrued = self.accrue_into(tx, &mut user, now, epoch_id)?;

        let (processed_amount, successor_id) = match request.request_type {
            RequestType::Deposit => {
                user.pending_deposits = user.pending_deposits.try_sub(request.amount, "pending deposits")?;
                user.active_balance = user.active_balance.try_add(request.amount, "active balance")?;
                user.total_deposited = user.total_deposited.try_add(request.amount, "total deposited")?;
                (request.amount, None)
            }
            RequestType::Borrow => {
                user.active_balance = user.active_balance.try_add(request.amount, "active balance")?;
                user.total_borrowed = user.total_borrowed.try_add(request.amount, "total borrowed")?;
                (request.amount, None)
            }
            RequestType::Withdrawal => {
                let released = match release {
                    Release::Exact(amount) => amount.min(request.amount),
                    Release::Eligible { cap } => {
                        // Measured from the epoch start; a request outside any epoch waits from its creation
                        let waited_from = epoch.as_ref().map(|e| e.start_at).unwrap_or(request.created_at);
                        let eligible = rewards::eligible_withdrawal(
                            request.amount,
                            self.params.reward_apr_bps,
                            elapsed_secs(waited_from, now),
                        )?;
                        cap.map_or(eligible, |cap| eligible.min(cap))
                    }
                };

                user.pending_withdrawals = user.pending_withdrawals.try_sub(released, "pending withdrawals")?;
                user.total_withdrawn = user.total_withdrawn.try_add(released, "total withdrawn")?;

                if released < request.amount {
                    let successor = requests::insert_request(
                        tx,
                        &NewRequest {
                            request_type: RequestType::Withdrawal,
                            wallet: request.wallet.clone(),
                            amount: request.amount.try_sub(released, "withdrawal remainder")?,
                            collateral_amount: None,
                            parent_id: Some(request.id),
                            on_chain_id: None,
                            created_at: request.created_at,
                        },
                    )?;
                    (released, Some(successor.id))
                } else {
                    (request.amount, None)
                }
            }
        };

        let remaining = request.amount.try_sub(processed_amount, "remaining amount")?;
        let status = if successor_id.is_some() {
            RequestStatus::PartiallyProcessed
        } else {
            RequestStatus::Processed
        };

        requests::mark_processed(tx, request.id, status, processed_amount, successor_id, now)?;

        user.updated_at = now;
        users::save_balances(tx, &user)?;

        if let Some(epoch_id) = epoch_id {
            epochs::increment_counter(tx, epoch_id, request.request_type)?;
        }

        executions::insert_execution(
            tx,
            &NewExecution {
                request_id: request.id,
                wallet: &request.wallet,
                request_type: request.request_type,
                processed_amount,
                remaining_amount: remaining,
                successor_id,
                epoch_id,
                source_event_id,
                executed_at: now,
            },
        )?;

        let outcome = ProcessOutcome {
            request_id: request.id,
            request_type: request.request_type,
            wallet: request.wallet,
            processed_amount,
            remaining,
            successor_id,
            fully_processed: successor_id.is_none(),
            epoch_id,
        };
        Ok((outcome, accrued))
    }

    fn announce_processed(&self, principal: &Principal, outcome: &ProcessOutcome, accrued: Amount) {
        debug!(
            request_id = outcome.request_id,
            principal = %principal.id,
            processed = %outcome.processed_amount,
            successor_id = ?outcome.successor_id,
            "Request transition committed"
        );

        self.announce_accrual(&outcome.wallet, accrued);
        self.events.emit(LedgerNotification::RequestProcessed {
            request_id: outcome.request_id,
            request_type: outcome.request_type,
            wallet: outcome.wallet.clone(),
            processed_amount: outcome.processed_amount,
            remaining: outcome.remaining,
            successor_id: outcome.successor_id,
            epoch_id: outcome.epoch_id,
        });
    }

    // =========================================================================
    // Rewards
    // =========================================================================

    /// Bring the user's reward balance up to now; returns the amount accrued
    pub fn accrue_rewards(&self, wallet: &str) -> Result<Amount> {
        let _user_lock = self.locks.acquire(user_key(wallet))?;
        let now = self.clock.now();

        let accrued = self.db.with_tx(|tx| {
            let mut user = users::get_user(tx, wallet)?
                .ok_or_else(|| LedgerError::NotRegistered(wallet.to_string()))?;
            let epoch_id = epochs::get_active_epoch(tx)?.map(|e| e.id);
            let accrued = self.accrue_into(tx, &mut user, now, epoch_id)?;
            user.updated_at = now;
            users::save_balances(tx, &user)?;
            Ok(accrued)
        })?;

        self.announce_accrual(wallet, accrued);
        Ok(accrued)
    }

    /// Move the whole reward balance into the active balance
    pub fn claim_rewards(&self, wallet: &str) -> Result<Amount> {
        let _user_lock = self.locks.acquire(user_key(wallet))?;
        let now = self.clock.now();

        let (accrued, claimed) = self.db.with_tx(|tx| {
            let mut user = users::require_active_user(tx, wallet)?;
            let epoch_id = epochs::get_active_epoch(tx)?.map(|e| e.id);
            let accrued = self.accrue_into(tx, &mut user, now, epoch_id)?;

            let claimed = user.reward_balance;
            user.active_balance = user.active_balance.try_add(claimed, "active balance")?;
            user.reward_balance = Amount::ZERO;
            user.updated_at = now;
            users::save_balances(tx, &user)?;
            db::rewards::mark_claimed(tx, wallet, now)?;
            Ok((accrued, claimed))
        })?;

        self.announce_accrual(wallet, accrued);
        if !claimed.is_zero() {
            info!(wallet = %wallet, amount = %claimed, "Rewards claimed");
            self.events.emit(LedgerNotification::RewardsClaimed {
                wallet: wallet.to_string(),
                amount: claimed,
            });
        }
        Ok(claimed)
    }

    /// Accrue into `user` in memory and record the accrual; the caller saves the user
    fn accrue_into(
        &self,
        conn: &Connection,
        user: &mut UserRow,
        now: DateTime<Utc>,
        epoch_id: Option<EpochId>,
    ) -> Result<Amount> {
        let accrual = rewards::accrue(user.active_balance, self.params.reward_apr_bps, user.last_accrual_at, now)?;

        if !accrual.amount.is_zero() {
            user.reward_balance = user.reward_balance.try_add(accrual.amount, "reward balance")?;
            db::rewards::insert_accrual(
                conn,
                &user.wallet,
                epoch_id,
                accrual.amount,
                self.params.reward_apr_bps,
                user.last_accrual_at,
                accrual.accrued_at,
            )?;
        }
        user.last_accrual_at = accrual.accrued_at;

        Ok(accrual.amount)
    }

    fn announce_created(&self, request: &RequestRow) {
        info!(
            request_id = request.id,
            request_type = %request.request_type,
            wallet = %request.wallet,
            amount = %request.amount,
            "Request created"
        );
        self.events.emit(LedgerNotification::RequestCreated {
            request_id: request.id,
            request_type: request.request_type,
            wallet: request.wallet.clone(),
            amount: request.amount,
        });
    }

    fn announce_accrual(&self, wallet: &str, amount: Amount) {
        if !amount.is_zero() {
            self.events.emit(LedgerNotification::RewardsAccrued {
                wallet: wallet.to_string(),
                amount,
            });
        }
    }
}

fn validate_wallet(wallet: &str) -> Result<()> {
    if wallet.trim().is_empty() {
        return Err(LedgerError::InvalidInput("wallet must not be empty".into()));
    }
    Ok(())
}

fn check_amount(amount: Amount, minimum: Amount) -> Result<()> {
    if amount.is_zero() {
        return Err(LedgerError::AmountZero);
    }
    if amount < minimum {
        return Err(LedgerError::AmountTooLow { amount, minimum });
    }
    Ok(())
}

fn check_type(request: &RequestRow, expected: RequestType) -> Result<()> {
    if request.request_type != expected {
        return Err(LedgerError::WrongType {
            id: request.id,
            expected: expected.to_string(),
            actual: request.request_type.to_string(),
        });
    }
    Ok(())
}

fn check_processable(request: &RequestRow, expected: RequestType) -> Result<()> {
    check_type(request, expected)?;
    if request.is_processed() {
        return Err(LedgerError::AlreadyProcessed(request.id));
    }
    Ok(())
}

fn find_on_chain(conn: &Connection, on_chain_id: Option<u64>) -> Result<Option<RequestRow>> {
    match on_chain_id {
        Some(on_chain_id) => {
            let existing = requests::get_by_on_chain_id(conn, on_chain_id)?;
            if let Some(ref request) = existing {
                warn!(on_chain_id = on_chain_id, request_id = request.id, "On-chain request already recorded");
            }
            Ok(existing)
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PermissionLevel;
    use crate::clock::ManualClock;
    use crate::rewards::SECONDS_PER_YEAR;
    use std::time::Duration;

    const START: i64 = 1_700_000_000;

    struct Fixture {
        service: LifecycleService,
        clock: Arc<ManualClock>,
        db: Arc<LedgerDb>,
        admin: Principal,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::at_unix(START));
        let service = LifecycleService::new(
            db.clone(),
            Arc::new(LockTable::new(Duration::from_millis(100))),
            clock.clone(),
            Arc::new(EventBus::new()),
            VaultParams::from(&Config::default()),
        );
        Fixture {
            service,
            clock,
            db,
            admin: Principal::admin("operator"),
        }
    }

    fn open_epoch(f: &Fixture) {
        let now = f.clock.now();
        f.db.with_tx(|tx| epochs::insert_active_epoch(tx, 1, now)).unwrap();
    }

    fn funded(f: &Fixture, wallet: &str, amount: u128) {
        f.service.register_user(wallet).unwrap();
        let req = f.service.create_deposit(wallet, Amount::new(amount), None).unwrap();
        f.service.process_deposit(&f.admin, req.id).unwrap();
    }

    #[test]
    fn test_deposit_validation_order() {
        let f = fixture();
        assert!(matches!(
            f.service.create_deposit("0xghost", Amount::ZERO, None),
            Err(LedgerError::AmountZero)
        ));
        assert!(matches!(
            f.service.create_deposit("0xghost", Amount::new(5), None),
            Err(LedgerError::AmountTooLow { .. })
        ));
        assert!(matches!(
            f.service.create_deposit("0xghost", Amount::new(100_000_000), None),
            Err(LedgerError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_deposit_then_process() {
        let f = fixture();
        f.service.register_user("0xalice").unwrap();
        let req = f.service.create_deposit("0xalice", Amount::new(100_000_000), None).unwrap();

        let user = f.service.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.pending_deposits, Amount::new(100_000_000));

        let outcome = f.service.process_deposit(&f.admin, req.id).unwrap();
        assert!(outcome.fully_processed);
        assert_eq!(outcome.remaining, Amount::ZERO);

        let user = f.service.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(100_000_000));
        assert_eq!(user.pending_deposits, Amount::ZERO);
        assert_eq!(user.total_deposited, Amount::new(100_000_000));

        assert_eq!(f.service.executions_for_request(req.id).unwrap().len(), 1);
    }

    #[test]
    fn test_replayed_processing_is_rejected_without_side_effects() {
        let f = fixture();
        funded(&f, "0xalice", 100_000_000);
        let req = f.service.list_requests(&RequestQuery::default()).unwrap().remove(0);

        let before = f.service.get_user("0xalice").unwrap().unwrap();
        let replay = f.service.process_deposit(&f.admin, req.id);
        assert!(matches!(replay, Err(LedgerError::AlreadyProcessed(id)) if id == req.id));
        assert_eq!(f.service.get_user("0xalice").unwrap().unwrap(), before);
    }

    #[test]
    fn test_processing_requires_admin() {
        let f = fixture();
        f.service.register_user("0xalice").unwrap();
        let req = f.service.create_deposit("0xalice", Amount::new(100_000_000), None).unwrap();

        let user = Principal::new("0xalice", PermissionLevel::Authenticated);
        assert!(matches!(
            f.service.process_deposit(&user, req.id),
            Err(LedgerError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_wrong_type_and_not_found() {
        let f = fixture();
        f.service.register_user("0xalice").unwrap();
        let req = f.service.create_deposit("0xalice", Amount::new(100_000_000), None).unwrap();

        assert!(matches!(
            f.service.process_borrow(&f.admin, req.id),
            Err(LedgerError::WrongType { .. })
        ));
        assert!(matches!(
            f.service.process_deposit(&f.admin, 9_999),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_withdrawal_reserves_balance() {
        let f = fixture();
        funded(&f, "0xalice", 300_000_000);

        assert!(matches!(
            f.service.create_withdrawal("0xalice", Amount::new(400_000_000), None),
            Err(LedgerError::InsufficientBalance { .. })
        ));

        f.service.create_withdrawal("0xalice", Amount::new(200_000_000), None).unwrap();
        let user = f.service.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(100_000_000));
        assert_eq!(user.pending_withdrawals, Amount::new(200_000_000));

        // The reservation prevents spending the same funds twice
        assert!(matches!(
            f.service.create_withdrawal("0xalice", Amount::new(200_000_000), None),
            Err(LedgerError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_partial_withdrawal_creates_successor() {
        let f = fixture();
        open_epoch(&f);
        funded(&f, "0xalice", 100_000_000);
        let req = f.service.create_withdrawal("0xalice", Amount::new(100_000_000), None).unwrap();

        f.clock.advance_secs(1);
        let outcome = f.service.process_withdrawal(&f.admin, req.id, None).unwrap();
        assert_eq!(outcome.processed_amount, Amount::ZERO);
        assert!(!outcome.fully_processed);

        let original = f.service.get_request(req.id).unwrap().unwrap();
        assert_eq!(original.status, RequestStatus::PartiallyProcessed);
        assert_eq!(original.successor_id, outcome.successor_id);

        let successor = f.service.get_request(outcome.successor_id.unwrap()).unwrap().unwrap();
        assert_eq!(successor.status, RequestStatus::Pending);
        assert_eq!(successor.amount, Amount::new(100_000_000));
        assert_eq!(successor.parent_id, Some(req.id));
        assert_eq!(successor.created_at, original.created_at);

        // The closed original cannot be processed again
        assert!(matches!(
            f.service.process_withdrawal(&f.admin, req.id, None),
            Err(LedgerError::AlreadyProcessed(_))
        ));
    }

    #[test]
    fn test_withdrawal_cap_and_full_release() {
        let mut config = Config::default();
        config.reward_apr_bps = 10_000;
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::at_unix(START));
        let service = LifecycleService::new(
            db.clone(),
            Arc::new(LockTable::new(Duration::from_millis(100))),
            clock.clone(),
            Arc::new(EventBus::new()),
            VaultParams::from(&config),
        );
        let admin = Principal::admin("operator");

        db.with_tx(|tx| epochs::insert_active_epoch(tx, 1, clock.now())).unwrap();
        service.register_user("0xbob").unwrap();
        let dep = service.create_deposit("0xbob", Amount::new(1_000_000_000), None).unwrap();
        service.process_deposit(&admin, dep.id).unwrap();
        let wd = service.create_withdrawal("0xbob", Amount::new(1_000_000_000), None).unwrap();

        // A full year at 100% APR makes the whole amount eligible; the cap holds it back
        clock.advance_secs(SECONDS_PER_YEAR as i64);
        let capped = service.process_withdrawal(&admin, wd.id, Some(Amount::new(400_000_000))).unwrap();
        assert_eq!(capped.processed_amount, Amount::new(400_000_000));
        assert_eq!(capped.remaining, Amount::new(600_000_000));

        let rest = service.process_withdrawal(&admin, capped.successor_id.unwrap(), None).unwrap();
        assert!(rest.fully_processed);
        assert_eq!(rest.processed_amount, Amount::new(600_000_000));

        let user = service.get_user("0xbob").unwrap().unwrap();
        assert_eq!(user.pending_withdrawals, Amount::ZERO);
        assert_eq!(user.total_withdrawn, Amount::new(1_000_000_000));
    }

    #[test]
    fn test_borrow_validation_order() {
        let f = fixture();
        // Collateral is checked before the minimum and before registration
        assert!(matches!(
            f.service.create_borrow("0xghost", Amount::new(1_000), Amount::new(1_400), None),
            Err(LedgerError::InsufficientCollateral { .. })
        ));
        assert!(matches!(
            f.service.create_borrow("0xghost", Amount::new(1_000), Amount::new(1_500), None),
            Err(LedgerError::AmountTooLow { .. })
        ));
        assert!(matches!(
            f.service.create_borrow("0xghost", Amount::new(1_000_000_000), Amount::new(1_500_000_000), None),
            Err(LedgerError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_borrow_credits_on_processing() {
        let f = fixture();
        f.service.register_user("0xcarol").unwrap();
        let req = f
            .service
            .create_borrow("0xcarol", Amount::new(1_000_000_000), Amount::new(1_500_000_000), None)
            .unwrap();
        assert_eq!(req.collateral_amount, Some(Amount::new(1_500_000_000)));
        assert_eq!(f.service.get_user("0xcarol").unwrap().unwrap().active_balance, Amount::ZERO);

        f.service.process_borrow(&f.admin, req.id).unwrap();
        let user = f.service.get_user("0xcarol").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(1_000_000_000));
        assert_eq!(user.total_borrowed, Amount::new(1_000_000_000));
    }

    #[test]
    fn test_on_chain_creation_is_idempotent() {
        let f = fixture();
        f.service.register_user("0xalice").unwrap();
        let first = f.service.create_deposit("0xalice", Amount::new(100_000_000), Some(7)).unwrap();
        let again = f.service.create_deposit("0xalice", Amount::new(100_000_000), Some(7)).unwrap();
        assert_eq!(first.id, again.id);

        let user = f.service.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.pending_deposits, Amount::new(100_000_000));
    }

    #[test]
    fn test_rewards_accrue_and_claim() {
        let f = fixture();
        funded(&f, "0xalice", 1_000_000_000);

        f.clock.advance_secs(SECONDS_PER_YEAR as i64);
        let accrued = f.service.accrue_rewards("0xalice").unwrap();
        assert_eq!(accrued, Amount::new(50_000_000));

        let claimed = f.service.claim_rewards("0xalice").unwrap();
        assert_eq!(claimed, Amount::new(50_000_000));

        let user = f.service.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(1_050_000_000));
        assert_eq!(user.reward_balance, Amount::ZERO);

        let history = f.service.reward_history("0xalice").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, db::RewardStatus::Claimed);
    }

    #[test]
    fn test_archived_user_cannot_open_requests() {
        let f = fixture();
        f.service.register_user("0xdave").unwrap();
        f.service.archive_user(&f.admin, "0xdave").unwrap();

        assert!(matches!(
            f.service.create_deposit("0xdave", Amount::new(100_000_000), None),
            Err(LedgerError::NotRegistered(_))
        ));
        assert!(matches!(
            f.service.register_user("0xdave"),
            Err(LedgerError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_record_kyc_status_requires_admin() {
        let f = fixture();
        f.service.register_user("0xdave").unwrap();

        let owner = Principal::new("0xdave", PermissionLevel::Authenticated);
        assert!(matches!(
            f.service.record_kyc_status(&owner, "0xdave", KycStatus::Approved),
            Err(LedgerError::Unauthorized(_))
        ));
        assert_eq!(f.service.get_user("0xdave").unwrap().unwrap().kyc_status, KycStatus::Pending);

        f.service.record_kyc_status(&f.admin, "0xdave", KycStatus::Approved).unwrap();
        assert_eq!(f.service.get_user("0xdave").unwrap().unwrap().kyc_status, KycStatus::Approved);

        assert!(matches!(
            f.service.record_kyc_status(&f.admin, "0xnobody", KycStatus::Rejected),
            Err(LedgerError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_list_users_pages_in_registration_order() {
        let f = fixture();
        f.service.register_user("0xalice").unwrap();
        f.clock.advance_secs(1);
        f.service.register_user("0xbob").unwrap();
        f.clock.advance_secs(1);
        f.service.register_user("0xcarol").unwrap();

        let first: Vec<String> = f.service.list_users(2, 0).unwrap().into_iter().map(|u| u.wallet).collect();
        assert_eq!(first, vec!["0xalice", "0xbob"]);
        let rest = f.service.list_users(2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].wallet, "0xcarol");
    }

    #[test]
    fn test_chain_release_is_exact() {
        let f = fixture();
        open_epoch(&f);
        funded(&f, "0xalice", 300_000_000);
        let req = f.service.create_withdrawal("0xalice", Amount::new(300_000_000), Some(11)).unwrap();

        // The contract paid out everything, though the accrual rule would release nothing yet
        let outcome = f
            .service
            .settle_on_chain(&f.admin, 11, Some(Amount::new(300_000_000)), Some("0xexec:0"))
            .unwrap();
        assert!(outcome.fully_processed);
        assert_eq!(outcome.request_id, req.id);
        assert_eq!(outcome.processed_amount, Amount::new(300_000_000));

        let user = f.service.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.pending_withdrawals, Amount::ZERO);
        assert_eq!(user.total_withdrawn, Amount::new(300_000_000));

        let executions = f.service.executions_for_request(req.id).unwrap();
        assert_eq!(executions[0].source_event_id.as_deref(), Some("0xexec:0"));
    }

    #[test]
    fn test_chain_release_larger_than_request_is_bounded() {
        let f = fixture();
        funded(&f, "0xalice", 300_000_000);
        f.service.create_withdrawal("0xalice", Amount::new(100_000_000), Some(12)).unwrap();

        let outcome = f
            .service
            .settle_on_chain(&f.admin, 12, Some(Amount::new(900_000_000)), None)
            .unwrap();
        assert_eq!(outcome.processed_amount, Amount::new(100_000_000));
        assert_eq!(f.service.get_user("0xalice").unwrap().unwrap().total_withdrawn, Amount::new(100_000_000));
    }

    #[test]
    fn test_chain_remainder_follows_successor() {
        let f = fixture();
        open_epoch(&f);
        funded(&f, "0xalice", 500_000_000);
        let req = f.service.create_withdrawal("0xalice", Amount::new(500_000_000), Some(21)).unwrap();

        let first = f
            .service
            .settle_on_chain(&f.admin, 21, Some(Amount::new(200_000_000)), Some("0xa:0"))
            .unwrap();
        assert_eq!(first.processed_amount, Amount::new(200_000_000));
        assert_eq!(first.remaining, Amount::new(300_000_000));
        let successor = first.successor_id.unwrap();

        // The same on-chain id now resolves to the closed original; settlement moves to its successor
        let rest = f
            .service
            .settle_on_chain(&f.admin, 21, Some(Amount::new(300_000_000)), Some("0xb:0"))
            .unwrap();
        assert_eq!(rest.request_id, successor);
        assert!(rest.fully_processed);

        assert_eq!(
            f.service.get_request(req.id).unwrap().unwrap().status,
            RequestStatus::PartiallyProcessed
        );
        assert_eq!(f.service.get_request(successor).unwrap().unwrap().status, RequestStatus::Processed);

        let user = f.service.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.pending_withdrawals, Amount::ZERO);
        assert_eq!(user.total_withdrawn, Amount::new(500_000_000));

        let sources: Vec<Option<String>> = f
            .service
            .executions_for_wallet("0xalice", 2)
            .unwrap()
            .into_iter()
            .map(|e| e.source_event_id)
            .collect();
        assert_eq!(sources, vec![Some("0xb:0".to_string()), Some("0xa:0".to_string())]);

        // Fully settled chain
        assert!(matches!(
            f.service.settle_on_chain(&f.admin, 21, Some(Amount::new(1)), Some("0xc:0")),
            Err(LedgerError::AlreadyProcessed(id)) if id == successor
        ));
    }

    #[test]
    fn test_redelivered_chain_event_settles_once() {
        let f = fixture();
        open_epoch(&f);
        funded(&f, "0xalice", 500_000_000);
        f.service.create_withdrawal("0xalice", Amount::new(500_000_000), Some(31)).unwrap();

        let first = f
            .service
            .settle_on_chain(&f.admin, 31, Some(Amount::new(200_000_000)), Some("0xa:0"))
            .unwrap();
        let before = f.service.get_user("0xalice").unwrap().unwrap();

        // Without the source id this would release 200 more from the successor
        let replay = f.service.settle_on_chain(&f.admin, 31, Some(Amount::new(200_000_000)), Some("0xa:0"));
        assert!(matches!(replay, Err(LedgerError::AlreadyProcessed(id)) if id == first.request_id));
        assert_eq!(f.service.get_user("0xalice").unwrap().unwrap(), before);
        assert!(f
            .service
            .executions_for_request(first.successor_id.unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_validation_failure_leaves_balances_alone() {
        let f = fixture();
        funded(&f, "0xalice", 100_000_000);
        let before = f.service.get_user("0xalice").unwrap().unwrap();

        let failure = NewValidationFailure {
            wallet: "0xalice",
            request_type: Some(RequestType::Withdrawal),
            amount: Amount::new(900_000_000),
            reason: Some("insufficient balance"),
            source_event_id: Some("0xbad:2"),
        };
        assert!(f.service.record_validation_failure(&failure).unwrap());
        assert!(!f.service.record_validation_failure(&failure).unwrap());

        assert_eq!(f.service.get_user("0xalice").unwrap().unwrap(), before);
        let recorded = f.service.validation_failures("0xalice").unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].amount, Amount::new(900_000_000));
        assert_eq!(recorded[0].reason.as_deref(), Some("insufficient balance"));
    }

    #[test]
    fn test_epoch_counters_follow_processing() {
        let f = fixture();
        open_epoch(&f);
        funded(&f, "0xalice", 100_000_000);

        let epoch = f.db.with_conn(epochs::get_active_epoch).unwrap().unwrap();
        assert_eq!(epoch.deposits_processed, 1);
        assert_eq!(epoch.withdrawals_processed, 0);
    }
}
