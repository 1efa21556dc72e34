//! Reconciliation sync
//!
//! Drains the ingestion queue into the ledger. Each typed event maps to
//! exactly one ledger call; replays of facts the ledger already holds count
//! as success, and conditions caused by out-of-order delivery are retried.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::Principal;
use crate::db::{NewValidationFailure, QueueStatus};
use crate::error::{LedgerError, Result};
use crate::services::batch::{BatchItem, BatchProcessor};
use crate::services::epochs::EpochScheduler;
use crate::services::lifecycle::LifecycleService;

use super::event_types::ChainEvent;
use super::queue::{ClaimedEvent, EventQueue};

/// Counts from one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub quarantined: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.quarantined += other.quarantined;
    }
}

/// Failures expected while events arrive out of order
pub fn is_sync_retryable(err: &LedgerError) -> bool {
    matches!(
        err,
        LedgerError::NotFound(_) | LedgerError::NotRegistered(_) | LedgerError::InsufficientBalance { .. }
    ) || err.is_retryable()
}

pub struct ReconciliationSync {
    queue: Arc<EventQueue>,
    lifecycle: Arc<LifecycleService>,
    epochs: Arc<EpochScheduler>,
    batch: Arc<BatchProcessor>,
    principal: Principal,
    consumer_id: String,
    claim_batch_size: u32,
}

impl ReconciliationSync {
    pub fn new(
        queue: Arc<EventQueue>,
        lifecycle: Arc<LifecycleService>,
        epochs: Arc<EpochScheduler>,
        batch: Arc<BatchProcessor>,
        claim_batch_size: u32,
    ) -> Self {
        Self {
            queue,
            lifecycle,
            epochs,
            batch,
            principal: Principal::system(),
            consumer_id: format!("sync-{}", uuid::Uuid::new_v4()),
            claim_batch_size,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Apply one event to the ledger.
    ///
    /// `external_id` identifies the chain log; settlements record it so a
    /// redelivered execution never releases funds twice.
    pub fn apply(&self, external_id: &str, event: &ChainEvent) -> Result<()> {
        match event {
            ChainEvent::UserRegistered { wallet } => match self.lifecycle.register_user(wallet) {
                Err(LedgerError::AlreadyRegistered(_)) => Ok(()),
                other => other.map(|_| ()),
            },

            ChainEvent::DepositRequested { request_id, wallet, amount } => {
                // The contract registers a depositor on first deposit
                if self.lifecycle.get_user(wallet)?.is_none() {
                    match self.lifecycle.register_user(wallet) {
                        Ok(_) | Err(LedgerError::AlreadyRegistered(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.lifecycle.create_deposit(wallet, *amount, Some(*request_id)).map(|_| ())
            }

            ChainEvent::WithdrawalRequested { request_id, wallet, amount } => self
                .lifecycle
                .create_withdrawal(wallet, *amount, Some(*request_id))
                .map(|_| ()),

            ChainEvent::BorrowRequested {
                request_id,
                wallet,
                amount,
                collateral,
            } => self
                .lifecycle
                .create_borrow(wallet, *amount, *collateral, Some(*request_id))
                .map(|_| ()),

            ChainEvent::RequestExecuted { request_id, amount } => {
                match self
                    .lifecycle
                    .settle_on_chain(&self.principal, *request_id, *amount, Some(external_id))
                {
                    Ok(_) | Err(LedgerError::AlreadyProcessed(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            ChainEvent::BatchProcessed {
                request_type,
                request_ids,
            } => {
                // Wait until every request in the batch has been ingested
                let mut items = Vec::with_capacity(request_ids.len());
                for on_chain_id in request_ids {
                    let request = self
                        .lifecycle
                        .get_request_by_on_chain_id(*on_chain_id)?
                        .ok_or_else(|| LedgerError::NotFound(format!("on-chain request {}", on_chain_id)))?;
                    items.push(BatchItem::from(request.id));
                }
                match self
                    .batch
                    .process_from_chain(&self.principal, *request_type, &items, external_id)
                {
                    Ok(_) | Err(LedgerError::EmptyBatch) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            ChainEvent::RequestValidationFailed {
                wallet,
                amount,
                request_type,
                reason,
            } => self
                .lifecycle
                .record_validation_failure(&NewValidationFailure {
                    wallet,
                    request_type: *request_type,
                    amount: *amount,
                    reason: reason.as_deref(),
                    source_event_id: Some(external_id),
                })
                .map(|_| ()),

            ChainEvent::EpochCreated { epoch_id } => self.epochs.open_epoch(&self.principal, *epoch_id).map(|_| ()),

            ChainEvent::EpochClosed { epoch_id } => self.epochs.close_epoch(&self.principal, *epoch_id).map(|_| ()),
        }
    }

    /// Claim one batch of events and apply each
    pub fn drain_once(&self) -> Result<DrainReport> {
        let claimed = self.queue.claim(&self.consumer_id, self.claim_batch_size)?;
        Ok(self.process_claimed(claimed))
    }

    /// One item's failure never stops the rest of the pass
    fn process_claimed(&self, claimed: Vec<ClaimedEvent>) -> DrainReport {
        let mut report = DrainReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for item in claimed {
            match self.handle(&item) {
                Ok(QueueStatus::Succeeded) => report.succeeded += 1,
                Ok(QueueStatus::Quarantined) => report.quarantined += 1,
                Ok(_) => report.retried += 1,
                Err(e) => {
                    // The lease lapses and the event is claimed again later
                    error!(
                        consumer = %self.consumer_id,
                        external_id = %item.external_id(),
                        error = %e,
                        "Event bookkeeping failed"
                    );
                    report.retried += 1;
                }
            }
        }
        report
    }

    /// Drain until a pass claims nothing
    pub fn drain(&self) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let report = self.drain_once()?;
            if report.claimed == 0 {
                return Ok(total);
            }
            total.absorb(report);
        }
    }

    fn handle(&self, item: &ClaimedEvent) -> Result<QueueStatus> {
        let external_id = item.external_id();

        let event = match &item.event {
            Ok(event) => event,
            Err(e) => {
                return self.queue.fail(external_id, &self.consumer_id, &format!("undecodable payload: {}", e), false);
            }
        };

        match self.apply(external_id, event) {
            Ok(()) => {
                debug!(external_id = %external_id, kind = event.kind(), "Event applied");
                self.queue.complete(external_id, &self.consumer_id)?;
                Ok(QueueStatus::Succeeded)
            }
            Err(e) => {
                let retryable = is_sync_retryable(&e);
                warn!(
                    external_id = %external_id,
                    kind = event.kind(),
                    error = %e,
                    retryable = retryable,
                    "Event application failed"
                );
                self.queue.fail(external_id, &self.consumer_id, &e.to_string(), retryable)
            }
        }
    }

    /// Poll the queue every `poll_interval` until `shutdown` flips to true.
    ///
    /// Each drain runs on a blocking thread; the ledger is synchronous.
    pub async fn run_consumer(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.consumer_id, "Reconciliation consumer starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let sync = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || sync.drain_once()).await {
                Ok(Ok(report)) if report.claimed > 0 => {
                    info!(
                        consumer = %self.consumer_id,
                        claimed = report.claimed,
                        succeeded = report.succeeded,
                        retried = report.retried,
                        quarantined = report.quarantined,
                        "Drain pass complete"
                    );
                    // More may be waiting; skip the sleep
                    continue;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(consumer = %self.consumer_id, error = %e, "Drain pass failed"),
                Err(e) => error!(consumer = %self.consumer_id, error = %e, "Drain task panicked"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(consumer = %self.consumer_id, "Reconciliation consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::config::Config;
    use crate::ingest::event_types::{EventPosition, ExternalEventId};
    use crate::clock::ManualClock;
    use crate::db::RequestType;
    use crate::services::Ledger;

    fn ledger() -> Ledger {
        Ledger::in_memory(&Config::default(), Arc::new(ManualClock::at_unix(1_700_000_000))).unwrap()
    }

    fn push(ledger: &Ledger, tx: &str, block: u64, event: ChainEvent) {
        ledger
            .enqueue_event(
                &ExternalEventId::new(tx, 0),
                &event,
                EventPosition { block_number: block, log_index: 0 },
            )
            .unwrap();
    }

    #[test]
    fn test_deposit_flow_auto_registers() {
        let ledger = ledger();
        let sync = ledger.sync();
        push(&ledger, "0x1", 1, ChainEvent::DepositRequested {
            request_id: 1,
            wallet: "0xalice".into(),
            amount: Amount::new(100_000_000),
        });
        push(&ledger, "0x2", 2, ChainEvent::RequestExecuted { request_id: 1, amount: None });

        let report = sync.drain().unwrap();
        assert_eq!(report.succeeded, 2);

        let user = ledger.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(100_000_000));
        assert_eq!(user.pending_deposits, Amount::ZERO);
    }

    #[test]
    fn test_out_of_order_execution_is_retried() {
        let ledger = ledger();
        let sync = ledger.sync();

        // Execution arrives before the request it executes
        push(&ledger, "0x2", 1, ChainEvent::RequestExecuted { request_id: 5, amount: None });
        let first = sync.drain_once().unwrap();
        assert_eq!(first.retried, 1);

        push(&ledger, "0x1", 2, ChainEvent::DepositRequested {
            request_id: 5,
            wallet: "0xbob".into(),
            amount: Amount::new(100_000_000),
        });
        assert_eq!(sync.drain_once().unwrap().succeeded, 1);

        let stats = ledger.queue.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
    }

    #[test]
    fn test_replayed_facts_succeed_without_double_counting() {
        let ledger = ledger();
        let sync = ledger.sync();
        let deposit = ChainEvent::DepositRequested {
            request_id: 1,
            wallet: "0xalice".into(),
            amount: Amount::new(100_000_000),
        };
        let executed = ChainEvent::RequestExecuted { request_id: 1, amount: None };

        sync.apply("0x1:0", &deposit).unwrap();
        sync.apply("0x2:0", &executed).unwrap();
        sync.apply("0x1:0", &deposit).unwrap();
        sync.apply("0x2:0", &executed).unwrap();
        sync.apply("0x3:0", &ChainEvent::UserRegistered { wallet: "0xalice".into() }).unwrap();

        let user = ledger.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(100_000_000));
        assert_eq!(user.pending_deposits, Amount::ZERO);
    }

    #[test]
    fn test_validation_failures_are_quarantined() {
        let ledger = ledger();
        let sync = ledger.sync();
        push(&ledger, "0x9", 1, ChainEvent::DepositRequested {
            request_id: 3,
            wallet: "0xalice".into(),
            amount: Amount::ZERO,
        });

        let report = sync.drain().unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(ledger.queue.list_quarantined(10).unwrap().len(), 1);
    }

    #[test]
    fn test_epoch_events() {
        let ledger = ledger();
        let sync = ledger.sync();

        sync.apply("0x1:0", &ChainEvent::EpochClosed { epoch_id: 1 }).unwrap();
        sync.apply("0x2:0", &ChainEvent::EpochCreated { epoch_id: 2 }).unwrap();
        sync.apply("0x1:0", &ChainEvent::EpochClosed { epoch_id: 1 }).unwrap();
        assert_eq!(ledger.get_current_epoch().unwrap().unwrap().id, 2);

        sync.apply("0x3:0", &ChainEvent::EpochCreated { epoch_id: 3 }).unwrap();
        assert_eq!(ledger.get_current_epoch().unwrap().unwrap().id, 3);

        let early = sync.apply("0x4:0", &ChainEvent::EpochClosed { epoch_id: 9 });
        assert!(matches!(early, Err(ref e) if is_sync_retryable(e)));
    }

    #[test]
    fn test_batch_waits_for_its_requests() {
        let ledger = ledger();
        let sync = ledger.sync();
        let batch = ChainEvent::BatchProcessed {
            request_type: RequestType::Deposit,
            request_ids: vec![1, 2],
        };

        sync.apply("0x1:0", &ChainEvent::DepositRequested {
            request_id: 1,
            wallet: "0xalice".into(),
            amount: Amount::new(100_000_000),
        })
        .unwrap();
        assert!(matches!(sync.apply("0x9:0", &batch), Err(LedgerError::NotFound(_))));

        sync.apply("0x2:0", &ChainEvent::DepositRequested {
            request_id: 2,
            wallet: "0xalice".into(),
            amount: Amount::new(200_000_000),
        })
        .unwrap();
        sync.apply("0x9:0", &batch).unwrap();
        sync.apply("0x9:0", &batch).unwrap();

        let user = ledger.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(300_000_000));
    }

    fn fund_and_request_withdrawal(ledger: &Ledger, sync: &ReconciliationSync, amount: u128) {
        sync.apply("0xd:0", &ChainEvent::DepositRequested {
            request_id: 1,
            wallet: "0xalice".into(),
            amount: Amount::new(500_000_000),
        })
        .unwrap();
        sync.apply("0xd:1", &ChainEvent::RequestExecuted { request_id: 1, amount: None }).unwrap();
        sync.apply("0xw:0", &ChainEvent::WithdrawalRequested {
            request_id: 2,
            wallet: "0xalice".into(),
            amount: Amount::new(amount),
        })
        .unwrap();
        assert_eq!(
            ledger.get_user("0xalice").unwrap().unwrap().pending_withdrawals,
            Amount::new(amount)
        );
    }

    #[test]
    fn test_chain_releases_full_withdrawal() {
        let ledger = ledger();
        let sync = ledger.sync();
        fund_and_request_withdrawal(&ledger, &sync, 300_000_000);

        // At epoch start the accrual rule alone would release nothing
        push(&ledger, "0xe", 5, ChainEvent::RequestExecuted {
            request_id: 2,
            amount: Some(Amount::new(300_000_000)),
        });
        assert_eq!(sync.drain().unwrap().succeeded, 1);

        let request = ledger.lifecycle.get_request_by_on_chain_id(2).unwrap().unwrap();
        assert_eq!(request.status, crate::db::RequestStatus::Processed);
        assert!(request.successor_id.is_none());

        let user = ledger.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.pending_withdrawals, Amount::ZERO);
        assert_eq!(user.total_withdrawn, Amount::new(300_000_000));
        assert_eq!(user.active_balance, Amount::new(200_000_000));
    }

    #[test]
    fn test_remainder_executes_later() {
        let ledger = ledger();
        let sync = ledger.sync();
        fund_and_request_withdrawal(&ledger, &sync, 300_000_000);

        push(&ledger, "0xe1", 5, ChainEvent::RequestExecuted {
            request_id: 2,
            amount: Some(Amount::new(100_000_000)),
        });
        sync.drain().unwrap();
        let user = ledger.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.pending_withdrawals, Amount::new(200_000_000));

        // The later execution names the same on-chain id
        push(&ledger, "0xe2", 6, ChainEvent::RequestExecuted {
            request_id: 2,
            amount: Some(Amount::new(200_000_000)),
        });
        assert_eq!(sync.drain().unwrap().succeeded, 1);

        let original = ledger.lifecycle.get_request_by_on_chain_id(2).unwrap().unwrap();
        let successor = ledger.get_request(original.successor_id.unwrap()).unwrap().unwrap();
        assert_eq!(successor.status, crate::db::RequestStatus::Processed);
        assert_eq!(successor.processed_amount, Amount::new(200_000_000));

        let user = ledger.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.pending_withdrawals, Amount::ZERO);
        assert_eq!(user.total_withdrawn, Amount::new(300_000_000));
    }

    #[test]
    fn test_redelivered_execution_releases_once() {
        let ledger = ledger();
        let sync = ledger.sync();
        fund_and_request_withdrawal(&ledger, &sync, 300_000_000);

        let executed = ChainEvent::RequestExecuted {
            request_id: 2,
            amount: Some(Amount::new(100_000_000)),
        };
        sync.apply("0xe1:0", &executed).unwrap();
        sync.apply("0xe1:0", &executed).unwrap();

        let user = ledger.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.total_withdrawn, Amount::new(100_000_000));
        assert_eq!(user.pending_withdrawals, Amount::new(200_000_000));
    }

    #[test]
    fn test_validation_failure_event_is_recorded() {
        let ledger = ledger();
        let sync = ledger.sync();
        fund_and_request_withdrawal(&ledger, &sync, 300_000_000);
        let before = ledger.get_user("0xalice").unwrap().unwrap();

        let failed = ChainEvent::RequestValidationFailed {
            wallet: "0xalice".into(),
            amount: Amount::new(900_000_000),
            request_type: Some(RequestType::Withdrawal),
            reason: Some("insufficient balance".into()),
        };
        push(&ledger, "0xf", 7, failed.clone());
        let report = sync.drain().unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.quarantined, 0);

        sync.apply("0xf:0", &failed).unwrap();
        assert_eq!(ledger.get_user("0xalice").unwrap().unwrap(), before);
        assert_eq!(ledger.lifecycle.validation_failures("0xalice").unwrap().len(), 1);
    }

    #[test]
    fn test_lost_lease_does_not_abort_the_pass() {
        let config = Config::default();
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let ledger = Ledger::in_memory(&config, clock.clone()).unwrap();
        let sync = ledger.sync();

        push(&ledger, "0xa", 1, ChainEvent::RequestExecuted { request_id: 77, amount: None });
        push(&ledger, "0xb", 2, ChainEvent::UserRegistered { wallet: "0xbob".into() });
        let claimed = ledger.queue.claim(sync.consumer_id(), 10).unwrap();
        assert_eq!(claimed.len(), 2);

        // Our lease on the first event expires and another consumer takes it
        clock.advance_secs(config.visibility_timeout_secs as i64 + 1);
        let other = ledger.sync();
        assert_eq!(ledger.queue.claim(other.consumer_id(), 1).unwrap().len(), 1);

        let report = sync.process_claimed(claimed);
        assert_eq!(report.claimed, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.succeeded, 1);
        assert!(ledger.get_user("0xbob").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_consumer_stops_on_shutdown() {
        let ledger = ledger();
        let sync = Arc::new(ledger.sync());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        push(&ledger, "0x1", 1, ChainEvent::UserRegistered { wallet: "0xcarol".into() });
        let handle = tokio::spawn(sync.run_consumer(Duration::from_millis(10), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("consumer did not stop")
            .unwrap();

        assert!(ledger.get_user("0xcarol").unwrap().is_some());
    }
}
