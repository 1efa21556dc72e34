//! Batch processor
//!
//! Applies lifecycle transitions to an ordered list of requests. Every item is
//! processed on its own (its own user lock, its own transaction) and its
//! outcome collected; no item error crosses the batch boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::amount::Amount;
use crate::auth::{Operation, Principal};
use crate::clock::Clock;
use crate::db::{batches, epochs, BatchItemStatus, LedgerDb, NewBatchItem, ProcessingEventRow, RequestId, RequestType};
use crate::error::{LedgerError, Result};

use super::events::{EventBus, LedgerNotification};
use super::lifecycle::{LifecycleService, Release};

/// One request to process, with an optional release cap for withdrawals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub request_id: RequestId,
    #[serde(default)]
    pub cap: Option<Amount>,
}

impl From<RequestId> for BatchItem {
    fn from(request_id: RequestId) -> Self {
        Self { request_id, cap: None }
    }
}

pub struct BatchProcessor {
    db: Arc<LedgerDb>,
    lifecycle: Arc<LifecycleService>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl BatchProcessor {
    pub fn new(
        db: Arc<LedgerDb>,
        lifecycle: Arc<LifecycleService>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            db,
            lifecycle,
            clock,
            events,
        }
    }

    /// Process `items` in order and persist the resulting processing event
    pub fn process(
        &self,
        principal: &Principal,
        request_type: RequestType,
        items: &[BatchItem],
    ) -> Result<ProcessingEventRow> {
        self.run(principal, request_type, items, None)
    }

    /// Apply a batch the chain already executed.
    ///
    /// Each item settles the open tail of its request chain and is keyed by
    /// `source_event_id` plus its position, so redelivery of the same chain
    /// event never settles an item twice.
    pub fn process_from_chain(
        &self,
        principal: &Principal,
        request_type: RequestType,
        items: &[BatchItem],
        source_event_id: &str,
    ) -> Result<ProcessingEventRow> {
        self.run(principal, request_type, items, Some(source_event_id))
    }

    fn run(
        &self,
        principal: &Principal,
        request_type: RequestType,
        items: &[BatchItem],
        source_event_id: Option<&str>,
    ) -> Result<ProcessingEventRow> {
        principal.require(Operation::BatchProcess)?;
        if items.is_empty() {
            return Err(LedgerError::EmptyBatch);
        }

        let mut outcomes = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let result = match source_event_id {
                Some(source) => self.lifecycle.settle_chain(
                    principal,
                    item.request_id,
                    Some(request_type),
                    Release::Eligible { cap: item.cap },
                    Some(&format!("{}/{}", source, position)),
                ),
                None if request_type == RequestType::Withdrawal => {
                    self.lifecycle.process_withdrawal(principal, item.request_id, item.cap)
                }
                None => self.lifecycle.process(principal, item.request_id, request_type, None),
            };

            outcomes.push(match result {
                Ok(outcome) => NewBatchItem {
                    request_id: item.request_id,
                    status: BatchItemStatus::Processed,
                    detail: Some(format!(
                        "processed {} remaining {}",
                        outcome.processed_amount, outcome.remaining
                    )),
                },
                Err(e) => {
                    warn!(request_id = item.request_id, request_type = %request_type, error = %e, "Batch item failed");
                    NewBatchItem {
                        request_id: item.request_id,
                        status: BatchItemStatus::Failed,
                        detail: Some(e.to_string()),
                    }
                }
            });
        }

        let now = self.clock.now();
        let event = self.db.with_tx(|tx| {
            let epoch_id = epochs::get_active_epoch(tx)?.map(|e| e.id);
            batches::insert_processing_event(tx, epoch_id, request_type, &principal.id, &outcomes, now)
        })?;

        info!(
            processing_event_id = event.id,
            request_type = %request_type,
            processed = event.processed_count,
            failed = event.failed_count,
            "Batch processed"
        );
        self.events.emit(LedgerNotification::BatchProcessed {
            processing_event_id: event.id,
            request_type,
            processed: event.processed_count,
            failed: event.failed_count,
        });

        Ok(event)
    }

    pub fn get_processing_event(&self, id: u64) -> Result<Option<ProcessingEventRow>> {
        self.db.with_conn(|conn| batches::get_processing_event(conn, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::locks::LockTable;
    use crate::services::lifecycle::VaultParams;
    use std::time::Duration;

    fn processor() -> (BatchProcessor, Arc<LifecycleService>) {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_unix(1_700_000_000));
        let events = Arc::new(EventBus::new());
        let lifecycle = Arc::new(LifecycleService::new(
            db.clone(),
            Arc::new(LockTable::new(Duration::from_millis(100))),
            clock.clone(),
            events.clone(),
            VaultParams::from(&Config::default()),
        ));
        (BatchProcessor::new(db, lifecycle.clone(), clock, events), lifecycle)
    }

    #[test]
    fn test_empty_batch() {
        let (batch, _) = processor();
        let result = batch.process(&Principal::admin("op"), RequestType::Deposit, &[]);
        assert!(matches!(result, Err(LedgerError::EmptyBatch)));
    }

    #[test]
    fn test_missing_item_is_isolated() {
        let (batch, lifecycle) = processor();
        let admin = Principal::admin("op");
        lifecycle.register_user("0xalice").unwrap();
        let a = lifecycle.create_deposit("0xalice", Amount::new(100_000_000), None).unwrap();
        let b = lifecycle.create_deposit("0xalice", Amount::new(200_000_000), None).unwrap();

        let items: Vec<BatchItem> = vec![a.id.into(), BatchItem::from(4_242u64), b.id.into()];
        let event = batch.process(&admin, RequestType::Deposit, &items).unwrap();

        assert_eq!(event.processed_count, 2);
        assert_eq!(event.failed_count, 1);
        assert_eq!(event.items[1].status, BatchItemStatus::Failed);

        let user = lifecycle.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(300_000_000));

        let stored = batch.get_processing_event(event.id).unwrap().unwrap();
        assert_eq!(stored, event);
    }

    #[test]
    fn test_chain_batch_settles_successor_once() {
        let (batch, lifecycle) = processor();
        let admin = Principal::admin("op");
        lifecycle.register_user("0xalice").unwrap();
        let d = lifecycle.create_deposit("0xalice", Amount::new(500_000_000), None).unwrap();
        lifecycle.process_deposit(&admin, d.id).unwrap();

        // First pass releases nothing: no time has passed in the epoch
        let w = lifecycle.create_withdrawal("0xalice", Amount::new(200_000_000), None).unwrap();
        let first = lifecycle.process_withdrawal(&admin, w.id, None).unwrap();
        let successor = first.successor_id.unwrap();

        let items = [BatchItem::from(w.id)];
        let event = batch
            .process_from_chain(&admin, RequestType::Withdrawal, &items, "0xfeed:0")
            .unwrap();
        assert_eq!(event.processed_count, 1);
        assert_eq!(lifecycle.executions_for_request(successor).unwrap().len(), 1);

        let replay = batch
            .process_from_chain(&admin, RequestType::Withdrawal, &items, "0xfeed:0")
            .unwrap();
        assert_eq!(replay.failed_count, 1);
        assert_eq!(lifecycle.executions_for_request(successor).unwrap().len(), 1);
    }

    #[test]
    fn test_replayed_batch_does_not_double_credit() {
        let (batch, lifecycle) = processor();
        let admin = Principal::admin("op");
        lifecycle.register_user("0xalice").unwrap();
        let a = lifecycle.create_deposit("0xalice", Amount::new(100_000_000), None).unwrap();

        batch.process(&admin, RequestType::Deposit, &[a.id.into()]).unwrap();
        let replay = batch.process(&admin, RequestType::Deposit, &[a.id.into()]).unwrap();
        assert_eq!(replay.processed_count, 0);
        assert_eq!(replay.failed_count, 1);

        let user = lifecycle.get_user("0xalice").unwrap().unwrap();
        assert_eq!(user.active_balance, Amount::new(100_000_000));
    }
}
