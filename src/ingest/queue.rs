//! Event ingestion queue
//!
//! Durable at-least-once intake. Delivery state per event:
//!
//! ```text
//! pending ──claim──> processing ──complete──> succeeded
//!    ^                   │
//!    │                   ├──fail(retryable, attempts < max)──> failed ──backoff──> (claimable)
//!    │                   └──fail(otherwise)─────────────────> quarantined
//!    └────────────────────────────requeue (operator)───────────────┘
//! ```
//!
//! A `processing` event whose visibility timeout lapses becomes claimable
//! again, so a crashed consumer never strands an event.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth::{Operation, Principal};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{event_queue, LedgerDb, NewQueuedEvent, QueueStats, QueueStatus, QueuedEventRow};
use crate::error::{LedgerError, Result};
use crate::services::events::{EventBus, LedgerNotification};

use super::event_types::{ChainEvent, EnqueueOutcome, EventPosition, ExternalEventId};

/// Retry and lease settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub visibility_timeout: Duration,
}

impl From<&Config> for QueueSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_event_attempts,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            max_retry_delay: Duration::from_secs(config.max_retry_delay_secs),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
        }
    }
}

impl QueueSettings {
    /// `retry_delay * 2^(attempts - 1)`, capped at `max_retry_delay`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.retry_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }
}

/// A claimed event with its decoded payload
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub row: QueuedEventRow,
    pub event: std::result::Result<ChainEvent, String>,
}

impl ClaimedEvent {
    pub fn external_id(&self) -> &str {
        &self.row.external_id
    }
}

pub struct EventQueue {
    db: Arc<LedgerDb>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    settings: QueueSettings,
}

impl EventQueue {
    pub fn new(db: Arc<LedgerDb>, clock: Arc<dyn Clock>, events: Arc<EventBus>, settings: QueueSettings) -> Self {
        Self {
            db,
            clock,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Persist an event unless its external id is already known
    pub fn enqueue(&self, id: &ExternalEventId, event: &ChainEvent, position: EventPosition) -> Result<EnqueueOutcome> {
        let external_id = id.to_string();
        let payload = event.to_payload()?;
        let now = self.clock.now();

        let added = self.db.with_tx(|tx| {
            event_queue::insert_if_absent(
                tx,
                &NewQueuedEvent {
                    external_id: &external_id,
                    tx_hash: &id.tx_hash,
                    log_index: id.log_index,
                    block_number: position.block_number,
                    kind: event.kind(),
                    payload: &payload,
                    ingested_at: now,
                },
            )
        })?;

        if added {
            debug!(external_id = %external_id, kind = event.kind(), block = position.block_number, "Event enqueued");
            Ok(EnqueueOutcome::Enqueued)
        } else {
            debug!(external_id = %external_id, "Duplicate event ignored");
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    /// Move up to `limit` eligible events to `processing` for `consumer_id`, in sequence order
    pub fn claim(&self, consumer_id: &str, limit: u32) -> Result<Vec<ClaimedEvent>> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let lease_until_ms = now_ms.saturating_add(self.settings.visibility_timeout.as_millis() as i64);

        let rows = self.db.with_tx(|tx| {
            let candidates = event_queue::claim_candidates(tx, now_ms, self.settings.max_attempts, limit)?;
            let mut claimed = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                if candidate.status == QueueStatus::Processing {
                    warn!(external_id = %candidate.external_id, "Reclaiming event with expired lease");
                }
                // Lost the race to another consumer; skip
                if !event_queue::try_claim(tx, &candidate, consumer_id, now, lease_until_ms)? {
                    continue;
                }
                if let Some(row) = event_queue::get_event(tx, &candidate.external_id)? {
                    claimed.push(row);
                }
            }
            Ok(claimed)
        })?;

        if !rows.is_empty() {
            debug!(consumer = %consumer_id, count = rows.len(), "Claimed events");
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let event = ChainEvent::from_payload(&row.payload).map_err(|e| e.to_string());
                ClaimedEvent { row, event }
            })
            .collect())
    }

    /// Mark a claimed event succeeded. False if the consumer had lost its lease.
    pub fn complete(&self, external_id: &str, consumer_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let done = self.db.with_tx(|tx| event_queue::mark_succeeded(tx, external_id, consumer_id, now))?;
        if !done {
            warn!(external_id = %external_id, consumer = %consumer_id, "Completed event no longer held by consumer");
        }
        Ok(done)
    }

    /// Record a failed attempt and return where the event ended up
    pub fn fail(&self, external_id: &str, consumer_id: &str, error: &str, retryable: bool) -> Result<QueueStatus> {
        let now_ms = self.clock.now().timestamp_millis();

        let status = self.db.with_tx(|tx| {
            let row = event_queue::get_event(tx, external_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("event {}", external_id)))?;

            let attempts = row.attempts.saturating_add(1);
            let status = if !retryable || attempts >= self.settings.max_attempts {
                QueueStatus::Quarantined
            } else {
                QueueStatus::Failed
            };
            let retry_at_ms = now_ms.saturating_add(self.settings.backoff(attempts).as_millis() as i64);

            if !event_queue::mark_failed(tx, external_id, consumer_id, status, attempts, error, retry_at_ms)? {
                return Err(LedgerError::Busy(format!("event {} not held by {}", external_id, consumer_id)));
            }
            Ok(status)
        })?;

        if status == QueueStatus::Quarantined {
            self.events.emit(LedgerNotification::EventQuarantined {
                external_id: external_id.to_string(),
                error: error.to_string(),
            });
        } else {
            debug!(external_id = %external_id, error = %error, "Event will be retried");
        }
        Ok(status)
    }

    /// Operator action: return a quarantined event to `pending` with fresh attempts
    pub fn requeue_quarantined(&self, principal: &Principal, external_id: &str) -> Result<()> {
        principal.require(Operation::RequeueEvent)?;

        if !self.db.with_tx(|tx| event_queue::requeue_quarantined(tx, external_id))? {
            return Err(LedgerError::NotFound(format!("quarantined event {}", external_id)));
        }

        info!(external_id = %external_id, principal = %principal.id, "Quarantined event requeued");
        self.events.emit(LedgerNotification::EventRequeued {
            external_id: external_id.to_string(),
        });
        Ok(())
    }

    pub fn get(&self, external_id: &str) -> Result<Option<QueuedEventRow>> {
        self.db.with_conn(|conn| event_queue::get_event(conn, external_id))
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db.with_conn(event_queue::stats)
    }

    pub fn list_quarantined(&self, limit: u32) -> Result<Vec<QueuedEventRow>> {
        self.db.with_conn(|conn| event_queue::list_by_status(conn, QueueStatus::Quarantined, limit))
    }
}
