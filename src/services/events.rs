//! Ledger notifications
//!
//! Every committed state transition is announced on an [`EventBus`] after its
//! transaction commits. Listeners are for audit logging and downstream
//! triggers; nothing in the ledger depends on them being delivered.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::amount::Amount;
use crate::db::{EpochId, KycStatus, RequestId, RequestType};

/// Notifications emitted by ledger services
#[derive(Debug, Clone)]
pub enum LedgerNotification {
    // User events
    UserRegistered {
        wallet: String,
    },
    KycStatusRecorded {
        wallet: String,
        status: KycStatus,
    },
    UserArchived {
        wallet: String,
    },

    // Request events
    RequestCreated {
        request_id: RequestId,
        request_type: RequestType,
        wallet: String,
        amount: Amount,
    },
    RequestProcessed {
        request_id: RequestId,
        request_type: RequestType,
        wallet: String,
        processed_amount: Amount,
        remaining: Amount,
        successor_id: Option<RequestId>,
        epoch_id: Option<EpochId>,
    },
    BatchProcessed {
        processing_event_id: u64,
        request_type: RequestType,
        processed: u32,
        failed: u32,
    },
    ValidationFailureRecorded {
        wallet: String,
        request_type: Option<RequestType>,
        amount: Amount,
    },

    // Reward events
    RewardsAccrued {
        wallet: String,
        amount: Amount,
    },
    RewardsClaimed {
        wallet: String,
        amount: Amount,
    },

    // Epoch events
    EpochOpened {
        epoch_id: EpochId,
    },
    EpochClosed {
        epoch_id: EpochId,
        next_epoch_id: EpochId,
    },

    // Ingestion events
    EventQuarantined {
        external_id: String,
        error: String,
    },
    EventRequeued {
        external_id: String,
    },
}

/// Trait for notification listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LedgerNotification);
}

/// Event bus for broadcasting ledger notifications
pub struct EventBus {
    sender: broadcast::Sender<LedgerNotification>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: LedgerNotification) {
        trace!(event = ?event, "Emitting ledger notification");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LedgerNotification) {
        match event {
            LedgerNotification::RequestProcessed {
                request_id,
                request_type,
                wallet,
                processed_amount,
                remaining,
                ..
            } => {
                info!(
                    request_id = request_id,
                    request_type = %request_type,
                    wallet = %wallet,
                    processed = %processed_amount,
                    remaining = %remaining,
                    "Request processed"
                );
            }
            LedgerNotification::BatchProcessed {
                processing_event_id,
                request_type,
                processed,
                failed,
            } => {
                info!(
                    processing_event_id = processing_event_id,
                    request_type = %request_type,
                    processed = processed,
                    failed = failed,
                    "Batch processed"
                );
            }
            LedgerNotification::EpochClosed { epoch_id, next_epoch_id } => {
                info!(epoch_id = epoch_id, next_epoch_id = next_epoch_id, "Epoch closed");
            }
            LedgerNotification::EventQuarantined { external_id, error } => {
                warn!(external_id = %external_id, error = %error, "Event quarantined");
            }
            _ => {
                debug!(event = ?event, "Ledger notification");
            }
        }
    }
}

/// Spawn a background task that logs all notifications
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
