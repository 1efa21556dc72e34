//! On-chain event ingestion and reconciliation
//!
//! ```text
//! chain feed (JSON lines)
//!     ↓  decode + dedupe by (tx_hash, log_index)
//! EventQueue (event_queue table)
//!     ↓  claim with lease, ordered by (block_number, log_index)
//! ReconciliationSync
//!     ↓  one ledger call per event
//! Lifecycle / Batch / Epoch services
//! ```
//!
//! Delivery is at-least-once. Every mapped ledger call is idempotent, so a
//! redelivered event is harmless.

pub mod event_types;
pub mod queue;
pub mod sync;

pub use event_types::{ChainEvent, EnqueueOutcome, EventPosition, ExternalEventId, RawEvent};
pub use queue::{ClaimedEvent, EventQueue, QueueSettings};
pub use sync::{is_sync_retryable, DrainReport, ReconciliationSync};
