//! Typed on-chain events
//!
//! Raw events are decoded into [`ChainEvent`] once, at ingestion. The queue
//! stores the typed event as JSON (`{"kind": ..., "data": {...}}`) so a
//! consumer never sees an undecoded payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::amount::Amount;
use crate::db::{EpochId, RequestType};
use crate::error::{LedgerError, Result};

/// Source transaction hash plus log index; unique per on-chain state transition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalEventId {
    pub tx_hash: String,
    pub log_index: u32,
}

impl ExternalEventId {
    pub fn new(tx_hash: impl Into<String>, log_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            log_index,
        }
    }
}

impl fmt::Display for ExternalEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// Position in the authoritative event order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u32,
}

/// Contract events the ledger reconciles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum ChainEvent {
    UserRegistered {
        wallet: String,
    },
    DepositRequested {
        request_id: u64,
        wallet: String,
        amount: Amount,
    },
    WithdrawalRequested {
        request_id: u64,
        wallet: String,
        amount: Amount,
    },
    BorrowRequested {
        request_id: u64,
        wallet: String,
        amount: Amount,
        collateral: Amount,
    },
    /// A single request executed on-chain; `amount` is what was released
    RequestExecuted {
        request_id: u64,
        #[serde(default)]
        amount: Option<Amount>,
    },
    BatchProcessed {
        request_type: RequestType,
        request_ids: Vec<u64>,
    },
    EpochCreated {
        epoch_id: EpochId,
    },
    EpochClosed {
        epoch_id: EpochId,
    },
    /// The contract rejected a request; nothing was created on-chain
    RequestValidationFailed {
        #[serde(alias = "wallet_address")]
        wallet: String,
        amount: Amount,
        #[serde(default)]
        request_type: Option<RequestType>,
        #[serde(default)]
        reason: Option<String>,
    },
}

pub const EVENT_KINDS: &[&str] = &[
    "UserRegistered",
    "DepositRequested",
    "WithdrawalRequested",
    "BorrowRequested",
    "RequestExecuted",
    "BatchProcessed",
    "EpochCreated",
    "EpochClosed",
    "RequestValidationFailed",
];

impl ChainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::UserRegistered { .. } => "UserRegistered",
            ChainEvent::DepositRequested { .. } => "DepositRequested",
            ChainEvent::WithdrawalRequested { .. } => "WithdrawalRequested",
            ChainEvent::BorrowRequested { .. } => "BorrowRequested",
            ChainEvent::RequestExecuted { .. } => "RequestExecuted",
            ChainEvent::BatchProcessed { .. } => "BatchProcessed",
            ChainEvent::EpochCreated { .. } => "EpochCreated",
            ChainEvent::EpochClosed { .. } => "EpochClosed",
            ChainEvent::RequestValidationFailed { .. } => "RequestValidationFailed",
        }
    }

    /// Decode a raw event by kind name and its JSON fields
    pub fn decode(kind: &str, data: &Value) -> Result<Self> {
        if !EVENT_KINDS.contains(&kind) {
            return Err(LedgerError::UnknownEventKind(kind.to_string()));
        }
        let tagged = serde_json::json!({ "kind": kind, "data": data });
        serde_json::from_value(tagged).map_err(|e| LedgerError::Decode(format!("{}: {}", kind, e)))
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| LedgerError::Decode(e.to_string()))
    }
}

/// Whether an enqueue added a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
}

/// One line of a JSON-lines event feed
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub tx_hash: String,
    pub log_index: u32,
    pub block_number: u64,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl RawEvent {
    pub fn external_id(&self) -> ExternalEventId {
        ExternalEventId::new(self.tx_hash.clone(), self.log_index)
    }

    pub fn position(&self) -> EventPosition {
        EventPosition {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    pub fn decode(&self) -> Result<ChainEvent> {
        ChainEvent::decode(&self.kind, &self.data)
    }
}
