//! Error types for vault-ledger

use thiserror::Error;

use crate::amount::Amount;

/// Coarse classification used by callers to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any state change; retry with corrected input.
    Validation,
    /// Definitive outcome for that identifier; retrying will not help.
    StateConflict,
    /// Transient lock contention; safe to retry with backoff.
    Contention,
    /// Problems with externally sourced events.
    Ingestion,
    /// Storage or arithmetic failure.
    Internal,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    // Validation
    #[error("Amount must be greater than zero")]
    AmountZero,

    #[error("Amount {amount} is below the minimum of {minimum}")]
    AmountTooLow { amount: Amount, minimum: Amount },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Amount, available: Amount },

    #[error("Insufficient collateral: required {required}, provided {provided}")]
    InsufficientCollateral { required: Amount, provided: Amount },

    #[error("Batch contains no requests")]
    EmptyBatch,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // State conflict
    #[error("User not registered: {0}")]
    NotRegistered(String),

    #[error("User already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request {id} is a {actual} request, expected {expected}")]
    WrongType {
        id: u64,
        expected: String,
        actual: String,
    },

    #[error("Request already processed: {0}")]
    AlreadyProcessed(u64),

    #[error("No active epoch")]
    NoActiveEpoch,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Contention
    #[error("Resource busy: {0}")]
    Busy(String),

    // Ingestion
    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Event decode error: {0}")]
    Decode(String),

    // Internal
    #[error("Arithmetic overflow in {0}")]
    ArithmeticOverflow(&'static str),

    #[error("Database error: {0}")]
    Database(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AmountZero
            | LedgerError::AmountTooLow { .. }
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::InsufficientCollateral { .. }
            | LedgerError::EmptyBatch
            | LedgerError::InvalidInput(_) => ErrorKind::Validation,

            LedgerError::NotRegistered(_)
            | LedgerError::AlreadyRegistered(_)
            | LedgerError::NotFound(_)
            | LedgerError::WrongType { .. }
            | LedgerError::AlreadyProcessed(_)
            | LedgerError::NoActiveEpoch
            | LedgerError::Unauthorized(_) => ErrorKind::StateConflict,

            LedgerError::Busy(_) => ErrorKind::Contention,

            LedgerError::UnknownEventKind(_)
            | LedgerError::Decode(_) => ErrorKind::Ingestion,

            LedgerError::ArithmeticOverflow(_)
            | LedgerError::Database(_)
            | LedgerError::Json(_)
            | LedgerError::Io(_)
            | LedgerError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same call may succeed if simply repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Busy(_) | LedgerError::Database(_))
    }

    pub(crate) fn db(context: &str, err: impl std::fmt::Display) -> Self {
        LedgerError::Database(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
