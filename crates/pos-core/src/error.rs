use thiserror::Error;

use crate::ledger::LedgerError;

/// Top-level error type for POS.
#[derive(Debug, Error)]
pub enum PosError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Storage error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Rejected ledger operation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A user, task, or other record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied input failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation conflicts with the current state of a record.
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
