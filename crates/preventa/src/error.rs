//! Error types for the engine facade.

use preventa_core::{EntityKind, ServerId, ValidationError};
use preventa_ledger::LedgerError;
use preventa_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Ledger error.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The JSON envelope could not be parsed or produced.
    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// An admin write references a record that does not exist in the tenant.
    #[error("{kind} #{server_id} does not exist")]
    MissingReference { kind: EntityKind, server_id: ServerId },

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Whether the caller should retry the same call later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Ledger(e) => e.is_retryable(),
            EngineError::Sync(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
