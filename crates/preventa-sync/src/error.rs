//! Error types for the sync module.
//!
//! Only session-level failures are errors here. Everything that concerns a
//! single mutation is reported as a value in the response.

use preventa_core::{DeviceId, TenantId, Watermark};
use preventa_ledger::LedgerError;
use thiserror::Error;

/// Errors that abort a whole sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another session from the same device over the same watermark window is
    /// still running.
    #[error("session already running for {tenant}/{device} since {}", window_label(.since))]
    SessionOverlap {
        tenant: TenantId,
        device: DeviceId,
        since: Option<Watermark>,
    },

    /// The request envelope itself is unusable.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The ledger failed in a way that is not local to one mutation.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The engine itself failed (a push lane panicked, a lock was poisoned).
    #[error("internal error: {0}")]
    Internal(String),
}

fn window_label(since: &Option<Watermark>) -> String {
    since.map_or_else(|| "full sync".to_string(), |w| w.to_string())
}

impl SyncError {
    /// Whether the client should simply retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SessionOverlap { .. } => true,
            SyncError::Ledger(e) => e.is_retryable(),
            SyncError::MalformedEnvelope(_) | SyncError::Internal(_) => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
