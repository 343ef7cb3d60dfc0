//! Error types for the Preventa core.

use thiserror::Error;

use crate::types::EntityKind;

/// Reasons a client-submitted payload is rejected before it reaches the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {field} exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("field {field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },

    #[error("duplicate {collection} key {key}")]
    DuplicateChild { collection: &'static str, key: u32 },

    #[error("too many {collection}: {count} exceeds {max}")]
    TooManyChildren {
        collection: &'static str,
        count: usize,
        max: usize,
    },

    #[error("extension map has {count} keys, maximum is {max}")]
    TooManyExtensions { count: usize, max: usize },

    #[error("extension key must not be empty")]
    EmptyExtensionKey,

    #[error("malformed {kind} fields: {reason}")]
    MalformedFields { kind: EntityKind, reason: String },

    #[error("{0} records are read-only from devices")]
    ReadOnlyKind(EntityKind),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}
