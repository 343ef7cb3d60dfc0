//! # Preventa Core
//!
//! Pure primitives for the Preventa sync engine: identifiers, typed record
//! payloads, and validation.
//!
//! This crate contains no I/O, no storage, no networking. Everything here is
//! plain data plus the rules that decide whether a payload is well formed.
//!
//! ## Key Types
//!
//! - [`SyncableRecord`] - One version of a synchronizable record
//! - [`RecordPayload`] - Strongly-typed payload, one variant per [`EntityKind`]
//! - [`TenantId`], [`DeviceId`], [`LocalId`], [`ServerId`] - Identity newtypes
//! - [`Version`], [`Watermark`] - Per-record and per-tenant logical counters
//! - [`Patch`] - Three-state (absent / null / value) field update
//!
//! ## Identity
//!
//! A record is created on a device under a client-local [`LocalId`]. The
//! ledger assigns a durable [`ServerId`] on first write; the pair is bound
//! under a [`DedupeKey`] so a retried create resolves to the same record.

pub mod error;
pub mod patch;
pub mod payload;
pub mod record;
pub mod types;
pub mod validation;

pub use error::ValidationError;
pub use patch::Patch;
pub use payload::{
    ChildRef, Cliente, EstadoPedido, Extensions, LineaPedido, ParadaRuta, Pedido, Producto,
    RecordPayload, ResultadoVisita, Ruta, Visita,
};
pub use record::{decode_payload, encode_payload, now_millis, ContentHash, SyncableRecord};
pub use types::{
    DedupeKey, DeviceId, EntityKind, LocalId, RecordRef, ServerId, TenantId, Version, Watermark,
};
pub use validation::{limits, validate_payload};
