//! # Preventa
//!
//! The offline-first sync engine of a multi-tenant field-sales CRM.
//!
//! ## Overview
//!
//! Sales reps work on devices that are often offline. Each device keeps a
//! local copy of its tenant's customers, visits, orders, routes and catalog,
//! edits it freely, and periodically syncs. One sync session:
//!
//! - **Pushes** the device's pending mutations into the change ledger, each
//!   one a compare-and-swap on the version the device last saw
//! - **Reconciles ids**: records created offline under a local id get a
//!   durable server id, returned as an id mapping
//! - **Reports** conflicts (resolved as `server_wins`) and per-record errors
//!   without failing the rest of the batch
//! - **Pulls** every record changed since the device's last watermark
//!
//! ## Key Concepts
//!
//! - **Version**: per-record counter, +1 per accepted write. Never reused.
//! - **Watermark**: per-tenant logical change counter. A device stores the
//!   one returned by each sync and sends it back next time.
//! - **Dedupe key**: `(tenant, device, local id)`. A retried create with the
//!   same key returns the same record instead of creating a second one.
//! - **Soft delete**: deletion is a versioned write that devices pull like
//!   any other change.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use preventa::{EngineConfig, SyncEngine};
//! use preventa::sync::{ClientChange, SessionContext, SyncRequest};
//! use preventa::core::EntityKind;
//!
//! async fn example() {
//!     let engine = SyncEngine::open("preventa.db", EngineConfig::default()).unwrap();
//!
//!     // Tenant and device come from the authenticated session, never the body
//!     let ctx = SessionContext::new("acme", "tablet-7");
//!
//!     let request = SyncRequest::full().with_change(
//!         EntityKind::Cliente,
//!         ClientChange::create("L1", serde_json::json!({ "nombre": "Acme" })),
//!     );
//!     let response = engine.sync(&ctx, request).await.unwrap();
//!
//!     for mapping in &response.id_mappings {
//!         println!("{} -> {}", mapping.local_id, mapping.server_id);
//!     }
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `preventa::core` - Ids, typed payloads, validation
//! - `preventa::ledger` - Ledger traits, SQLite and in-memory backends
//! - `preventa::sync` - Wire messages, resolver, orchestrator

pub mod engine;
pub mod error;

// Re-export component crates
pub use preventa_core as core;
pub use preventa_ledger as ledger;
pub use preventa_sync as sync;

// Re-export main types for convenience
pub use engine::{EngineConfig, SyncEngine};
pub use error::{EngineError, Result};

// Re-export commonly used types
pub use preventa_core::{
    EntityKind, LocalId, RecordPayload, ServerId, SyncableRecord, TenantId, Version, Watermark,
};
pub use preventa_ledger::{ApplyOutcome, MemoryLedger, RecordWrite, SqliteLedger};
pub use preventa_sync::{ClientChange, SessionContext, SyncRequest, SyncResponse};
