//! # Preventa Sync
//!
//! Sync sessions between offline-first devices and the change ledger.
//!
//! ## Overview
//!
//! A device accumulates mutations while offline and sends them in one
//! request. The engine applies them (push), then returns everything that
//! changed since the device's last watermark (pull), in a single session.
//!
//! ## Key Properties
//!
//! - **No lost updates**: every update and delete is a compare-and-swap on
//!   the version the device last saw
//! - **Exactly-once creates**: a retried create resolves to the same record
//! - **Partial success**: one bad change never blocks the rest of the batch
//! - **Resumable**: the returned watermark comes from the ledger's logical
//!   counter, so the next delta never misses a write
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use preventa_core::EntityKind;
//! use preventa_ledger::MemoryLedger;
//! use preventa_sync::{ClientChange, SessionContext, SyncConfig, SyncOrchestrator, SyncRequest};
//!
//! async fn example() {
//!     let orchestrator = SyncOrchestrator::new(Arc::new(MemoryLedger::new()), SyncConfig::default());
//!     let ctx = SessionContext::new("acme", "tablet-7");
//!
//!     let request = SyncRequest::full().with_change(
//!         EntityKind::Cliente,
//!         ClientChange::create("L1", serde_json::json!({ "nombre": "Abarrotes Lupita" })),
//!     );
//!     let response = orchestrator.sync(&ctx, request).await.unwrap();
//!     println!("next watermark: {}", response.server_timestamp);
//! }
//! ```
//!
//! ## Session Flow
//!
//! ```text
//! Device                               Engine                      Ledger
//!   |---- SyncRequest ------------------>|                           |
//!   |                                    |-- apply_mutation (xN) --->|
//!   |                                    |-- head ------------------>|
//!   |                                    |-- records_since --------->|
//!   |<--- SyncResponse ------------------|                           |
//! ```

pub mod config;
pub mod error;
pub mod idmap;
pub mod messages;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod session;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use idmap::IdReconciler;
pub use messages::{
    ClientChange, ConflictEntry, Operation, RecordError, RecordErrorKind, Resolution,
    SyncRequest, SyncResponse, SyncSummary,
};
pub use orchestrator::SyncOrchestrator;
pub use report::{MutationOutcome, PushReport, Rejection, Reporter};
pub use resolver::ConflictResolver;
pub use session::{SessionContext, SessionGuard, SessionId, SessionRegistry};
