//! # Preventa Ledger
//!
//! The change ledger: durable, tenant-scoped, version-stamped storage of
//! synchronizable records, and the dedupe-key map that turns retried creates
//! into no-ops.
//!
//! ## Overview
//!
//! The ledger is the only place where writes happen. Every write is a single
//! compare-and-swap: it succeeds only if the stored version still equals the
//! version the caller read, and it stamps the record with the next value of
//! the tenant's logical change counter. Readers ask for "everything stamped
//! after watermark W" through a [`ChangeCursor`].
//!
//! ## Key Types
//!
//! - [`Ledger`] - Async trait for CAS writes and ordered change reads
//! - [`IdMap`] - Async trait for dedupe-key lookups
//! - [`SqliteLedger`] - SQLite-based persistent ledger
//! - [`MemoryLedger`] - In-memory ledger for tests
//! - [`ApplyOutcome`] - Result of one write
//!
//! ## Usage
//!
//! ```rust,no_run
//! use preventa_core::{EntityKind, TenantId};
//! use preventa_ledger::{Ledger, LedgerExt, SqliteLedger};
//!
//! async fn example() {
//!     let ledger = SqliteLedger::open("ledger.db").unwrap();
//!     let tenant = TenantId::new("acme");
//!
//!     let head = ledger.head(&tenant).await.unwrap();
//!     let mut cursor = ledger.records_since(&tenant, EntityKind::Cliente, None, head, 100);
//!     while let Some(page) = cursor.next_page().await.unwrap() {
//!         println!("{} records, resume at {}", page.len(), cursor.position());
//!     }
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **No silent overwrite**: a stale expected version returns the stored copy
//! - **Idempotent creates**: a bound dedupe key returns the original record
//! - **Soft delete**: deletion bumps the version; rows are never removed here
//! - **Tenant isolation**: every read and write is keyed by tenant

pub mod config;
pub mod cursor;
pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

mod cas;

pub use config::LedgerConfig;
pub use cursor::ChangeCursor;
pub use error::{LedgerError, Result};
pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;
pub use traits::{ApplyOutcome, IdMap, IdMapping, Ledger, LedgerExt, RecordWrite};
