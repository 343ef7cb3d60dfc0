//! # Preventa Testkit
//!
//! Testing utilities for the Preventa sync engine.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: An engine over a memory ledger, devices, and change builders
//! - **Generators**: Proptest strategies for payloads and edit scripts
//! - **Failure injection**: [`FlakyLedger`] for transient errors and outages
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use preventa_testkit::generators::ClienteParams;
//!
//! proptest! {
//!     #[test]
//!     fn fields_always_parse(params: ClienteParams) {
//!         let payload = params.payload();
//!         prop_assert!(preventa_core::validate_payload(&payload).is_ok());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Quickly set up test scenarios:
//!
//! ```rust,ignore
//! use preventa_testkit::fixtures::{cliente, local, visita, TestFixture};
//! use preventa_sync::SyncRequest;
//! use preventa_core::EntityKind;
//!
//! let fixture = TestFixture::new();
//! let request = SyncRequest::full()
//!     .with_change(EntityKind::Cliente, cliente("C1", "Acme"))
//!     .with_change(EntityKind::Visita, visita("V1", local("C1")));
//! let response = fixture.engine.sync(&fixture.device("tablet-1"), request).await?;
//! ```

pub mod fixtures;
pub mod flaky;
pub mod generators;

pub use fixtures::{fixture_config, TestFixture, FIRST_SERVER_ID};
pub use flaky::FlakyLedger;
pub use generators::{edit_script, ClienteParams, Edit};
