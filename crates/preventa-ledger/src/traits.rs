//! Ledger traits: the abstract interface for versioned record storage.
//!
//! These traits keep the sync engine storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use preventa_core::{
    DedupeKey, DeviceId, EntityKind, LocalId, RecordPayload, ServerId, SyncableRecord, TenantId,
    Version, Watermark,
};
use serde::{Deserialize, Serialize};

use crate::cursor::ChangeCursor;
use crate::error::Result;

/// One conditional write against the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    /// Insert a new record at version 1.
    ///
    /// When `dedupe` is set and already bound, nothing is written and the
    /// bound record is returned as [`ApplyOutcome::Replayed`].
    Create {
        payload: RecordPayload,
        dedupe: Option<DedupeKey>,
    },
    /// Replace the payload of `server_id` if it is still at `expected`.
    Update {
        server_id: ServerId,
        expected: Version,
        payload: RecordPayload,
    },
    /// Soft-delete `server_id` if it is still at `expected`.
    Delete {
        server_id: ServerId,
        expected: Version,
    },
}

impl RecordWrite {
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            RecordWrite::Create { .. } => None,
            RecordWrite::Update { server_id, .. } | RecordWrite::Delete { server_id, .. } => {
                Some(*server_id)
            }
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The write succeeded; carries the new stored version.
    Applied(SyncableRecord),
    /// The create's dedupe key was already bound; carries the current record.
    Replayed(SyncableRecord),
    /// Delete of an already-deleted record at its current version. Nothing
    /// was written.
    Unchanged(SyncableRecord),
    /// The stored version differs from the expected one; carries the stored
    /// copy, which is left untouched.
    VersionConflict(SyncableRecord),
    /// Update of a soft-deleted record at its current version. Nothing was
    /// written.
    Deleted(SyncableRecord),
    /// No record of this kind with this id exists in the tenant.
    NotFound,
}

/// A bound dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub local_id: LocalId,
    pub server_id: ServerId,
    pub entity_kind: EntityKind,
}

/// The Ledger trait: async interface for versioned record storage.
///
/// All methods are async to support both blocking (SQLite) and async
/// backends. For SQLite, `spawn_blocking` is used internally.
///
/// # Design Notes
///
/// - **Compare-and-swap**: `apply_mutation` is one atomic conditional write.
///   There is no read-then-write window between the version check and the
///   write.
/// - **Logical clock**: each tenant has a change counter. Every write stamps
///   the record with the next counter value, so `change_seq` order is write
///   order and per-record versions ascend along it.
/// - **Tenant scoping**: a record id that exists in another tenant is
///   indistinguishable from one that does not exist.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Apply one conditional write to a record of `kind`.
    async fn apply_mutation(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        write: RecordWrite,
    ) -> Result<ApplyOutcome>;

    /// Get the current version of a record.
    async fn get_record(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        server_id: ServerId,
    ) -> Result<Option<SyncableRecord>>;

    /// Get up to `limit` records with `after < change_seq <= upto`, ordered
    /// by `change_seq` ascending.
    ///
    /// Soft-deleted records are skipped unless `include_deleted` is set.
    async fn records_since_page(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        after: Watermark,
        upto: Watermark,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<SyncableRecord>>;

    /// Current value of the tenant's change counter.
    async fn head(&self, tenant: &TenantId) -> Result<Watermark>;
}

/// The IdMap trait: durable `(tenant, device, local id) -> server id` lookup.
///
/// Bindings are written by [`Ledger::apply_mutation`] in the same atomic step
/// as the create they belong to, so a binding never exists without its record.
#[async_trait]
pub trait IdMap: Send + Sync {
    /// Look up a dedupe key.
    async fn lookup(&self, key: &DedupeKey) -> Result<Option<IdMapping>>;

    /// All bindings created by one device, ordered by server id.
    async fn device_mappings(&self, tenant: &TenantId, device: &DeviceId) -> Result<Vec<IdMapping>>;
}

/// Extension trait for common ledger patterns.
pub trait LedgerExt: Ledger {
    /// Open a cursor over the records of `kind` changed after `since`, up to
    /// and including `upto`.
    ///
    /// `since = None` is a full sync: it starts from the beginning and skips
    /// soft-deleted records. A delta includes deletions so every device
    /// observes them.
    fn records_since(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        since: Option<Watermark>,
        upto: Watermark,
        page_size: usize,
    ) -> ChangeCursor<'_, Self> {
        ChangeCursor::new(self, tenant.clone(), kind, since, upto, page_size)
    }
}

impl<L: Ledger + ?Sized> LedgerExt for L {}
