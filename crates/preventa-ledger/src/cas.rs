//! Compare-and-swap decision shared by every ledger backend.
//!
//! A backend loads the current row and the dedupe binding inside its own
//! atomic section, asks [`decide`] what to do, and carries out the resulting
//! [`Decision`] before leaving that section.

use preventa_core::{
    ContentHash, DedupeKey, EntityKind, LocalId, RecordPayload, ServerId, SyncableRecord,
    TenantId, Version, Watermark,
};

use crate::error::{LedgerError, Result};
use crate::traits::{ApplyOutcome, RecordWrite};

/// What a backend must do for one write.
pub(crate) enum Decision {
    /// Allocate a server id and insert at version 1, binding `dedupe` if set.
    Insert {
        payload: RecordPayload,
        dedupe: Option<DedupeKey>,
    },
    /// Overwrite the stored row with the next version.
    Overwrite {
        current: SyncableRecord,
        payload: RecordPayload,
        is_deleted: bool,
    },
    /// Nothing to write; return this outcome.
    Done(ApplyOutcome),
}

/// Reject writes that could never be stored, before touching storage.
pub(crate) fn check_write(tenant: &TenantId, kind: EntityKind, write: &RecordWrite) -> Result<()> {
    let payload = match write {
        RecordWrite::Create { payload, dedupe } => {
            if dedupe.as_ref().is_some_and(|key| &key.tenant_id != tenant) {
                return Err(LedgerError::InvalidWrite(
                    "dedupe key belongs to another tenant".into(),
                ));
            }
            payload
        }
        RecordWrite::Update { payload, .. } => payload,
        RecordWrite::Delete { .. } => return Ok(()),
    };
    if payload.entity_kind() != kind {
        return Err(LedgerError::InvalidWrite(format!(
            "{} payload written as {}",
            payload.entity_kind(),
            kind
        )));
    }
    if !payload.is_fully_resolved() {
        return Err(LedgerError::InvalidWrite(
            "payload holds unresolved local references".into(),
        ));
    }
    Ok(())
}

/// Decide the outcome of `write` given the stored state.
///
/// `current` is the stored record addressed by an update/delete, or `None`.
/// `bound` is the record already bound to a create's dedupe key, if any.
pub(crate) fn decide(
    kind: EntityKind,
    write: RecordWrite,
    current: Option<SyncableRecord>,
    bound: Option<SyncableRecord>,
) -> Result<Decision> {
    let decision = match write {
        RecordWrite::Create { payload, dedupe } => match bound {
            Some(existing) if existing.entity_kind != kind => {
                return Err(LedgerError::InvalidWrite(format!(
                    "local id already bound to {} #{}",
                    existing.entity_kind, existing.server_id
                )));
            }
            Some(existing) => Decision::Done(ApplyOutcome::Replayed(existing)),
            None => Decision::Insert { payload, dedupe },
        },
        RecordWrite::Update {
            expected, payload, ..
        } => match current {
            None => Decision::Done(ApplyOutcome::NotFound),
            Some(current) if current.version != expected => {
                Decision::Done(ApplyOutcome::VersionConflict(current))
            }
            Some(current) if current.is_deleted => Decision::Done(ApplyOutcome::Deleted(current)),
            Some(current) => Decision::Overwrite {
                current,
                payload,
                is_deleted: false,
            },
        },
        RecordWrite::Delete { expected, .. } => match current {
            None => Decision::Done(ApplyOutcome::NotFound),
            Some(current) if current.version != expected => {
                Decision::Done(ApplyOutcome::VersionConflict(current))
            }
            Some(current) if current.is_deleted => Decision::Done(ApplyOutcome::Unchanged(current)),
            Some(current) => {
                let payload = current.payload.clone();
                Decision::Overwrite {
                    current,
                    payload,
                    is_deleted: true,
                }
            }
        },
    };
    Ok(decision)
}

/// Fields assigned by the write that produces a stored version.
pub(crate) struct Stamp {
    pub server_id: ServerId,
    pub local_id: Option<LocalId>,
    pub version: Version,
    pub change_seq: Watermark,
    pub updated_at: i64,
    pub is_deleted: bool,
}

/// Build the stored record for a stamped write.
pub(crate) fn stamp(
    tenant: &TenantId,
    kind: EntityKind,
    stamp: Stamp,
    payload: RecordPayload,
) -> Result<SyncableRecord> {
    Ok(SyncableRecord {
        tenant_id: tenant.clone(),
        entity_kind: kind,
        server_id: stamp.server_id,
        local_id: stamp.local_id,
        version: stamp.version,
        change_seq: stamp.change_seq,
        updated_at: stamp.updated_at,
        is_deleted: stamp.is_deleted,
        fingerprint: ContentHash::of(&payload)?,
        payload,
    })
}
