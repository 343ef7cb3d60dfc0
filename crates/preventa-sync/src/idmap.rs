//! ID reconciliation: turning device-local identifiers into server ids.
//!
//! A device names the records it created offline by [`LocalId`]. Once the
//! ledger has accepted the create, the `(tenant, device, local id)` dedupe key
//! is bound to a [`ServerId`]. The [`IdReconciler`] uses those bindings to
//! resolve the target of an update and every reference inside a payload,
//! including references to records created earlier in the same batch.

use std::collections::HashSet;
use std::sync::Arc;

use preventa_core::{
    ChildRef, DedupeKey, DeviceId, EntityKind, LocalId, RecordPayload, RecordRef, ServerId,
    TenantId,
};
use preventa_ledger::{IdMap, Ledger};

use crate::messages::ClientChange;
use crate::report::{Rejection, Step};

/// Resolves local identifiers for one device of one tenant.
pub struct IdReconciler<L> {
    ledger: Arc<L>,
    tenant: TenantId,
    device: DeviceId,
}

impl<L> Clone for IdReconciler<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            tenant: self.tenant.clone(),
            device: self.device.clone(),
        }
    }
}

impl<L: Ledger + IdMap> IdReconciler<L> {
    pub fn new(ledger: Arc<L>, tenant: TenantId, device: DeviceId) -> Self {
        Self {
            ledger,
            tenant,
            device,
        }
    }

    pub fn dedupe_key(&self, local_id: &LocalId) -> DedupeKey {
        DedupeKey::new(self.tenant.clone(), self.device.clone(), local_id.clone())
    }

    /// Server id bound to `local_id`, if its create has been accepted.
    ///
    /// A binding of another kind is a referential error: the device used the
    /// local id for a different record.
    pub(crate) async fn lookup(&self, kind: EntityKind, local_id: &LocalId) -> Step<Option<ServerId>> {
        let Some(mapping) = self.ledger.lookup(&self.dedupe_key(local_id)).await? else {
            return Ok(None);
        };
        if mapping.entity_kind != kind {
            return Err(Rejection::referential(format!(
                "local id {local_id} names a {}, not a {kind}",
                mapping.entity_kind
            ))
            .into());
        }
        Ok(Some(mapping.server_id))
    }

    /// The record an update or delete is addressed to.
    pub(crate) async fn resolve_target(&self, kind: EntityKind, change: &ClientChange) -> Step<ServerId> {
        match (change.server_id, &change.local_id) {
            (Some(id), _) => Ok(id),
            (None, Some(local_id)) => self.lookup(kind, local_id).await?.ok_or_else(|| {
                Rejection::referential(format!("local id {local_id} has no {kind} on the server"))
                    .into()
            }),
            (None, None) => Err(Rejection::validation(format!(
                "{} needs a serverId or a localId",
                change.operation
            ))
            .into()),
        }
    }

    /// Rewrite every reference in `payload` to a server id and check that each
    /// target exists, is live, and belongs to this tenant.
    pub(crate) async fn resolve_references(&self, payload: &mut RecordPayload) -> Step<()> {
        let refs: Vec<(EntityKind, RecordRef, Option<ChildRef>)> = payload
            .references()
            .into_iter()
            .map(|(kind, r, child)| (kind, r.clone(), child))
            .collect();

        let mut resolved = Vec::with_capacity(refs.len());
        let mut verified: HashSet<(EntityKind, ServerId)> = HashSet::new();

        for (kind, reference, child) in refs {
            let id = match reference {
                RecordRef::Server(id) => id,
                RecordRef::Local(local_id) => match self.lookup(kind, &local_id).await {
                    Ok(Some(id)) => id,
                    Ok(None) => {
                        return Err(Rejection::referential(format!(
                            "{kind} {local_id} is not known for this device"
                        ))
                        .at_child(child)
                        .into())
                    }
                    Err(halt) => return Err(halt),
                },
            };

            if verified.insert((kind, id)) {
                match self.ledger.get_record(&self.tenant, kind, id).await? {
                    Some(record) if record.is_deleted => {
                        return Err(Rejection::referential(format!("{kind} #{id} is deleted"))
                            .at_child(child)
                            .into())
                    }
                    Some(_) => {}
                    None => {
                        return Err(Rejection::referential(format!(
                            "{kind} #{id} does not exist in this tenant"
                        ))
                        .at_child(child)
                        .into())
                    }
                }
            }
            resolved.push(id);
        }

        for (slot, id) in payload.references_mut().into_iter().zip(resolved) {
            *slot = RecordRef::Server(id);
        }
        Ok(())
    }
}
