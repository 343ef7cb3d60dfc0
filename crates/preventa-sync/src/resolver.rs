//! Conflict resolution: deciding the outcome of one pushed change.
//!
//! The resolver never writes on its own judgement. It parses and validates the
//! change, resolves identifiers, and hands a single conditional write to the
//! ledger. The ledger's compare-and-swap decides; the resolver only translates
//! the ledger's answer into a [`MutationOutcome`].
//!
//! ## Policy
//!
//! - **Create**: a dedupe key that is already bound returns the bound record
//!   (idempotent retry). Otherwise the record is created and bound.
//! - **Update / Delete**: applied only at the client's `expectedVersion`. A
//!   stale version is a conflict settled `server_wins`: the stored record
//!   stays and is echoed back, and the client's submission is reported.
//! - **Budget**: once the session deadline passes, reads give up and no new
//!   write is started. A write that has started always runs to completion,
//!   so the reported outcome matches what the ledger holds.
//! - **Children**: order lines and route stops are versioned with their
//!   parent, so a conflict is always one entry for the parent, naming the
//!   first child on which the two sides differ.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use preventa_core::{
    validate_payload, EntityKind, Extensions, LocalId, Patch, RecordPayload, ServerId,
    SyncableRecord, TenantId, ValidationError, Version,
};
use preventa_ledger::{ApplyOutcome, IdMap, IdMapping, Ledger, LedgerError, RecordWrite};

use crate::error::{Result, SyncError};
use crate::idmap::IdReconciler;
use crate::messages::{ClientChange, ConflictEntry, Operation, Resolution};
use crate::report::{Halt, MutationOutcome, Rejection, Step};

/// Evaluates pushed changes for one device of one tenant.
pub struct ConflictResolver<L> {
    ledger: Arc<L>,
    tenant: TenantId,
    ids: IdReconciler<L>,
    deadline: Option<Instant>,
}

impl<L> Clone for ConflictResolver<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            tenant: self.tenant.clone(),
            ids: self.ids.clone(),
            deadline: self.deadline,
        }
    }
}

impl<L: Ledger + IdMap> ConflictResolver<L> {
    pub fn new(ledger: Arc<L>, ids: IdReconciler<L>, tenant: TenantId) -> Self {
        Self {
            ledger,
            tenant,
            ids,
            deadline: None,
        }
    }

    /// Stop starting work for changes once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Decide the outcome of `change`, the `index`-th change of `kind`.
    ///
    /// Per-record problems come back as [`MutationOutcome::Rejected`]; only
    /// failures that make the whole session pointless are `Err`.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        index: usize,
        change: &ClientChange,
    ) -> Result<MutationOutcome> {
        let evaluated = if kind.is_device_writable() {
            match change.operation {
                Operation::Create => self.create(kind, change).await,
                Operation::Update => self.update(kind, index, change).await,
                Operation::Delete => self.delete(kind, index, change).await,
            }
        } else {
            Err(ValidationError::ReadOnlyKind(kind).into())
        };

        match evaluated {
            Ok(outcome) => Ok(outcome),
            Err(Halt::Reject(rejection)) => Ok(MutationOutcome::rejected(rejection)),
            Err(Halt::Abort(e)) => Err(e),
        }
    }

    async fn create(&self, kind: EntityKind, change: &ClientChange) -> Step<MutationOutcome> {
        if change.server_id.is_some() {
            return Err(Rejection::validation("create must not carry a serverId").into());
        }
        if change.expected_version != Version::UNSAVED {
            return Err(Rejection::validation(format!(
                "create must carry expectedVersion 0, got {}",
                change.expected_version.0
            ))
            .into());
        }
        let local_id = change
            .local_id
            .as_ref()
            .ok_or(ValidationError::MissingField("localId"))?;

        // A retried create is answered from the binding alone, even if the
        // payload would no longer validate.
        if let Some(server_id) = self.read(self.ids.lookup(kind, local_id)).await? {
            let record = self
                .read(self.ledger.get_record(&self.tenant, kind, server_id))
                .await?
                .ok_or_else(|| {
                    Halt::Abort(SyncError::Ledger(LedgerError::InvalidData(format!(
                        "local id {local_id} bound to missing {kind} #{server_id}"
                    ))))
                })?;
            tracing::debug!(kind = %kind, local_id = %local_id, server_id = %server_id, "create replayed");
            return Ok(MutationOutcome::Replayed {
                mapping: mapping(local_id, &record),
                record,
            });
        }

        let mut payload = parse_fields(kind, change, Extensions::new())?;
        validate_payload(&payload)?;
        self.read(self.ids.resolve_references(&mut payload)).await?;

        let write = RecordWrite::Create {
            payload,
            dedupe: Some(self.ids.dedupe_key(local_id)),
        };
        match self.write(kind, write).await? {
            ApplyOutcome::Applied(record) => {
                tracing::debug!(kind = %kind, local_id = %local_id, server_id = %record.server_id, "record created");
                Ok(MutationOutcome::Applied {
                    mapping: Some(mapping(local_id, &record)),
                    record,
                })
            }
            ApplyOutcome::Replayed(record) => Ok(MutationOutcome::Replayed {
                mapping: mapping(local_id, &record),
                record,
            }),
            other => Err(Halt::Abort(SyncError::Ledger(LedgerError::InvalidData(
                format!("create answered with {other:?}"),
            )))),
        }
    }

    async fn update(
        &self,
        kind: EntityKind,
        index: usize,
        change: &ClientChange,
    ) -> Step<MutationOutcome> {
        let target = self.read(self.ids.resolve_target(kind, change)).await?;
        let Some(stored) = self
            .read(self.ledger.get_record(&self.tenant, kind, target))
            .await?
        else {
            return Ok(self.settle(kind, index, change, target, ApplyOutcome::NotFound, None));
        };

        let mut payload = parse_fields(kind, change, stored.payload.extensions().clone())?;
        validate_payload(&payload)?;
        self.read(self.ids.resolve_references(&mut payload)).await?;

        // The extensions merge is only valid on top of the version the
        // client edited.
        if stored.version != change.expected_version {
            let outcome = ApplyOutcome::VersionConflict(stored);
            return Ok(self.settle(kind, index, change, target, outcome, Some(&payload)));
        }

        let submitted = payload.clone();
        let write = RecordWrite::Update {
            server_id: target,
            expected: change.expected_version,
            payload,
        };
        let outcome = self.write(kind, write).await?;
        Ok(self.settle(kind, index, change, target, outcome, Some(&submitted)))
    }

    async fn delete(
        &self,
        kind: EntityKind,
        index: usize,
        change: &ClientChange,
    ) -> Step<MutationOutcome> {
        let target = self.read(self.ids.resolve_target(kind, change)).await?;
        let write = RecordWrite::Delete {
            server_id: target,
            expected: change.expected_version,
        };
        let outcome = self.write(kind, write).await?;
        Ok(self.settle(kind, index, change, target, outcome, None))
    }

    /// Await a read, giving up when the deadline passes.
    async fn read<T, E>(&self, read: impl Future<Output = std::result::Result<T, E>>) -> Step<T>
    where
        Halt: From<E>,
    {
        let Some(deadline) = self.deadline else {
            return Ok(read.await?);
        };
        match tokio::time::timeout_at(deadline, read).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Rejection::budget_exceeded().into()),
        }
    }

    /// Start one conditional write unless the deadline has passed. Once
    /// started, the write is never cancelled.
    async fn write(&self, kind: EntityKind, write: RecordWrite) -> Step<ApplyOutcome> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Rejection::budget_exceeded().into());
        }
        Ok(self.ledger.apply_mutation(&self.tenant, kind, write).await?)
    }

    /// Translate the ledger's answer to an update or delete.
    fn settle(
        &self,
        kind: EntityKind,
        index: usize,
        change: &ClientChange,
        target: ServerId,
        outcome: ApplyOutcome,
        submitted: Option<&RecordPayload>,
    ) -> MutationOutcome {
        match outcome {
            ApplyOutcome::Applied(record) => {
                tracing::debug!(
                    kind = %kind,
                    server_id = %target,
                    version = %record.version,
                    deleted = record.is_deleted,
                    "record written"
                );
                MutationOutcome::Applied {
                    record,
                    mapping: None,
                }
            }
            ApplyOutcome::Unchanged(record) | ApplyOutcome::Replayed(record) => {
                MutationOutcome::Unchanged { record }
            }
            ApplyOutcome::VersionConflict(current) => {
                MutationOutcome::Conflict(Box::new(ConflictEntry {
                    entity_kind: kind,
                    entity_id: target,
                    local_id: change.local_id.clone(),
                    operation: change.operation,
                    index,
                    client_value: change.fields.clone().unwrap_or(serde_json::Value::Null),
                    expected_version: change.expected_version,
                    client_modified_at: change.modified_at,
                    server_modified_at: current.updated_at,
                    resolution: Resolution::ServerWins,
                    child: submitted.and_then(|p| p.first_divergent_child(&current.payload)),
                    server_value: current,
                }))
            }
            ApplyOutcome::Deleted(current) => MutationOutcome::Rejected {
                rejection: Rejection::referential(format!("{kind} #{target} is deleted")),
                target: Some(target),
                current: Some(current),
            },
            ApplyOutcome::NotFound => MutationOutcome::Rejected {
                rejection: Rejection::referential(format!(
                    "{kind} #{target} does not exist in this tenant"
                )),
                target: Some(target),
                current: None,
            },
        }
    }
}

fn mapping(local_id: &LocalId, record: &SyncableRecord) -> IdMapping {
    IdMapping {
        local_id: local_id.clone(),
        server_id: record.server_id,
        entity_kind: record.entity_kind,
    }
}

/// Parse a change's `fields` as a full payload of `kind`.
///
/// `extensions` is the only three-state field: absent keeps `base`, null
/// clears it, an object replaces it.
fn parse_fields(
    kind: EntityKind,
    change: &ClientChange,
    base: Extensions,
) -> std::result::Result<RecordPayload, ValidationError> {
    let malformed = |reason: String| ValidationError::MalformedFields { kind, reason };

    let mut fields = change
        .fields
        .clone()
        .ok_or(ValidationError::MissingField("fields"))?;
    let extensions = Patch::<Extensions>::from_json_field(&fields, "extensions")
        .map_err(|e| malformed(format!("extensions: {e}")))?;
    fields
        .as_object_mut()
        .ok_or_else(|| malformed("fields must be an object".into()))?
        .remove("extensions");

    let mut payload = RecordPayload::from_fields(kind, fields)?;
    *payload.extensions_mut() = extensions.apply(base);
    Ok(payload)
}
