//! Per-record outcome aggregation.
//!
//! The [`Reporter`] turns the outcome of every pushed change into entries of
//! two independent lists, `conflicts` and `errors`, plus the id mappings and
//! the records that must be echoed back to the device. Nothing recorded here
//! ever stops the session.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use preventa_core::{ChildRef, EntityKind, LocalId, ServerId, SyncableRecord, ValidationError};
use preventa_ledger::{IdMapping, LedgerError};

use crate::error::SyncError;
use crate::messages::{ClientChange, ConflictEntry, RecordError, RecordErrorKind, SyncSummary};

/// Why a single change was not applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub kind: RecordErrorKind,
    pub message: String,
    pub child: Option<ChildRef>,
}

impl Rejection {
    fn new(kind: RecordErrorKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
            child: None,
        }
    }

    pub fn validation(message: impl fmt::Display) -> Self {
        Self::new(RecordErrorKind::Validation, message)
    }

    pub fn referential(message: impl fmt::Display) -> Self {
        Self::new(RecordErrorKind::Referential, message)
    }

    pub fn transient(message: impl fmt::Display) -> Self {
        Self::new(RecordErrorKind::TransientStorage, message)
    }

    pub fn budget_exceeded() -> Self {
        Self::new(
            RecordErrorKind::BudgetExceeded,
            "session budget exhausted before this change was applied",
        )
    }

    pub fn at_child(mut self, child: Option<ChildRef>) -> Self {
        self.child = child;
        self
    }
}

impl From<ValidationError> for Rejection {
    fn from(e: ValidationError) -> Self {
        Rejection::validation(e)
    }
}

/// Early exit from processing one change.
#[derive(Debug)]
pub(crate) enum Halt {
    /// Stop this change and report it; the batch continues.
    Reject(Rejection),
    /// Stop the whole session.
    Abort(SyncError),
}

impl From<Rejection> for Halt {
    fn from(r: Rejection) -> Self {
        Halt::Reject(r)
    }
}

impl From<ValidationError> for Halt {
    fn from(e: ValidationError) -> Self {
        Halt::Reject(e.into())
    }
}

impl From<LedgerError> for Halt {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Transient(msg) => Halt::Reject(Rejection::transient(msg)),
            LedgerError::InvalidWrite(msg) => Halt::Reject(Rejection::validation(msg)),
            other => Halt::Abort(SyncError::Ledger(other)),
        }
    }
}

pub(crate) type Step<T> = std::result::Result<T, Halt>;

/// What happened to one pushed change.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Written; `mapping` is set for creates.
    Applied {
        record: SyncableRecord,
        mapping: Option<IdMapping>,
    },
    /// A retried create; nothing was written.
    Replayed {
        record: SyncableRecord,
        mapping: IdMapping,
    },
    /// Already in the requested state; nothing was written.
    Unchanged { record: SyncableRecord },
    /// Lost against a newer stored version.
    Conflict(Box<ConflictEntry>),
    /// Not applied. `current` is the stored record when the device should be
    /// told about it (e.g. it was deleted).
    Rejected {
        rejection: Rejection,
        target: Option<ServerId>,
        current: Option<SyncableRecord>,
    },
}

impl MutationOutcome {
    pub fn rejected(rejection: Rejection) -> Self {
        MutationOutcome::Rejected {
            rejection,
            target: None,
            current: None,
        }
    }
}

/// Everything the push phase contributes to the response.
#[derive(Debug, Default)]
pub struct PushReport {
    pub conflicts: Vec<ConflictEntry>,
    pub errors: Vec<RecordError>,
    pub id_mappings: Vec<IdMapping>,
    /// Records touched by this session that the device must see regardless
    /// of its watermark or kind filter.
    pub echo: Vec<SyncableRecord>,
    pub summary: SyncSummary,
}

/// Collects outcomes in submission order.
#[derive(Debug, Default)]
pub struct Reporter {
    report: PushReport,
    mapped: BTreeSet<LocalId>,
    echo: BTreeMap<(EntityKind, ServerId), SyncableRecord>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of `change`, the `index`-th change of `kind`.
    pub fn record(
        &mut self,
        kind: EntityKind,
        index: usize,
        change: &ClientChange,
        outcome: MutationOutcome,
    ) {
        match outcome {
            MutationOutcome::Applied { record, mapping } => {
                self.pushed(kind);
                if let Some(mapping) = mapping {
                    self.map(mapping);
                }
                self.echo(record);
            }
            MutationOutcome::Replayed { record, mapping } => {
                self.pushed(kind);
                self.map(mapping);
                self.echo(record);
            }
            MutationOutcome::Unchanged { record } => {
                self.pushed(kind);
                self.echo(record);
            }
            MutationOutcome::Conflict(conflict) => {
                tracing::warn!(
                    kind = %kind,
                    server_id = %conflict.entity_id,
                    expected = %conflict.expected_version,
                    current = %conflict.server_value.version,
                    "version conflict, server wins"
                );
                *self.report.summary.conflict_counts.entry(kind).or_default() += 1;
                self.report.summary.conflicts_found += 1;
                self.echo(conflict.server_value.clone());
                self.report.conflicts.push(*conflict);
            }
            MutationOutcome::Rejected {
                rejection,
                target,
                current,
            } => {
                tracing::warn!(
                    kind = %kind,
                    index,
                    error_kind = ?rejection.kind,
                    "change rejected: {}",
                    rejection.message
                );
                *self.report.summary.error_counts.entry(kind).or_default() += 1;
                self.report.summary.errors_found += 1;
                if let Some(record) = current {
                    self.echo(record);
                }
                self.report.errors.push(RecordError {
                    entity_kind: kind,
                    entity_id: target.or(change.server_id),
                    local_id: change.local_id.clone(),
                    operation: change.operation,
                    index,
                    retryable: rejection.kind.is_retryable(),
                    kind: rejection.kind,
                    message: rejection.message,
                    child: rejection.child,
                });
            }
        }
    }

    fn pushed(&mut self, kind: EntityKind) {
        *self.report.summary.pushed_counts.entry(kind).or_default() += 1;
    }

    fn map(&mut self, mapping: IdMapping) {
        if self.mapped.insert(mapping.local_id.clone()) {
            self.report.id_mappings.push(mapping);
        }
    }

    fn echo(&mut self, record: SyncableRecord) {
        let key = record.key();
        match self.echo.get(&key) {
            Some(existing) if existing.version >= record.version => {}
            _ => {
                self.echo.insert(key, record);
            }
        }
    }

    pub fn finish(mut self) -> PushReport {
        self.report.echo = self.echo.into_values().collect();
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Operation, Resolution};
    use preventa_core::{
        Cliente, ContentHash, Extensions, RecordPayload, TenantId, Version, Watermark,
    };

    fn record(id: i64, version: u64) -> SyncableRecord {
        let payload = RecordPayload::Cliente(Cliente {
            nombre: "Acme".into(),
            rfc: None,
            telefono: None,
            email: None,
            direccion: None,
            latitud: None,
            longitud: None,
            lista_precios_id: None,
            activo: true,
            extensions: Extensions::new(),
        });
        SyncableRecord {
            tenant_id: TenantId::new("t1"),
            entity_kind: EntityKind::Cliente,
            server_id: ServerId(id),
            local_id: None,
            version: Version(version),
            change_seq: Watermark(version),
            updated_at: 0,
            is_deleted: false,
            fingerprint: ContentHash::of(&payload).unwrap(),
            payload,
        }
    }

    fn mapping(local: &str, id: i64) -> IdMapping {
        IdMapping {
            local_id: LocalId::new(local),
            server_id: ServerId(id),
            entity_kind: EntityKind::Cliente,
        }
    }

    #[test]
    fn test_mixed_outcomes_are_tallied_per_kind() {
        let mut reporter = Reporter::new();
        let create = ClientChange::create("L1", serde_json::json!({ "nombre": "Acme" }));
        let update = ClientChange::update(ServerId(7), Version(1), serde_json::json!({}));

        reporter.record(
            EntityKind::Cliente,
            0,
            &create,
            MutationOutcome::Applied {
                record: record(101, 1),
                mapping: Some(mapping("L1", 101)),
            },
        );
        reporter.record(
            EntityKind::Cliente,
            1,
            &create,
            MutationOutcome::Replayed {
                record: record(101, 1),
                mapping: mapping("L1", 101),
            },
        );
        reporter.record(
            EntityKind::Cliente,
            2,
            &update,
            MutationOutcome::rejected(Rejection::referential("missing")),
        );
        reporter.record(
            EntityKind::Cliente,
            3,
            &update,
            MutationOutcome::Conflict(Box::new(ConflictEntry {
                entity_kind: EntityKind::Cliente,
                entity_id: ServerId(7),
                local_id: None,
                operation: Operation::Update,
                index: 3,
                client_value: serde_json::json!({}),
                server_value: record(7, 3),
                expected_version: Version(1),
                client_modified_at: None,
                server_modified_at: 0,
                resolution: Resolution::ServerWins,
                child: None,
            })),
        );

        let report = reporter.finish();
        assert_eq!(report.id_mappings, vec![mapping("L1", 101)]);
        assert_eq!(report.summary.pushed_counts[&EntityKind::Cliente], 2);
        assert_eq!(report.summary.conflicts_found, 1);
        assert_eq!(report.summary.errors_found, 1);
        assert_eq!(report.errors[0].index, 2);
        assert_eq!(report.errors[0].entity_id, Some(ServerId(7)));
        assert!(!report.errors[0].retryable);

        let echoed: Vec<i64> = report.echo.iter().map(|r| r.server_id.0).collect();
        assert_eq!(echoed, vec![7, 101]);
    }

    #[test]
    fn test_echo_keeps_newest_version() {
        let mut reporter = Reporter::new();
        let change = ClientChange::delete(ServerId(5), Version(1));
        reporter.record(
            EntityKind::Cliente,
            0,
            &change,
            MutationOutcome::Unchanged { record: record(5, 4) },
        );
        reporter.record(
            EntityKind::Cliente,
            1,
            &change,
            MutationOutcome::Unchanged { record: record(5, 2) },
        );
        let report = reporter.finish();
        assert_eq!(report.echo.len(), 1);
        assert_eq!(report.echo[0].version, Version(4));
    }

    #[test]
    fn test_budget_rejection_is_retryable() {
        let mut reporter = Reporter::new();
        let change = ClientChange::delete(ServerId(5), Version(1));
        reporter.record(
            EntityKind::Pedido,
            0,
            &change,
            MutationOutcome::rejected(Rejection::budget_exceeded()),
        );
        let report = reporter.finish();
        assert_eq!(report.errors[0].kind, RecordErrorKind::BudgetExceeded);
        assert!(report.errors[0].retryable);
        assert_eq!(report.summary.error_counts[&EntityKind::Pedido], 1);
    }
}
