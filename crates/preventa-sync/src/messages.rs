//! Wire types of one sync exchange.
//!
//! A device sends one [`SyncRequest`] and receives one [`SyncResponse`]. Field
//! names are camelCase on the wire. Tenant and device identity never appear
//! here: they come from the authenticated session.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use preventa_core::{
    ChildRef, EntityKind, LocalId, ServerId, SyncableRecord, Version, Watermark,
};
use preventa_ledger::IdMapping;

/// Mutation requested by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// One mutation made offline on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    /// Version the device last saw. Zero for creates.
    #[serde(default)]
    pub expected_version: Version,
    pub operation: Operation,
    /// Full record fields for creates and updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Value>,
    /// Device time of the edit (Unix ms), echoed back in conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

impl ClientChange {
    pub fn create(local_id: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            local_id: Some(LocalId::new(local_id)),
            server_id: None,
            expected_version: Version::UNSAVED,
            operation: Operation::Create,
            fields: Some(fields),
            modified_at: None,
        }
    }

    pub fn update(server_id: ServerId, expected: Version, fields: serde_json::Value) -> Self {
        Self {
            local_id: None,
            server_id: Some(server_id),
            expected_version: expected,
            operation: Operation::Update,
            fields: Some(fields),
            modified_at: None,
        }
    }

    pub fn delete(server_id: ServerId, expected: Version) -> Self {
        Self {
            local_id: None,
            server_id: Some(server_id),
            expected_version: expected,
            operation: Operation::Delete,
            fields: None,
            modified_at: None,
        }
    }

    pub fn modified_at(mut self, at: i64) -> Self {
        self.modified_at = Some(at);
        self
    }
}

/// Request body of one sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Watermark returned by the previous sync; `None` asks for a full sync.
    #[serde(default)]
    pub last_sync_timestamp: Option<Watermark>,
    /// Kinds to pull; `None` pulls every kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_kinds: Option<BTreeSet<EntityKind>>,
    #[serde(default)]
    pub client_changes: BTreeMap<EntityKind, Vec<ClientChange>>,
}

impl SyncRequest {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn since(watermark: Watermark) -> Self {
        Self {
            last_sync_timestamp: Some(watermark),
            ..Self::default()
        }
    }

    pub fn with_change(mut self, kind: EntityKind, change: ClientChange) -> Self {
        self.client_changes.entry(kind).or_default().push(change);
        self
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        self.entity_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn change_count(&self) -> usize {
        self.client_changes.values().map(Vec::len).sum()
    }

    /// Kinds to pull, in dependency order.
    pub fn pull_kinds(&self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|k| self.entity_kinds.as_ref().map_or(true, |set| set.contains(k)))
            .collect()
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The stored version stays; the client's edit is discarded server-side.
    ServerWins,
}

/// A client edit that lost against a newer stored version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub entity_kind: EntityKind,
    pub entity_id: ServerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    pub operation: Operation,
    /// Position of the change within `clientChanges[entityKind]`.
    pub index: usize,
    /// The fields the client submitted, as received (`null` for deletes).
    pub client_value: serde_json::Value,
    /// The authoritative stored record.
    pub server_value: SyncableRecord,
    pub expected_version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_modified_at: Option<i64>,
    pub server_modified_at: i64,
    pub resolution: Resolution,
    /// The first child (order line, route stop) on which the two sides differ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<ChildRef>,
}

/// Category of a per-record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordErrorKind {
    /// Malformed or disallowed payload; rejected before reaching the ledger.
    Validation,
    /// A referenced record is missing, deleted, or belongs to another tenant.
    Referential,
    /// The ledger was briefly unavailable for this record.
    TransientStorage,
    /// The session ran out of time before this change was processed.
    BudgetExceeded,
}

impl RecordErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecordErrorKind::TransientStorage | RecordErrorKind::BudgetExceeded
        )
    }
}

/// A client change that was not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub entity_kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    pub operation: Operation,
    /// Position of the change within `clientChanges[entityKind]`.
    pub index: usize,
    pub kind: RecordErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<ChildRef>,
}

/// Per-kind tallies of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub pulled_counts: BTreeMap<EntityKind, usize>,
    pub pushed_counts: BTreeMap<EntityKind, usize>,
    pub conflict_counts: BTreeMap<EntityKind, usize>,
    pub error_counts: BTreeMap<EntityKind, usize>,
    pub conflicts_found: usize,
    pub errors_found: usize,
}

/// Response body of one sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Watermark to send as `lastSyncTimestamp` next time.
    pub server_timestamp: Watermark,
    pub server_changes: BTreeMap<EntityKind, Vec<SyncableRecord>>,
    pub id_mappings: Vec<IdMapping>,
    pub conflicts: Vec<ConflictEntry>,
    pub errors: Vec<RecordError>,
    pub summary: SyncSummary,
    /// Some kind was cut short by the per-kind pull cap; sync again to
    /// continue from `serverTimestamp`.
    pub has_more: bool,
}

impl SyncResponse {
    /// Records of one kind in `serverChanges`.
    pub fn changes(&self, kind: EntityKind) -> &[SyncableRecord] {
        self.server_changes.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn is_quiet(&self) -> bool {
        self.server_changes.values().all(Vec::is_empty)
    }
}
