//! In-memory implementation of the Ledger trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence. One instance is
//! meant to back one test or one request scope; nothing here is global.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use preventa_core::{
    now_millis, DedupeKey, DeviceId, EntityKind, LocalId, ServerId, SyncableRecord, TenantId,
    Version, Watermark,
};

use crate::cas::{self, Decision, Stamp};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::traits::{ApplyOutcome, IdMap, IdMapping, Ledger, RecordWrite};

/// In-memory ledger implementation.
///
/// All data is lost when the ledger is dropped. Thread-safe via RwLock; the
/// write lock is held across the whole compare-and-swap.
pub struct MemoryLedger {
    inner: RwLock<MemoryLedgerInner>,
}

struct MemoryLedgerInner {
    /// Next server id to allocate (shared by all tenants).
    next_server_id: i64,

    /// Per-tenant state.
    tenants: HashMap<TenantId, TenantSpace>,
}

#[derive(Default)]
struct TenantSpace {
    /// Logical change counter.
    clock: Watermark,

    /// Records indexed by (kind, server id).
    records: HashMap<(EntityKind, ServerId), SyncableRecord>,

    /// Dedupe bindings: (device, local id) -> mapping.
    id_map: HashMap<(DeviceId, LocalId), IdMapping>,
}

impl MemoryLedger {
    /// Create a new empty in-memory ledger.
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            inner: RwLock::new(MemoryLedgerInner {
                next_server_id: config.first_server_id,
                tenants: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryLedgerInner>> {
        self.inner
            .read()
            .map_err(|e| LedgerError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryLedgerInner>> {
        self.inner
            .write()
            .map_err(|e| LedgerError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Number of stored records in a tenant, deleted ones included.
    pub fn record_count(&self, tenant: &TenantId) -> usize {
        self.read()
            .map(|inner| inner.tenants.get(tenant).map_or(0, |t| t.records.len()))
            .unwrap_or(0)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantSpace {
    fn bound_record(&self, dedupe: Option<&DedupeKey>) -> Option<SyncableRecord> {
        let key = dedupe?;
        let mapping = self
            .id_map
            .get(&(key.device_id.clone(), key.local_id.clone()))?;
        self.records
            .get(&(mapping.entity_kind, mapping.server_id))
            .cloned()
    }

    fn tick(&mut self) -> Watermark {
        self.clock = self.clock.next();
        self.clock
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn apply_mutation(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        write: RecordWrite,
    ) -> Result<ApplyOutcome> {
        cas::check_write(tenant, kind, &write)?;

        let mut inner = self.write()?;
        let inner = &mut *inner;
        let space = inner.tenants.entry(tenant.clone()).or_default();

        let current = write
            .server_id()
            .and_then(|id| space.records.get(&(kind, id)).cloned());
        let bound = match &write {
            RecordWrite::Create { dedupe, .. } => space.bound_record(dedupe.as_ref()),
            _ => None,
        };

        match cas::decide(kind, write, current, bound)? {
            Decision::Done(outcome) => Ok(outcome),
            Decision::Insert { payload, dedupe } => {
                let server_id = ServerId(inner.next_server_id);
                let record = cas::stamp(
                    tenant,
                    kind,
                    Stamp {
                        server_id,
                        local_id: dedupe.as_ref().map(|k| k.local_id.clone()),
                        version: Version::FIRST,
                        change_seq: space.clock.next(),
                        updated_at: now_millis(),
                        is_deleted: false,
                    },
                    payload,
                )?;

                inner.next_server_id += 1;
                space.tick();
                if let Some(key) = dedupe {
                    space.id_map.insert(
                        (key.device_id, key.local_id.clone()),
                        IdMapping {
                            local_id: key.local_id,
                            server_id,
                            entity_kind: kind,
                        },
                    );
                }
                space.records.insert((kind, server_id), record.clone());
                Ok(ApplyOutcome::Applied(record))
            }
            Decision::Overwrite {
                current,
                payload,
                is_deleted,
            } => {
                let record = cas::stamp(
                    tenant,
                    kind,
                    Stamp {
                        server_id: current.server_id,
                        local_id: current.local_id,
                        version: current.version.next(),
                        change_seq: space.clock.next(),
                        updated_at: now_millis(),
                        is_deleted,
                    },
                    payload,
                )?;

                space.tick();
                space.records.insert((kind, current.server_id), record.clone());
                Ok(ApplyOutcome::Applied(record))
            }
        }
    }

    async fn get_record(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        server_id: ServerId,
    ) -> Result<Option<SyncableRecord>> {
        let inner = self.read()?;
        Ok(inner
            .tenants
            .get(tenant)
            .and_then(|t| t.records.get(&(kind, server_id)).cloned()))
    }

    async fn records_since_page(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        after: Watermark,
        upto: Watermark,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<SyncableRecord>> {
        let inner = self.read()?;
        let Some(space) = inner.tenants.get(tenant) else {
            return Ok(Vec::new());
        };

        let mut records: Vec<SyncableRecord> = space
            .records
            .values()
            .filter(|r| r.entity_kind == kind)
            .filter(|r| r.change_seq > after && r.change_seq <= upto)
            .filter(|r| include_deleted || !r.is_deleted)
            .cloned()
            .collect();

        records.sort_by_key(|r| r.change_seq);
        records.truncate(limit);
        Ok(records)
    }

    async fn head(&self, tenant: &TenantId) -> Result<Watermark> {
        let inner = self.read()?;
        Ok(inner
            .tenants
            .get(tenant)
            .map_or(Watermark::ZERO, |t| t.clock))
    }
}

#[async_trait]
impl IdMap for MemoryLedger {
    async fn lookup(&self, key: &DedupeKey) -> Result<Option<IdMapping>> {
        let inner = self.read()?;
        Ok(inner.tenants.get(&key.tenant_id).and_then(|t| {
            t.id_map
                .get(&(key.device_id.clone(), key.local_id.clone()))
                .cloned()
        }))
    }

    async fn device_mappings(&self, tenant: &TenantId, device: &DeviceId) -> Result<Vec<IdMapping>> {
        let inner = self.read()?;
        let mut mappings: Vec<IdMapping> = inner
            .tenants
            .get(tenant)
            .map(|t| {
                t.id_map
                    .iter()
                    .filter(|((d, _), _)| d == device)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default();
        mappings.sort_by_key(|m| m.server_id);
        Ok(mappings)
    }
}
