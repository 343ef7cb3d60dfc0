//! The SyncEngine: one ledger, one orchestrator, one entry point.
//!
//! The engine is what a host service embeds. It owns the ledger handle and
//! the session registry, accepts requests either as typed values or as the
//! JSON envelope devices send, and exposes the server-side write path used
//! for catalog data that devices may only read.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use preventa_core::{
    validate_payload, EntityKind, RecordPayload, RecordRef, ServerId, SyncableRecord, TenantId,
};
use preventa_ledger::{
    ApplyOutcome, IdMap, IdMapping, Ledger, LedgerConfig, MemoryLedger, RecordWrite, SqliteLedger,
};
use preventa_sync::{SessionContext, SyncConfig, SyncOrchestrator, SyncRequest, SyncResponse};

use crate::error::{EngineError, Result};

/// Configuration for the engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ledger configuration.
    pub ledger: LedgerConfig,
    /// Sync configuration.
    pub sync: SyncConfig,
}

/// The main engine struct.
///
/// Provides a unified API for:
/// - Running device sync sessions
/// - Writing server-owned records
/// - Reading records and id bindings
pub struct SyncEngine<L> {
    ledger: Arc<L>,
    orchestrator: SyncOrchestrator<L>,
    config: EngineConfig,
}

impl SyncEngine<MemoryLedger> {
    /// Engine over a fresh in-memory ledger.
    pub fn in_memory(config: EngineConfig) -> Self {
        let ledger = MemoryLedger::with_config(config.ledger.clone());
        Self::new(ledger, config)
    }
}

impl SyncEngine<SqliteLedger> {
    /// Engine over a SQLite ledger file, created and migrated if needed.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let ledger = SqliteLedger::open_with(path, config.ledger.clone())?;
        Ok(Self::new(ledger, config))
    }
}

impl<L: Ledger + IdMap + 'static> SyncEngine<L> {
    /// Create a new engine over `ledger`.
    ///
    /// `config.ledger` is only applied by the constructors that build the
    /// ledger themselves.
    pub fn new(ledger: L, config: EngineConfig) -> Self {
        let ledger = Arc::new(ledger);
        Self {
            orchestrator: SyncOrchestrator::new(Arc::clone(&ledger), config.sync.clone()),
            ledger,
            config,
        }
    }

    /// Get the ledger reference.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator<L> {
        &self.orchestrator
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Device Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one sync session for the authenticated device in `ctx`.
    pub async fn sync(&self, ctx: &SessionContext, request: SyncRequest) -> Result<SyncResponse> {
        Ok(self.orchestrator.sync(ctx, request).await?)
    }

    /// Run one sync session from a JSON request body and return the JSON
    /// response body.
    ///
    /// Tenant and device always come from `ctx`; identity fields in the body
    /// are ignored.
    pub async fn sync_json(&self, ctx: &SessionContext, body: &str) -> Result<String> {
        let request: SyncRequest = serde_json::from_str(body)?;
        let response = self.sync(ctx, request).await?;
        Ok(serde_json::to_string(&response)?)
    }

    /// Every binding created by the device in `ctx`, for a device that lost
    /// a response and needs to rebuild its local-to-server map.
    pub async fn id_mappings(&self, ctx: &SessionContext) -> Result<Vec<IdMapping>> {
        Ok(self
            .ledger
            .device_mappings(&ctx.tenant_id, &ctx.device_id)
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Server-side Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a record from the server side.
    ///
    /// This is the only writer for kinds that devices may not push. The
    /// payload is validated and every reference must name an existing,
    /// non-deleted record of the tenant by server id. Conflicts are returned
    /// as an [`ApplyOutcome`], not as an error.
    pub async fn admin_write(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        write: RecordWrite,
    ) -> Result<ApplyOutcome> {
        if let RecordWrite::Create { payload, .. } | RecordWrite::Update { payload, .. } = &write {
            if payload.entity_kind() != kind {
                return Err(EngineError::InvalidOperation(format!(
                    "{} payload written as {kind}",
                    payload.entity_kind()
                )));
            }
            validate_payload(payload)?;
            self.check_references(tenant, payload).await?;
        }

        let outcome = self.ledger.apply_mutation(tenant, kind, write).await?;
        match &outcome {
            ApplyOutcome::Applied(record) => info!(
                tenant = %tenant,
                kind = %kind,
                server_id = %record.server_id,
                version = %record.version,
                "admin write applied"
            ),
            other => debug!(tenant = %tenant, kind = %kind, outcome = ?other, "admin write not applied"),
        }
        Ok(outcome)
    }

    async fn check_references(&self, tenant: &TenantId, payload: &RecordPayload) -> Result<()> {
        for (kind, reference, _) in payload.references() {
            let server_id = match reference {
                RecordRef::Server(id) => *id,
                RecordRef::Local(local) => {
                    return Err(EngineError::InvalidOperation(format!(
                        "server-side writes must reference {kind} by server id, got local id {local}"
                    )))
                }
            };
            if !self.exists(tenant, kind, server_id).await? {
                return Err(EngineError::MissingReference { kind, server_id });
            }
        }
        Ok(())
    }

    async fn exists(&self, tenant: &TenantId, kind: EntityKind, server_id: ServerId) -> Result<bool> {
        Ok(self
            .ledger
            .get_record(tenant, kind, server_id)
            .await?
            .is_some_and(|r| !r.is_deleted))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Query Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the current version of a record, including soft-deleted ones.
    pub async fn record(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        server_id: ServerId,
    ) -> Result<Option<SyncableRecord>> {
        Ok(self.ledger.get_record(tenant, kind, server_id).await?)
    }
}
