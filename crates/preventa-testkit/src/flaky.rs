//! A ledger wrapper that fails on demand.
//!
//! Wraps any ledger and injects the two storage failures the engine must
//! tell apart: a transient one on a single write (reported per record,
//! retryable) and an outage (aborts the session). It can also hold back the
//! acknowledgement of a write that has already committed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use preventa_core::{DedupeKey, DeviceId, EntityKind, ServerId, SyncableRecord, TenantId, Watermark};
use preventa_ledger::{
    ApplyOutcome, IdMap, IdMapping, Ledger, LedgerError, RecordWrite, Result as LedgerResult,
};

pub struct FlakyLedger<L> {
    inner: L,
    failing_writes: AtomicUsize,
    down: AtomicBool,
    ack_delay_ms: AtomicU64,
}

impl<L> FlakyLedger<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            failing_writes: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            ack_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make the next `count` writes fail with [`LedgerError::Transient`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make every call fail with [`LedgerError::Unavailable`] until reset.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Commit every write, then wait `delay` before answering.
    pub fn delay_acks(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.ack_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn check_up(&self) -> LedgerResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<L: Ledger> Ledger for FlakyLedger<L> {
    async fn apply_mutation(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        write: RecordWrite,
    ) -> LedgerResult<ApplyOutcome> {
        self.check_up()?;
        if self.take_write_failure() {
            return Err(LedgerError::Transient("injected busy".into()));
        }
        let outcome = self.inner.apply_mutation(tenant, kind, write).await;
        let delay = self.ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        outcome
    }

    async fn get_record(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        server_id: ServerId,
    ) -> LedgerResult<Option<SyncableRecord>> {
        self.check_up()?;
        self.inner.get_record(tenant, kind, server_id).await
    }

    async fn records_since_page(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        after: Watermark,
        upto: Watermark,
        include_deleted: bool,
        limit: usize,
    ) -> LedgerResult<Vec<SyncableRecord>> {
        self.check_up()?;
        self.inner
            .records_since_page(tenant, kind, after, upto, include_deleted, limit)
            .await
    }

    async fn head(&self, tenant: &TenantId) -> LedgerResult<Watermark> {
        self.check_up()?;
        self.inner.head(tenant).await
    }
}

#[async_trait]
impl<L: IdMap> IdMap for FlakyLedger<L> {
    async fn lookup(&self, key: &DedupeKey) -> LedgerResult<Option<IdMapping>> {
        self.check_up()?;
        self.inner.lookup(key).await
    }

    async fn device_mappings(
        &self,
        tenant: &TenantId,
        device: &DeviceId,
    ) -> LedgerResult<Vec<IdMapping>> {
        self.check_up()?;
        self.inner.device_mappings(tenant, device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{cliente, fixture_config};
    use preventa::{EngineConfig, EngineError, SyncEngine};
    use preventa_core::Version;
    use preventa_ledger::MemoryLedger;
    use preventa_sync::{ClientChange, RecordErrorKind, SessionContext, SyncError, SyncRequest};
    use serde_json::json;

    fn engine() -> SyncEngine<FlakyLedger<MemoryLedger>> {
        engine_with(fixture_config())
    }

    fn engine_with(config: EngineConfig) -> SyncEngine<FlakyLedger<MemoryLedger>> {
        let ledger = MemoryLedger::with_config(config.ledger.clone());
        SyncEngine::new(FlakyLedger::new(ledger), config)
    }

    #[tokio::test]
    async fn test_transient_write_is_reported_and_retried() {
        let engine = engine();
        let ctx = SessionContext::new("acme", "d1");
        let request = SyncRequest::full().with_change(EntityKind::Cliente, cliente("L1", "Acme"));

        engine.ledger().fail_next_writes(1);
        let first = engine.sync(&ctx, request.clone()).await.unwrap();
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.errors[0].kind, RecordErrorKind::TransientStorage);
        assert!(first.errors[0].retryable);
        assert!(first.id_mappings.is_empty());

        let retried = engine.sync(&ctx, request).await.unwrap();
        assert!(retried.errors.is_empty());
        assert_eq!(retried.id_mappings.len(), 1);
        assert_eq!(engine.ledger().inner().record_count(&ctx.tenant_id), 1);
    }

    #[tokio::test]
    async fn test_outage_aborts_the_session() {
        let engine = engine();
        let ctx = SessionContext::new("acme", "d1");

        engine.ledger().set_down(true);
        let err = engine.sync(&ctx, SyncRequest::full()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Sync(SyncError::Ledger(LedgerError::Unavailable(_)))
        ));
        assert!(!err.is_retryable());

        engine.ledger().set_down(false);
        assert!(engine.sync(&ctx, SyncRequest::full()).await.is_ok());
        assert_eq!(engine.orchestrator().sessions().active_count(), 0);
    }

    #[tokio::test]
    async fn test_committed_write_is_reported_even_past_the_budget() {
        let mut config = fixture_config();
        config.sync.session_budget_ms = 100;
        let engine = engine_with(config);
        let ctx = SessionContext::new("acme", "d1");

        let created = engine
            .sync(&ctx, SyncRequest::full().with_change(EntityKind::Cliente, cliente("L1", "Acme")))
            .await
            .unwrap();
        let server_id = created.id_mappings[0].server_id;

        engine.ledger().delay_acks(Duration::from_millis(200));
        let request = SyncRequest::since(created.server_timestamp)
            .with_change(
                EntityKind::Cliente,
                ClientChange::update(server_id, Version(1), json!({ "nombre": "Acme SA" })),
            )
            .with_change(
                EntityKind::Cliente,
                ClientChange::update(server_id, Version(2), json!({ "nombre": "Acme SA de CV" })),
            );
        let response = engine.sync(&ctx, request).await.unwrap();

        assert!(response.conflicts.is_empty());
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].index, 1);
        assert_eq!(response.errors[0].kind, RecordErrorKind::BudgetExceeded);
        assert_eq!(response.summary.pushed_counts[&EntityKind::Cliente], 1);

        let stored = engine.record(&ctx.tenant_id, EntityKind::Cliente, server_id).await.unwrap().unwrap();
        assert_eq!(stored.version, Version(2));

        engine.ledger().delay_acks(Duration::ZERO);
        let resubmitted = SyncRequest::since(response.server_timestamp).with_change(
            EntityKind::Cliente,
            ClientChange::update(server_id, Version(2), json!({ "nombre": "Acme SA de CV" })),
        );
        let retried = engine.sync(&ctx, resubmitted).await.unwrap();
        assert!(retried.conflicts.is_empty());
        assert!(retried.errors.is_empty());
    }
}
