//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use preventa::{EngineConfig, EngineError, Result as EngineResult, SyncEngine};
use preventa_core::{DeviceId, EntityKind, LocalId, RecordPayload, RecordRef, ServerId, TenantId};
use preventa_ledger::{ApplyOutcome, LedgerConfig, MemoryLedger, RecordWrite};
use preventa_sync::{ClientChange, SessionContext};
use serde_json::json;

/// First server id handed out by fixture ledgers.
pub const FIRST_SERVER_ID: i64 = 101;

/// A fixed point in time (Unix ms) used for dates in fixture payloads.
pub const FIXTURE_DATE: i64 = 1_760_000_000_000;

/// A test fixture with one tenant and an engine over a memory ledger.
pub struct TestFixture {
    pub tenant: TenantId,
    pub engine: SyncEngine<MemoryLedger>,
}

impl TestFixture {
    /// Create a new test fixture with a random tenant name.
    pub fn new() -> Self {
        Self::for_tenant(format!("tenant-{:08x}", rand::random::<u32>()))
    }

    /// Create with a fixed tenant name.
    pub fn for_tenant(tenant: impl Into<String>) -> Self {
        Self::with_config(tenant, fixture_config())
    }

    pub fn with_config(tenant: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            tenant: TenantId::new(tenant),
            engine: SyncEngine::in_memory(config),
        }
    }

    /// Session context of one device of this tenant.
    pub fn device(&self, name: &str) -> SessionContext {
        SessionContext {
            tenant_id: self.tenant.clone(),
            device_id: DeviceId::new(name),
        }
    }

    /// Several devices of this tenant, named `device-0`, `device-1`, ...
    pub fn devices(&self, count: usize) -> Vec<SessionContext> {
        (0..count).map(|i| self.device(&format!("device-{i}"))).collect()
    }

    /// Add a product from the server side and return its id.
    pub async fn seed_producto(&self, sku: &str, precio: i64) -> EngineResult<ServerId> {
        let payload = RecordPayload::from_fields(
            EntityKind::Producto,
            json!({ "sku": sku, "nombre": format!("Producto {sku}"), "precio": precio }),
        )?;
        let outcome = self
            .engine
            .admin_write(
                &self.tenant,
                EntityKind::Producto,
                RecordWrite::Create {
                    payload,
                    dedupe: None,
                },
            )
            .await?;
        match outcome {
            ApplyOutcome::Applied(record) | ApplyOutcome::Replayed(record) => Ok(record.server_id),
            other => Err(EngineError::InvalidOperation(format!(
                "seeding {sku} answered with {other:?}"
            ))),
        }
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine configuration used by fixtures: ids start at [`FIRST_SERVER_ID`].
pub fn fixture_config() -> EngineConfig {
    EngineConfig {
        ledger: LedgerConfig {
            first_server_id: FIRST_SERVER_ID,
        },
        ..EngineConfig::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Change builders
// ─────────────────────────────────────────────────────────────────────────────

/// JSON form of a reference: a number for a server id, a string for a local id.
pub fn reference(r: &RecordRef) -> serde_json::Value {
    match r {
        RecordRef::Server(id) => json!(id.0),
        RecordRef::Local(local) => json!(local.as_str()),
    }
}

pub fn cliente(local: &str, nombre: &str) -> ClientChange {
    ClientChange::create(local, json!({ "nombre": nombre }))
}

pub fn visita(local: &str, cliente: RecordRef) -> ClientChange {
    ClientChange::create(
        local,
        json!({ "clienteId": reference(&cliente), "programadaPara": FIXTURE_DATE }),
    )
}

/// An order line: `(linea, producto, cantidad, precio_unitario)`.
pub type Linea = (u32, RecordRef, u32, i64);

pub fn pedido(local: &str, cliente: RecordRef, lineas: &[Linea]) -> ClientChange {
    let lineas: Vec<_> = lineas
        .iter()
        .map(|(linea, producto, cantidad, precio)| {
            json!({
                "linea": linea,
                "productoId": reference(producto),
                "cantidad": cantidad,
                "precioUnitario": precio,
            })
        })
        .collect();
    ClientChange::create(
        local,
        json!({
            "clienteId": reference(&cliente),
            "fecha": FIXTURE_DATE,
            "estado": "borrador",
            "lineas": lineas,
        }),
    )
}

pub fn ruta(local: &str, nombre: &str, paradas: &[RecordRef]) -> ClientChange {
    let paradas: Vec<_> = paradas
        .iter()
        .enumerate()
        .map(|(i, cliente)| json!({ "orden": i + 1, "clienteId": reference(cliente) }))
        .collect();
    ClientChange::create(
        local,
        json!({ "nombre": nombre, "fecha": FIXTURE_DATE, "paradas": paradas }),
    )
}

pub fn local(id: &str) -> RecordRef {
    RecordRef::Local(LocalId::new(id))
}

pub fn server(id: i64) -> RecordRef {
    RecordRef::Server(ServerId(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use preventa_sync::SyncRequest;

    #[tokio::test]
    async fn test_fixture_order_with_lines() {
        let fixture = TestFixture::new();
        let producto = fixture.seed_producto("RF-600", 1450).await.unwrap();
        assert_eq!(producto, ServerId(FIRST_SERVER_ID));

        let request = SyncRequest::full()
            .with_change(EntityKind::Cliente, cliente("C1", "Acme"))
            .with_change(
                EntityKind::Pedido,
                pedido("P1", local("C1"), &[(1, RecordRef::Server(producto), 3, 1450)]),
            );
        let response = fixture.engine.sync(&fixture.device("d1"), request).await.unwrap();

        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(response.changes(EntityKind::Pedido).len(), 1);
        // The catalog is pulled along with the device's own records
        assert_eq!(response.changes(EntityKind::Producto).len(), 1);
    }

    #[tokio::test]
    async fn test_fixture_route_through_new_clients() {
        let fixture = TestFixture::for_tenant("acme");
        let request = SyncRequest::full()
            .with_change(EntityKind::Cliente, cliente("C1", "Acme"))
            .with_change(EntityKind::Cliente, cliente("C2", "Beta"))
            .with_change(EntityKind::Ruta, ruta("R1", "Lunes norte", &[local("C1"), local("C2")]));
        let response = fixture.engine.sync(&fixture.device("d1"), request).await.unwrap();

        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(response.id_mappings.len(), 3);
    }

    #[test]
    fn test_devices_are_distinct() {
        let fixture = TestFixture::new();
        let devices = fixture.devices(3);
        assert_ne!(devices[0], devices[1]);
        assert!(devices.iter().all(|d| d.tenant_id == fixture.tenant));
    }
}
