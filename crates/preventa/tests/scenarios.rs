//! End-to-end sync scenarios against the engine facade.
//!
//! Each test drives one or more devices through full sessions and checks the
//! guarantees a device relies on: versions, idempotent creates, conflicts,
//! watermarks, partial failure and deletion.

use preventa::core::ResultadoVisita;
use preventa::ledger::{LedgerConfig, MemoryLedger};
use preventa::sync::{RecordErrorKind, Resolution, SyncConfig};
use preventa::{
    ClientChange, EngineConfig, EntityKind, RecordPayload, ServerId, SessionContext, SyncEngine,
    SyncRequest, SyncResponse, TenantId, Version, Watermark,
};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn config() -> EngineConfig {
    EngineConfig {
        ledger: LedgerConfig { first_server_id: 101 },
        sync: SyncConfig::default(),
    }
}

fn engine() -> SyncEngine<MemoryLedger> {
    init_tracing();
    SyncEngine::in_memory(config())
}

fn device(name: &str) -> SessionContext {
    SessionContext::new("acme", name)
}

fn create_cliente(local: &str, nombre: &str) -> ClientChange {
    ClientChange::create(local, json!({ "nombre": nombre }))
}

fn visita(local: &str, cliente: i64) -> ClientChange {
    ClientChange::create(
        local,
        json!({ "clienteId": cliente, "programadaPara": 1_760_000_000_000i64 }),
    )
}

fn nombre(response: &SyncResponse, id: ServerId) -> String {
    let record = response
        .changes(EntityKind::Cliente)
        .iter()
        .find(|r| r.server_id == id)
        .expect("record in serverChanges");
    match &record.payload {
        RecordPayload::Cliente(c) => c.nombre.clone(),
        other => panic!("unexpected payload {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_returns_mapping_and_first_version() {
    let engine = engine();
    let request = SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("L1", "Acme"));

    let response = engine.sync(&device("tablet-a"), request).await.unwrap();

    assert_eq!(response.id_mappings.len(), 1);
    assert_eq!(response.id_mappings[0].local_id.as_str(), "L1");
    assert_eq!(response.id_mappings[0].server_id, ServerId(101));

    let clientes = response.changes(EntityKind::Cliente);
    assert_eq!(clientes.len(), 1);
    assert_eq!(clientes[0].server_id, ServerId(101));
    assert_eq!(clientes[0].version, Version(1));
    assert!(!clientes[0].is_deleted);
    assert_eq!(response.summary.pushed_counts[&EntityKind::Cliente], 1);
    assert_eq!(response.summary.pulled_counts[&EntityKind::Cliente], 1);
}

#[tokio::test]
async fn test_stale_update_loses_to_server() {
    let engine = engine();
    let a = device("tablet-a");
    let b = device("tablet-b");

    let seeded = engine
        .sync(&a, SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("L1", "Acme")))
        .await
        .unwrap();
    let t0 = engine.sync(&b, SyncRequest::full()).await.unwrap().server_timestamp;
    assert_eq!(t0, seeded.server_timestamp);

    let from_a = engine
        .sync(
            &a,
            SyncRequest::since(t0).with_change(
                EntityKind::Cliente,
                ClientChange::update(ServerId(101), Version(1), json!({ "nombre": "Acme (A)" })),
            ),
        )
        .await
        .unwrap();
    assert!(from_a.conflicts.is_empty());
    assert_eq!(from_a.changes(EntityKind::Cliente)[0].version, Version(2));

    let from_b = engine
        .sync(
            &b,
            SyncRequest::since(t0).with_change(
                EntityKind::Cliente,
                ClientChange::update(ServerId(101), Version(1), json!({ "nombre": "Acme (B)" }))
                    .modified_at(1_760_000_000_500),
            ),
        )
        .await
        .unwrap();

    assert_eq!(from_b.conflicts.len(), 1);
    let conflict = &from_b.conflicts[0];
    assert_eq!(conflict.resolution, Resolution::ServerWins);
    assert_eq!(conflict.entity_id, ServerId(101));
    assert_eq!(conflict.expected_version, Version(1));
    assert_eq!(conflict.client_value, json!({ "nombre": "Acme (B)" }));
    assert_eq!(conflict.client_modified_at, Some(1_760_000_000_500));
    assert_eq!(conflict.server_value.version, Version(2));
    assert_eq!(from_b.summary.conflicts_found, 1);
    assert!(from_b.errors.is_empty());

    // B's edit is discarded; B pulls A's version
    assert_eq!(nombre(&from_b, ServerId(101)), "Acme (A)");
    let stored = engine
        .record(&TenantId::new("acme"), EntityKind::Cliente, ServerId(101))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, Version(2));
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_version_advances_by_one_per_write() {
    let engine = engine();
    let ctx = device("tablet-a");
    engine
        .sync(&ctx, SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("L1", "v1")))
        .await
        .unwrap();

    let mut watermark = Watermark::ZERO;
    for expected in 1..=4u64 {
        let response = engine
            .sync(
                &ctx,
                SyncRequest::since(watermark).with_change(
                    EntityKind::Cliente,
                    ClientChange::update(
                        ServerId(101),
                        Version(expected),
                        json!({ "nombre": format!("v{}", expected + 1) }),
                    ),
                ),
            )
            .await
            .unwrap();
        let record = &response.changes(EntityKind::Cliente)[0];
        assert_eq!(record.version, Version(expected + 1));
        assert!(record.change_seq > watermark);
        watermark = response.server_timestamp;
    }
}

#[tokio::test]
async fn test_retried_create_is_applied_once() {
    let engine = engine();
    let ctx = device("tablet-a");
    let request = SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("L1", "Acme"));

    let first = engine.sync(&ctx, request.clone()).await.unwrap();
    let second = engine.sync(&ctx, request).await.unwrap();

    assert_eq!(first.id_mappings, second.id_mappings);
    assert_eq!(second.id_mappings[0].server_id, ServerId(101));
    assert_eq!(second.changes(EntityKind::Cliente)[0].version, Version(1));
    assert_eq!(engine.ledger().record_count(&TenantId::new("acme")), 1);
}

#[tokio::test]
async fn test_full_then_delta_is_quiet() {
    let engine = engine();
    let ctx = device("tablet-a");
    engine
        .sync(
            &device("tablet-b"),
            SyncRequest::full()
                .with_change(EntityKind::Cliente, create_cliente("L1", "Acme"))
                .with_change(EntityKind::Cliente, create_cliente("L2", "Beta")),
        )
        .await
        .unwrap();

    let full = engine.sync(&ctx, SyncRequest::full()).await.unwrap();
    assert_eq!(full.changes(EntityKind::Cliente).len(), 2);

    let delta = engine
        .sync(&ctx, SyncRequest::since(full.server_timestamp))
        .await
        .unwrap();
    assert!(delta.is_quiet());
    assert_eq!(delta.server_timestamp, full.server_timestamp);
    for kind in EntityKind::ALL {
        assert!(delta.changes(kind).is_empty(), "{kind} not empty");
    }
}

#[tokio::test]
async fn test_bad_reference_fails_alone() {
    let engine = engine();
    let ctx = device("tablet-a");
    engine
        .sync(&ctx, SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("C1", "Acme")))
        .await
        .unwrap();

    let mut request = SyncRequest::full();
    for (i, cliente) in [101, 101, 999, 101, 101].into_iter().enumerate() {
        request = request.with_change(EntityKind::Visita, visita(&format!("V{}", i + 1), cliente));
    }
    let response = engine.sync(&ctx, request).await.unwrap();

    assert_eq!(response.errors.len(), 1);
    let error = &response.errors[0];
    assert_eq!(error.index, 2);
    assert_eq!(error.kind, RecordErrorKind::Referential);
    assert_eq!(error.local_id.as_ref().map(|l| l.as_str()), Some("V3"));
    assert!(!error.retryable);

    assert_eq!(response.summary.pushed_counts[&EntityKind::Visita], 4);
    let locals: Vec<_> = response
        .id_mappings
        .iter()
        .map(|m| m.local_id.as_str().to_string())
        .collect();
    assert_eq!(locals, vec!["V1", "V2", "V4", "V5"]);
    assert_eq!(response.changes(EntityKind::Visita).len(), 4);
}

#[tokio::test]
async fn test_deletion_reaches_other_devices_once() {
    let engine = engine();
    let a = device("tablet-a");
    let b = device("tablet-b");
    engine
        .sync(&a, SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("L1", "Acme")))
        .await
        .unwrap();
    let t0 = engine.sync(&b, SyncRequest::full()).await.unwrap().server_timestamp;

    let deleted = engine
        .sync(
            &a,
            SyncRequest::since(t0)
                .with_change(EntityKind::Cliente, ClientChange::delete(ServerId(101), Version(1))),
        )
        .await
        .unwrap();
    assert!(deleted.errors.is_empty());

    let delta = engine.sync(&b, SyncRequest::since(t0)).await.unwrap();
    let clientes = delta.changes(EntityKind::Cliente);
    assert_eq!(clientes.len(), 1);
    assert!(clientes[0].is_deleted);
    assert_eq!(clientes[0].version, Version(2));

    let again = engine
        .sync(&b, SyncRequest::since(delta.server_timestamp))
        .await
        .unwrap();
    assert!(again.is_quiet());

    let fresh = engine.sync(&device("tablet-c"), SyncRequest::full()).await.unwrap();
    assert!(fresh.changes(EntityKind::Cliente).is_empty());
}

#[tokio::test]
async fn test_order_references_client_created_in_same_batch() {
    let engine = engine();
    let ctx = device("tablet-a");
    let request = SyncRequest::full()
        .with_change(
            EntityKind::Pedido,
            ClientChange::create(
                "P1",
                json!({
                    "clienteId": "C1",
                    "fecha": 1_760_000_000_000i64,
                    "estado": "borrador",
                    "lineas": []
                }),
            ),
        )
        .with_change(EntityKind::Cliente, create_cliente("C1", "Acme"));

    let response = engine.sync(&ctx, request).await.unwrap();

    assert!(response.errors.is_empty(), "{:?}", response.errors);
    let pedido = &response.changes(EntityKind::Pedido)[0];
    match &pedido.payload {
        RecordPayload::Pedido(p) => assert_eq!(p.cliente_id.server_id(), Some(ServerId(101))),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_overflowing_order_line_fails_alone() {
    let engine = engine();
    let ctx = device("tablet-a");
    let request = SyncRequest::full()
        .with_change(EntityKind::Cliente, create_cliente("C1", "Acme"))
        .with_change(
            EntityKind::Pedido,
            ClientChange::create(
                "P1",
                json!({
                    "clienteId": "C1",
                    "fecha": 1_760_000_000_000i64,
                    "estado": "confirmado",
                    "lineas": [
                        { "linea": 1, "productoId": 999, "cantidad": 2, "precioUnitario": 9_000_000_000_000_000_000i64 }
                    ]
                }),
            ),
        );

    let response = engine.sync(&ctx, request).await.unwrap();

    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].entity_kind, EntityKind::Pedido);
    assert_eq!(response.errors[0].kind, RecordErrorKind::Validation);
    assert_eq!(response.id_mappings.len(), 1);
    assert_eq!(response.id_mappings[0].local_id.as_str(), "C1");
    assert_eq!(response.changes(EntityKind::Cliente).len(), 1);
    assert!(response.changes(EntityKind::Pedido).is_empty());
}

#[tokio::test]
async fn test_tenants_do_not_see_each_other() {
    let engine = engine();
    engine
        .sync(
            &device("tablet-a"),
            SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("L1", "Acme")),
        )
        .await
        .unwrap();

    let other = SessionContext::new("globex", "tablet-a");
    let response = engine
        .sync(
            &other,
            SyncRequest::full().with_change(EntityKind::Visita, visita("V1", 101)),
        )
        .await
        .unwrap();

    assert!(response.changes(EntityKind::Cliente).is_empty());
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].kind, RecordErrorKind::Referential);
}

#[tokio::test]
async fn test_visit_result_round_trips() {
    let engine = engine();
    let ctx = device("tablet-a");
    engine
        .sync(&ctx, SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("C1", "Acme")))
        .await
        .unwrap();

    let response = engine
        .sync(
            &ctx,
            SyncRequest::full().with_change(
                EntityKind::Visita,
                ClientChange::create(
                    "V1",
                    json!({
                        "clienteId": "C1",
                        "programadaPara": 1_760_000_000_000i64,
                        "realizadaEn": 1_760_000_360_000i64,
                        "resultado": "sin_venta"
                    }),
                ),
            ),
        )
        .await
        .unwrap();

    match &response.changes(EntityKind::Visita)[0].payload {
        RecordPayload::Visita(v) => assert_eq!(v.resultado, Some(ResultadoVisita::SinVenta)),
        other => panic!("unexpected payload {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope and storage
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_json_envelope_ignores_body_identity() {
    let engine = engine();
    let body = json!({
        "tenantId": "globex",
        "deviceId": "spoofed",
        "lastSyncTimestamp": null,
        "clientChanges": {
            "cliente": [
                { "localId": "L1", "operation": "create", "fields": { "nombre": "Acme" } }
            ]
        }
    })
    .to_string();

    let raw = engine.sync_json(&device("tablet-a"), &body).await.unwrap();
    let response: serde_json::Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(response["idMappings"][0]["localId"], "L1");
    assert_eq!(response["idMappings"][0]["serverId"], 101);
    let record = &response["serverChanges"]["cliente"][0];
    assert_eq!(record["tenantId"], "acme");
    assert_eq!(record["version"], 1);
    assert_eq!(record["isDeleted"], false);
    assert_eq!(response["summary"]["conflictsFound"], 0);
    assert_eq!(response["hasMore"], false);

    let bindings = engine
        .id_mappings(&SessionContext::new("globex", "spoofed"))
        .await
        .unwrap();
    assert!(bindings.is_empty());
}

#[tokio::test]
async fn test_sqlite_engine_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("preventa.db");
    let ctx = device("tablet-a");
    let request = SyncRequest::full().with_change(EntityKind::Cliente, create_cliente("L1", "Acme"));

    let first = {
        let engine = SyncEngine::open(&path, config()).unwrap();
        engine.sync(&ctx, request.clone()).await.unwrap()
    };

    let engine = SyncEngine::open(&path, config()).unwrap();
    let retried = engine.sync(&ctx, request).await.unwrap();

    assert_eq!(first.id_mappings, retried.id_mappings);
    assert_eq!(retried.id_mappings[0].server_id, ServerId(101));

    let delta = engine
        .sync(&ctx, SyncRequest::since(first.server_timestamp))
        .await
        .unwrap();
    assert!(delta.is_quiet());
}
