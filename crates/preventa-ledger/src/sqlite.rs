//! SQLite implementation of the Ledger trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking. Every write runs in an
//! IMMEDIATE transaction, so the version check and the write are one atomic
//! step even with several connections on the same file.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use preventa_core::{
    decode_payload, encode_payload, now_millis, ContentHash, DedupeKey, DeviceId, EntityKind,
    LocalId, ServerId, SyncableRecord, TenantId, Version, Watermark,
};

use crate::cas::{self, Decision, Stamp};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::migration;
use crate::traits::{ApplyOutcome, IdMap, IdMapping, Ledger, RecordWrite};

/// How long a writer waits on a locked database before giving up with a
/// transient error.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RECORD_COLUMNS: &str = "tenant_id, server_id, entity_kind, local_id, version, change_seq, \
                              updated_at, is_deleted, fingerprint, payload";

/// SQLite-based ledger implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteLedger {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    config: LedgerConfig,
}

impl SqliteLedger {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, LedgerConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Self> {
        Self::from_connection(Connection::open(path)?, config)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        Self::open_memory_with(LedgerConfig::default())
    }

    pub fn open_memory_with(config: LedgerConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(mut conn: Connection, config: LedgerConfig) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Run a blocking closure against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| LedgerError::Unavailable(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LedgerError::Unavailable(format!("spawn_blocking failed: {e}")))?
    }
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}

// Helper to convert a row to SyncableRecord
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncableRecord> {
    let kind: String = row.get(2)?;
    let fingerprint: Vec<u8> = row.get(8)?;
    let payload: Vec<u8> = row.get(9)?;

    let entity_kind = kind
        .parse::<EntityKind>()
        .map_err(|e| conversion_error(2, Type::Text, e))?;
    let fingerprint: [u8; 32] = fingerprint
        .try_into()
        .map_err(|_| conversion_error(8, Type::Blob, "fingerprint is not 32 bytes"))?;
    let payload = decode_payload(&payload).map_err(|e| conversion_error(9, Type::Blob, e))?;

    Ok(SyncableRecord {
        tenant_id: TenantId::new(row.get::<_, String>(0)?),
        entity_kind,
        server_id: ServerId(row.get(1)?),
        local_id: row.get::<_, Option<String>>(3)?.map(LocalId::new),
        version: Version(row.get::<_, i64>(4)? as u64),
        change_seq: Watermark(row.get::<_, i64>(5)? as u64),
        updated_at: row.get(6)?,
        is_deleted: row.get(7)?,
        fingerprint: ContentHash(fingerprint),
        payload,
    })
}

fn load_record(
    conn: &Connection,
    tenant: &TenantId,
    kind: EntityKind,
    server_id: ServerId,
) -> Result<Option<SyncableRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM records
         WHERE tenant_id = ?1 AND entity_kind = ?2 AND server_id = ?3"
    );
    Ok(conn
        .query_row(
            &sql,
            params![tenant.as_str(), kind.as_str(), server_id.0],
            row_to_record,
        )
        .optional()?)
}

fn load_bound(conn: &Connection, key: &DedupeKey) -> Result<Option<SyncableRecord>> {
    let server_id: Option<(i64, String)> = conn
        .query_row(
            "SELECT server_id, entity_kind FROM id_map
             WHERE tenant_id = ?1 AND device_id = ?2 AND local_id = ?3",
            params![
                key.tenant_id.as_str(),
                key.device_id.as_str(),
                key.local_id.as_str()
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match server_id {
        Some((id, kind)) => {
            let kind = kind
                .parse::<EntityKind>()
                .map_err(LedgerError::InvalidData)?;
            load_record(conn, &key.tenant_id, kind, ServerId(id))
        }
        None => Ok(None),
    }
}

/// Advance the tenant clock and return the new value.
fn tick(conn: &Connection, tenant: &TenantId) -> Result<Watermark> {
    conn.execute(
        "INSERT INTO tenant_clock (tenant_id, change_seq) VALUES (?1, 1)
         ON CONFLICT(tenant_id) DO UPDATE SET change_seq = change_seq + 1",
        params![tenant.as_str()],
    )?;
    let seq: i64 = conn.query_row(
        "SELECT change_seq FROM tenant_clock WHERE tenant_id = ?1",
        params![tenant.as_str()],
        |row| row.get(0),
    )?;
    Ok(Watermark(seq as u64))
}

fn insert_record(conn: &Connection, record: &SyncableRecord) -> Result<()> {
    let payload = encode_payload(&record.payload)?;
    conn.execute(
        "INSERT INTO records (
            tenant_id, server_id, entity_kind, local_id, version, change_seq,
            updated_at, is_deleted, fingerprint, payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.tenant_id.as_str(),
            record.server_id.0,
            record.entity_kind.as_str(),
            record.local_id.as_ref().map(LocalId::as_str),
            record.version.0 as i64,
            record.change_seq.0 as i64,
            record.updated_at,
            record.is_deleted,
            record.fingerprint.0.as_slice(),
            payload,
        ],
    )?;
    Ok(())
}

/// Compare-and-swap overwrite: only touches the row if it is still at
/// `expected`.
fn overwrite_record(conn: &Connection, record: &SyncableRecord, expected: Version) -> Result<()> {
    let payload = encode_payload(&record.payload)?;
    let changed = conn.execute(
        "UPDATE records
         SET version = ?1, change_seq = ?2, updated_at = ?3, is_deleted = ?4,
             fingerprint = ?5, payload = ?6
         WHERE tenant_id = ?7 AND server_id = ?8 AND version = ?9",
        params![
            record.version.0 as i64,
            record.change_seq.0 as i64,
            record.updated_at,
            record.is_deleted,
            record.fingerprint.0.as_slice(),
            payload,
            record.tenant_id.as_str(),
            record.server_id.0,
            expected.0 as i64,
        ],
    )?;

    if changed != 1 {
        return Err(LedgerError::InvalidData(format!(
            "record #{} moved off {} inside its write transaction",
            record.server_id, expected
        )));
    }
    Ok(())
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn apply_mutation(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        write: RecordWrite,
    ) -> Result<ApplyOutcome> {
        cas::check_write(tenant, kind, &write)?;
        let tenant = tenant.clone();
        let first_server_id = self.config.first_server_id;

        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = match write.server_id() {
                Some(id) => load_record(&tx, &tenant, kind, id)?,
                None => None,
            };
            let bound = match &write {
                RecordWrite::Create {
                    dedupe: Some(key), ..
                } => load_bound(&tx, key)?,
                _ => None,
            };

            let outcome = match cas::decide(kind, write, current, bound)? {
                Decision::Done(outcome) => outcome,
                Decision::Insert { payload, dedupe } => {
                    let server_id: i64 = tx.query_row(
                        "SELECT MAX(COALESCE(MAX(server_id) + 1, ?1), ?1) FROM records",
                        params![first_server_id],
                        |row| row.get(0),
                    )?;
                    let record = cas::stamp(
                        &tenant,
                        kind,
                        Stamp {
                            server_id: ServerId(server_id),
                            local_id: dedupe.as_ref().map(|k| k.local_id.clone()),
                            version: Version::FIRST,
                            change_seq: tick(&tx, &tenant)?,
                            updated_at: now_millis(),
                            is_deleted: false,
                        },
                        payload,
                    )?;
                    insert_record(&tx, &record)?;

                    if let Some(key) = dedupe {
                        tx.execute(
                            "INSERT INTO id_map
                                (tenant_id, device_id, local_id, entity_kind, server_id, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            params![
                                key.tenant_id.as_str(),
                                key.device_id.as_str(),
                                key.local_id.as_str(),
                                kind.as_str(),
                                server_id,
                                record.updated_at,
                            ],
                        )?;
                    }
                    ApplyOutcome::Applied(record)
                }
                Decision::Overwrite {
                    current,
                    payload,
                    is_deleted,
                } => {
                    let expected = current.version;
                    let record = cas::stamp(
                        &tenant,
                        kind,
                        Stamp {
                            server_id: current.server_id,
                            local_id: current.local_id,
                            version: expected.next(),
                            change_seq: tick(&tx, &tenant)?,
                            updated_at: now_millis(),
                            is_deleted,
                        },
                        payload,
                    )?;
                    overwrite_record(&tx, &record, expected)?;
                    ApplyOutcome::Applied(record)
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn get_record(
        &self,
        tenant: &TenantId,
        kind: EntityKind,
        server_id: ServerId,
    ) -> Result<Option<SyncableRecord>> {
        let tenant = tenant.clone();
        self.blocking(move |conn| load_record(conn, &tenant, kind, server_id))
            .await
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
        let tenant = tenant.clone();

        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE tenant_id = ?1 AND entity_kind = ?2
                   AND change_seq > ?3 AND change_seq <= ?4
                   AND (?5 OR is_deleted = 0)
                 ORDER BY change_seq
                 LIMIT ?6"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(
                    params![
                        tenant.as_str(),
                        kind.as_str(),
                        after.0 as i64,
                        upto.0 as i64,
                        include_deleted,
                        limit as i64,
                    ],
                    row_to_record,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn head(&self, tenant: &TenantId) -> Result<Watermark> {
        let tenant = tenant.clone();

        self.blocking(move |conn| {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT change_seq FROM tenant_clock WHERE tenant_id = ?1",
                    params![tenant.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.map_or(Watermark::ZERO, |s| Watermark(s as u64)))
        })
        .await
    }
}

fn row_to_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdMapping> {
    let kind: String = row.get(1)?;
    Ok(IdMapping {
        local_id: LocalId::new(row.get::<_, String>(0)?),
        entity_kind: kind
            .parse::<EntityKind>()
            .map_err(|e| conversion_error(1, Type::Text, e))?,
        server_id: ServerId(row.get(2)?),
    })
}

#[async_trait]
impl IdMap for SqliteLedger {
    async fn lookup(&self, key: &DedupeKey) -> Result<Option<IdMapping>> {
        let key = key.clone();

        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT local_id, entity_kind, server_id FROM id_map
                     WHERE tenant_id = ?1 AND device_id = ?2 AND local_id = ?3",
                    params![
                        key.tenant_id.as_str(),
                        key.device_id.as_str(),
                        key.local_id.as_str()
                    ],
                    row_to_mapping,
                )
                .optional()?)
        })
        .await
    }

    async fn device_mappings(&self, tenant: &TenantId, device: &DeviceId) -> Result<Vec<IdMapping>> {
        let tenant = tenant.clone();
        let device = device.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT local_id, entity_kind, server_id FROM id_map
                 WHERE tenant_id = ?1 AND device_id = ?2
                 ORDER BY server_id",
            )?;
            let mappings = stmt
                .query_map(params![tenant.as_str(), device.as_str()], row_to_mapping)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(mappings)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LedgerExt;
    use preventa_core::{
        EstadoPedido, Extensions, LineaPedido, Pedido, RecordPayload, RecordRef,
    };

    fn pedido(cliente: i64, cantidad: u32) -> RecordPayload {
        RecordPayload::Pedido(Pedido {
            cliente_id: RecordRef::Server(ServerId(cliente)),
            fecha: 1_700_000_000_000,
            estado: EstadoPedido::Borrador,
            notas: Some("entregar temprano".into()),
            lineas: vec![LineaPedido {
                linea: 1,
                producto_id: RecordRef::Server(ServerId(9)),
                cantidad,
                precio_unitario: 2500,
                descuento: 0,
            }],
            extensions: Extensions::from([("canal".to_string(), serde_json::json!("tienda"))]),
        })
    }

    fn applied(outcome: ApplyOutcome) -> SyncableRecord {
        match outcome {
            ApplyOutcome::Applied(r) => r,
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sqlite_create_update_conflict() {
        let ledger = SqliteLedger::open_memory().unwrap();
        let tenant = TenantId::new("t1");

        let created = applied(
            ledger
                .apply_mutation(
                    &tenant,
                    EntityKind::Pedido,
                    RecordWrite::Create {
                        payload: pedido(1, 2),
                        dedupe: None,
                    },
                )
                .await
                .unwrap(),
        );
        assert_eq!(created.version, Version::FIRST);

        let updated = applied(
            ledger
                .apply_mutation(
                    &tenant,
                    EntityKind::Pedido,
                    RecordWrite::Update {
                        server_id: created.server_id,
                        expected: Version(1),
                        payload: pedido(1, 5),
                    },
                )
                .await
                .unwrap(),
        );
        assert_eq!(updated.version, Version(2));
        assert!(updated.change_seq > created.change_seq);

        let stale = ledger
            .apply_mutation(
                &tenant,
                EntityKind::Pedido,
                RecordWrite::Update {
                    server_id: created.server_id,
                    expected: Version(1),
                    payload: pedido(1, 7),
                },
            )
            .await
            .unwrap();
        assert_eq!(stale, ApplyOutcome::VersionConflict(updated.clone()));

        let stored = ledger
            .get_record(&tenant, EntityKind::Pedido, created.server_id)
            .await
            .unwrap();
        assert_eq!(stored, Some(updated));
    }

    #[tokio::test]
    async fn test_sqlite_dedupe_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let tenant = TenantId::new("t1");
        let key = DedupeKey::new(tenant.clone(), DeviceId::new("d1"), LocalId::new("L1"));
        let write = RecordWrite::Create {
            payload: pedido(1, 1),
            dedupe: Some(key.clone()),
        };

        let first = {
            let ledger = SqliteLedger::open(&path).unwrap();
            applied(
                ledger
                    .apply_mutation(&tenant, EntityKind::Pedido, write.clone())
                    .await
                    .unwrap(),
            )
        };

        let ledger = SqliteLedger::open(&path).unwrap();
        let replay = ledger
            .apply_mutation(&tenant, EntityKind::Pedido, write)
            .await
            .unwrap();
        assert_eq!(replay, ApplyOutcome::Replayed(first.clone()));

        let mapping = ledger.lookup(&key).await.unwrap().unwrap();
        assert_eq!(mapping.server_id, first.server_id);
        assert_eq!(mapping.entity_kind, EntityKind::Pedido);

        let mappings = ledger
            .device_mappings(&tenant, &DeviceId::new("d1"))
            .await
            .unwrap();
        assert_eq!(mappings, vec![mapping]);
    }

    #[tokio::test]
    async fn test_sqlite_first_server_id_and_changes_order() {
        let ledger = SqliteLedger::open_memory_with(LedgerConfig { first_server_id: 101 }).unwrap();
        let tenant = TenantId::new("t1");

        let mut ids = Vec::new();
        for cantidad in 1..=3 {
            let record = applied(
                ledger
                    .apply_mutation(
                        &tenant,
                        EntityKind::Pedido,
                        RecordWrite::Create {
                            payload: pedido(1, cantidad),
                            dedupe: None,
                        },
                    )
                    .await
                    .unwrap(),
            );
            ids.push(record.server_id);
        }
        assert_eq!(ids, vec![ServerId(101), ServerId(102), ServerId(103)]);

        let head = ledger.head(&tenant).await.unwrap();
        assert_eq!(head, Watermark(3));

        let all = ledger
            .records_since(&tenant, EntityKind::Pedido, None, head, 2)
            .collect_all()
            .await
            .unwrap();
        let seqs: Vec<u64> = all.iter().map(|r| r.change_seq.0).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(all[0].payload, pedido(1, 1));
    }

    #[tokio::test]
    async fn test_sqlite_soft_delete_visible_only_in_delta() {
        let ledger = SqliteLedger::open_memory().unwrap();
        let tenant = TenantId::new("t1");
        let created = applied(
            ledger
                .apply_mutation(
                    &tenant,
                    EntityKind::Pedido,
                    RecordWrite::Create {
                        payload: pedido(1, 1),
                        dedupe: None,
                    },
                )
                .await
                .unwrap(),
        );
        let deleted = applied(
            ledger
                .apply_mutation(
                    &tenant,
                    EntityKind::Pedido,
                    RecordWrite::Delete {
                        server_id: created.server_id,
                        expected: Version(1),
                    },
                )
                .await
                .unwrap(),
        );
        let head = ledger.head(&tenant).await.unwrap();

        let full = ledger
            .records_since(&tenant, EntityKind::Pedido, None, head, 10)
            .collect_all()
            .await
            .unwrap();
        assert!(full.is_empty());

        let delta = ledger
            .records_since(&tenant, EntityKind::Pedido, Some(created.change_seq), head, 10)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(delta, vec![deleted]);
    }
}
