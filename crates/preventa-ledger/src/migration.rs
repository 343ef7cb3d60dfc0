//! SQLite schema migrations.
//!
//! Migrations are an ordered list of SQL batches. `MIGRATIONS[i]` takes the
//! schema from version `i` to `i + 1`; the applied version is recorded in
//! `schema_migrations`, so opening an existing ledger only runs what is new.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{LedgerError, Result};

/// Ordered schema steps.
const MIGRATIONS: &[&str] = &[
    // v1: records, tenant clocks, dedupe bindings
    r#"
    CREATE TABLE records (
        tenant_id TEXT NOT NULL,
        server_id INTEGER NOT NULL,        -- unique across tenants
        entity_kind TEXT NOT NULL,
        local_id TEXT,                     -- local id of the originating create
        version INTEGER NOT NULL,          -- +1 per successful write
        change_seq INTEGER NOT NULL,       -- tenant clock value of the last write
        updated_at INTEGER NOT NULL,       -- server time of the last write (Unix ms)
        is_deleted INTEGER NOT NULL DEFAULT 0,
        fingerprint BLOB NOT NULL,         -- 32 bytes, Blake3 of payload CBOR
        payload BLOB NOT NULL,             -- CBOR-encoded RecordPayload
        PRIMARY KEY (tenant_id, server_id)
    );

    CREATE TABLE tenant_clock (
        tenant_id TEXT PRIMARY KEY,
        change_seq INTEGER NOT NULL
    );

    CREATE TABLE id_map (
        tenant_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        local_id TEXT NOT NULL,
        entity_kind TEXT NOT NULL,
        server_id INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, device_id, local_id)
    );

    CREATE UNIQUE INDEX idx_records_server_id ON records(server_id);
    CREATE INDEX idx_records_changes ON records(tenant_id, entity_kind, change_seq);
    "#,
    // v2: device binding listing
    r#"
    CREATE INDEX idx_id_map_device ON id_map(tenant_id, device_id, server_id);
    "#,
];

/// Schema version after all migrations.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )?;

    let applied = schema_version(conn)?;
    if applied > CURRENT_VERSION {
        return Err(LedgerError::Migration(format!(
            "ledger schema v{applied} is newer than this build (v{CURRENT_VERSION})"
        )));
    }
    if applied == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
        let version = step as u32 + 1;
        tx.execute_batch(sql)
            .map_err(|e| LedgerError::Migration(format!("v{version}: {e}")))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, preventa_core::now_millis()],
        )?;
    }
    tx.commit()?;

    tracing::debug!(from = applied, to = CURRENT_VERSION, "ledger schema migrated");
    Ok(())
}

/// Highest applied migration, zero for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}
