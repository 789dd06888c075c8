//! Database schema and migrations

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// Migrations run in one `IMMEDIATE` transaction and the version is read
/// inside it, so processes initializing the same file apply each step once.
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let version: i32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        migrate_v1(&tx)?;
    }
    if version < 2 {
        migrate_v2(&tx)?;
    }

    tx.commit()?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- One row per idempotency key ever reserved
        CREATE TABLE IF NOT EXISTS idempotency (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_key TEXT NOT NULL,
            device_id TEXT NOT NULL,
            capability TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('accepted', 'completed', 'failed')),
            result_json TEXT,
            UNIQUE(idempotency_key)
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Terminal transition timestamp
        ALTER TABLE idempotency ADD COLUMN completed_at TEXT;

        CREATE INDEX IF NOT EXISTS idx_idempotency_status ON idempotency(status);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (completion timestamps)");
    Ok(())
}
