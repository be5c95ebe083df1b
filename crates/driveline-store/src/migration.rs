//! Database schema migrations for SQLite.
//!
//! Simple versioned migrations: each migration transforms the schema from
//! version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// Idempotent - safe to call multiple times.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, driveline_core::now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Documents table: drives and child documents alike
        CREATE TABLE documents (
            drive_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            is_drive INTEGER NOT NULL DEFAULT 0,   -- 1 for the drive's own row
            document_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_modified_at INTEGER NOT NULL,
            initial_state BLOB NOT NULL,           -- CBOR map scope -> value
            state BLOB NOT NULL,                   -- CBOR map scope -> value

            PRIMARY KEY (drive_id, document_id)
        );

        -- Operation logs, one row per accepted operation
        CREATE TABLE operations (
            drive_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            scope TEXT NOT NULL,
            branch TEXT NOT NULL,
            idx INTEGER NOT NULL,
            skip INTEGER NOT NULL DEFAULT 0,
            kind TEXT NOT NULL,
            input BLOB NOT NULL,                   -- CBOR value
            hash BLOB NOT NULL,                    -- 32 bytes, Blake3 state digest
            timestamp INTEGER NOT NULL,

            PRIMARY KEY (drive_id, document_id, scope, branch, idx)
        );

        -- Indexes for common queries
        CREATE INDEX idx_documents_drive ON documents(drive_id, is_drive);
        CREATE INDEX idx_operations_log ON operations(drive_id, document_id, scope, branch, idx);
        "#,
    )?;

    Ok(())
}
