//! SQLite implementation of the DocumentStore trait.
//!
//! The primary persistent backend. Uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use driveline_core::{
    Document, DocumentHeader, DocumentId, DriveId, Operation, Scope, StateHash, MAIN_BRANCH,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::DocumentStore;

/// SQLite-based store.
///
/// Thread-safe via internal Mutex; all trait methods run on the blocking
/// pool so the async runtime is never stalled by disk I/O.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database. Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Internal(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("spawn_blocking failed: {e}")))?
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Row/blob codecs
// ─────────────────────────────────────────────────────────────────────────

fn encode_cbor<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

type ScopedStates = BTreeMap<Scope, serde_json::Value>;

fn row_to_operation(row: &rusqlite::Row<'_>) -> Result<Operation> {
    let scope_str: String = row.get("scope").map_err(StoreError::from)?;
    let scope: Scope = scope_str
        .parse()
        .map_err(|_| StoreError::InvalidData(format!("unknown scope: {scope_str}")))?;

    let input_cbor: Vec<u8> = row.get("input").map_err(StoreError::from)?;
    let hash_bytes: Vec<u8> = row.get("hash").map_err(StoreError::from)?;
    let hash = StateHash::from_bytes(
        hash_bytes
            .try_into()
            .map_err(|_| StoreError::InvalidData("hash is not 32 bytes".to_string()))?,
    );

    Ok(Operation {
        index: row.get::<_, i64>("idx").map_err(StoreError::from)? as u64,
        skip: row.get::<_, i64>("skip").map_err(StoreError::from)? as u64,
        kind: row.get("kind").map_err(StoreError::from)?,
        input: decode_cbor(&input_cbor)?,
        hash,
        timestamp: row.get("timestamp").map_err(StoreError::from)?,
        scope,
        branch: row.get("branch").map_err(StoreError::from)?,
    })
}

fn load_document(
    conn: &Connection,
    drive_id: &DriveId,
    document_id: &DocumentId,
) -> Result<Option<Document>> {
    let header = conn
        .query_row(
            "SELECT document_type, created_at, last_modified_at, initial_state, state
             FROM documents WHERE drive_id = ?1 AND document_id = ?2",
            params![drive_id.as_str(), document_id.as_str()],
            |row| {
                let document_type: String = row.get(0)?;
                let created_at: i64 = row.get(1)?;
                let last_modified_at: i64 = row.get(2)?;
                let initial_state: Vec<u8> = row.get(3)?;
                let state: Vec<u8> = row.get(4)?;
                Ok((document_type, created_at, last_modified_at, initial_state, state))
            },
        )
        .optional()?;

    let Some((document_type, created_at, last_modified_at, initial_blob, state_blob)) = header
    else {
        return Ok(None);
    };

    let initial_state: ScopedStates = decode_cbor(&initial_blob)?;
    let state: ScopedStates = decode_cbor(&state_blob)?;

    let mut operations: BTreeMap<Scope, Vec<Operation>> =
        Scope::ALL.iter().map(|&s| (s, Vec::new())).collect();

    let mut stmt = conn.prepare(
        "SELECT scope, branch, idx, skip, kind, input, hash, timestamp
         FROM operations
         WHERE drive_id = ?1 AND document_id = ?2 AND branch = ?3
         ORDER BY scope, idx",
    )?;
    let mut rows = stmt.query(params![drive_id.as_str(), document_id.as_str(), MAIN_BRANCH])?;
    while let Some(row) = rows.next()? {
        let op = row_to_operation(row)?;
        operations.entry(op.scope).or_default().push(op);
    }

    Ok(Some(Document {
        header: DocumentHeader {
            id: document_id.clone(),
            document_type,
            created_at,
            last_modified_at,
        },
        initial_state,
        state,
        operations,
    }))
}

fn insert_document(
    conn: &Connection,
    drive_id: &DriveId,
    document_id: &DocumentId,
    is_drive: bool,
    document: &Document,
) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (
            drive_id, document_id, is_drive, document_type,
            created_at, last_modified_at, initial_state, state
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            drive_id.as_str(),
            document_id.as_str(),
            is_drive as i64,
            document.header.document_type,
            document.header.created_at,
            document.header.last_modified_at,
            encode_cbor(&document.initial_state)?,
            encode_cbor(&document.state)?,
        ],
    )?;

    // Documents may be seeded with pre-existing logs (copies, replication).
    for ops in document.operations.values() {
        store_operations(conn, drive_id, document_id, ops)?;
    }
    Ok(())
}

/// Upsert: a collapsing no-op replaces the row at its own index.
fn store_operations(
    conn: &Connection,
    drive_id: &DriveId,
    document_id: &DocumentId,
    operations: &[Operation],
) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO operations (
            drive_id, document_id, scope, branch, idx,
            skip, kind, input, hash, timestamp
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    for op in operations {
        stmt.execute(params![
            drive_id.as_str(),
            document_id.as_str(),
            op.scope.as_str(),
            op.branch,
            op.index as i64,
            op.skip as i64,
            op.kind,
            encode_cbor(&op.input)?,
            op.hash.as_bytes().as_slice(),
            op.timestamp,
        ])?;
    }
    Ok(())
}

fn append_operations(
    conn: &mut Connection,
    drive_id: &DriveId,
    document_id: &DocumentId,
    operations: &[Operation],
    document: &Document,
) -> Result<()> {
    let tx = conn.transaction()?;

    let updated = tx.execute(
        "UPDATE documents SET last_modified_at = ?3, state = ?4
         WHERE drive_id = ?1 AND document_id = ?2",
        params![
            drive_id.as_str(),
            document_id.as_str(),
            document.header.last_modified_at,
            encode_cbor(&document.state)?,
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!(
            "document {drive_id}/{document_id}"
        )));
    }

    store_operations(&tx, drive_id, document_id, operations)?;
    tx.commit()?;
    Ok(())
}

fn drive_exists(conn: &Connection, drive_id: &DriveId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM documents WHERE drive_id = ?1 AND document_id = ?1 AND is_drive = 1",
            params![drive_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_drive(&self, id: &DriveId) -> Result<Document> {
        let id = id.clone();
        self.blocking(move |conn| {
            load_document(conn, &id, &DocumentId::new(id.as_str()))?
                .ok_or_else(|| StoreError::NotFound(format!("drive {id}")))
        })
        .await
    }

    async fn get_drives(&self) -> Result<Vec<DriveId>> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT drive_id FROM documents WHERE is_drive = 1 ORDER BY drive_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(DriveId::new).collect())
        })
        .await
    }

    async fn create_drive(&self, id: &DriveId, document: Document) -> Result<()> {
        let id = id.clone();
        self.blocking(move |conn| {
            if drive_exists(conn, &id)? {
                return Err(StoreError::AlreadyExists(format!("drive {id}")));
            }
            let tx = conn.transaction()?;
            insert_document(&tx, &id, &DocumentId::new(id.as_str()), true, &document)?;
            tx.commit()?;
            tracing::debug!(drive = %id, "created drive");
            Ok(())
        })
        .await
    }

    async fn delete_drive(&self, id: &DriveId) -> Result<()> {
        let id = id.clone();
        self.blocking(move |conn| {
            if !drive_exists(conn, &id)? {
                return Err(StoreError::NotFound(format!("drive {id}")));
            }
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM operations WHERE drive_id = ?1",
                params![id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM documents WHERE drive_id = ?1",
                params![id.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn add_drive_operations(
        &self,
        id: &DriveId,
        operations: &[Operation],
        document: &Document,
    ) -> Result<()> {
        let id = id.clone();
        let operations = operations.to_vec();
        let document = document.clone();
        self.blocking(move |conn| {
            append_operations(
                conn,
                &id,
                &DocumentId::new(id.as_str()),
                &operations,
                &document,
            )
        })
        .await
    }

    async fn get_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<Document> {
        let drive_id = drive_id.clone();
        let id = id.clone();
        self.blocking(move |conn| {
            load_document(conn, &drive_id, &id)?
                .ok_or_else(|| StoreError::NotFound(format!("document {drive_id}/{id}")))
        })
        .await
    }

    async fn get_documents(&self, drive_id: &DriveId) -> Result<Vec<DocumentId>> {
        let drive_id = drive_id.clone();
        self.blocking(move |conn| {
            if !drive_exists(conn, &drive_id)? {
                return Err(StoreError::NotFound(format!("drive {drive_id}")));
            }
            let mut stmt = conn.prepare(
                "SELECT document_id FROM documents
                 WHERE drive_id = ?1 AND is_drive = 0 ORDER BY document_id",
            )?;
            let ids = stmt
                .query_map(params![drive_id.as_str()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(DocumentId::new).collect())
        })
        .await
    }

    async fn create_document(
        &self,
        drive_id: &DriveId,
        id: &DocumentId,
        document: Document,
    ) -> Result<()> {
        let drive_id = drive_id.clone();
        let id = id.clone();
        self.blocking(move |conn| {
            if !drive_exists(conn, &drive_id)? {
                return Err(StoreError::NotFound(format!("drive {drive_id}")));
            }
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM documents WHERE drive_id = ?1 AND document_id = ?2",
                    params![drive_id.as_str(), id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "document {drive_id}/{id}"
                )));
            }
            let tx = conn.transaction()?;
            insert_document(&tx, &drive_id, &id, false, &document)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<()> {
        let drive_id = drive_id.clone();
        let id = id.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM operations WHERE drive_id = ?1 AND document_id = ?2",
                params![drive_id.as_str(), id.as_str()],
            )?;
            let deleted = tx.execute(
                "DELETE FROM documents WHERE drive_id = ?1 AND document_id = ?2 AND is_drive = 0",
                params![drive_id.as_str(), id.as_str()],
            )?;
            tx.commit()?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("document {drive_id}/{id}")));
            }
            Ok(())
        })
        .await
    }

    async fn add_document_operations(
        &self,
        drive_id: &DriveId,
        id: &DocumentId,
        operations: &[Operation],
        document: &Document,
    ) -> Result<()> {
        let drive_id = drive_id.clone();
        let id = id.clone();
        let operations = operations.to_vec();
        let document = document.clone();
        self.blocking(move |conn| append_operations(conn, &drive_id, &id, &operations, &document))
            .await
    }
}
