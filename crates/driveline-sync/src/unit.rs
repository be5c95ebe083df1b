//! Synchronization units: the independently-trackable log streams.
//!
//! A unit is one (drive, document, scope, branch) stream. Units are derived
//! on demand by walking drive listings, never persisted separately; only
//! their ids must stay stable across revisions so listener cursors remain
//! valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use driveline_core::{
    drive_state, DocumentId, DriveId, Scope, DRIVE_DOCUMENT_TYPE, MAIN_BRANCH,
};
use driveline_store::DocumentStore;

use crate::error::{Result, SyncError};

/// A 32-byte synchronization unit identifier.
///
/// Derived from Blake3(document_id || scope), so it is independent of the
/// stream's revision.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncUnitId(pub [u8; 32]);

impl SyncUnitId {
    /// Derive a unit id from a document id and scope.
    pub fn derive(document_id: &DocumentId, scope: Scope) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"driveline-sync-unit-v0:");
        hasher.update(document_id.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(scope.as_str().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SyncUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncUnitId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for SyncUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// One independently-trackable log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizationUnit {
    /// Stable identifier, independent of revision.
    pub sync_id: SyncUnitId,
    pub drive_id: DriveId,
    pub document_id: DocumentId,
    pub scope: Scope,
    pub branch: String,
    pub document_type: String,
    /// Index of the last accepted operation, -1 when empty.
    pub revision: i64,
    /// Last accepted write (Unix ms).
    pub last_updated: i64,
}

/// Optional coordinates restricting a unit query.
#[derive(Debug, Clone, Default)]
pub struct UnitQuery {
    pub document_id: Option<DocumentId>,
    pub scope: Option<Scope>,
    pub branch: Option<String>,
}

impl UnitQuery {
    fn accepts(&self, unit: &SynchronizationUnit) -> bool {
        self.document_id
            .as_ref()
            .map(|id| id == &unit.document_id)
            .unwrap_or(true)
            && self.scope.map(|s| s == unit.scope).unwrap_or(true)
            && self
                .branch
                .as_ref()
                .map(|b| b == &unit.branch)
                .unwrap_or(true)
    }
}

/// Derives synchronization units from the current state of drives.
///
/// Recomputed on demand; the listener registry caches last-seen revisions
/// per unit, never the unit list itself.
#[derive(Clone)]
pub struct SyncUnitIndex {
    store: Arc<dyn DocumentStore>,
}

impl SyncUnitIndex {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Units of one drive: the drive's own scopes plus one unit per scope of
    /// every file node in its listing, all on branch "main".
    pub async fn drive_units(&self, drive_id: &DriveId) -> Result<Vec<SynchronizationUnit>> {
        let drive = self.store.get_drive(drive_id).await?;
        let mut units = Vec::new();

        let drive_doc_id = DocumentId::new(drive_id.as_str());
        for scope in Scope::ALL {
            units.push(SynchronizationUnit {
                sync_id: SyncUnitId::derive(&drive_doc_id, scope),
                drive_id: drive_id.clone(),
                document_id: drive_doc_id.clone(),
                scope,
                branch: MAIN_BRANCH.to_string(),
                document_type: DRIVE_DOCUMENT_TYPE.to_string(),
                revision: drive.revision(scope),
                last_updated: drive.header.last_modified_at,
            });
        }

        let state = drive_state(&drive).map_err(|e| SyncError::InvalidDrive(e.to_string()))?;
        for node in state.file_nodes() {
            let driveline_core::Node::File {
                id, document_type, ..
            } = node
            else {
                continue;
            };
            let document = match self.store.get_document(drive_id, id).await {
                Ok(document) => document,
                Err(driveline_store::StoreError::NotFound(_)) => {
                    // Listed but not yet materialized; no stream to track.
                    tracing::warn!(drive = %drive_id, document = %id, "file node without document");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            for scope in Scope::ALL {
                units.push(SynchronizationUnit {
                    sync_id: SyncUnitId::derive(id, scope),
                    drive_id: drive_id.clone(),
                    document_id: id.clone(),
                    scope,
                    branch: MAIN_BRANCH.to_string(),
                    document_type: document_type.clone(),
                    revision: document.revision(scope),
                    last_updated: document.header.last_modified_at,
                });
            }
        }

        Ok(units)
    }

    /// Units across one drive (or all drives), optionally narrowed.
    pub async fn units(
        &self,
        drive_id: Option<&DriveId>,
        query: &UnitQuery,
    ) -> Result<Vec<SynchronizationUnit>> {
        let drive_ids = match drive_id {
            Some(id) => vec![id.clone()],
            None => self.store.get_drives().await?,
        };

        let mut units = Vec::new();
        for id in &drive_ids {
            units.extend(
                self.drive_units(id)
                    .await?
                    .into_iter()
                    .filter(|u| query.accepts(u)),
            );
        }
        Ok(units)
    }
}
