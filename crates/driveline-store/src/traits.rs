//! DocumentStore trait: the abstract interface for document persistence.
//!
//! This trait keeps the engine storage-agnostic. Backends include SQLite
//! (primary) and in-memory (for tests); others (filesystem, remote) are
//! interchangeable implementations of the same contract.

use async_trait::async_trait;
use driveline_core::{Document, DocumentId, DriveId, Operation};

use crate::error::Result;

/// Async interface for drive and document persistence.
///
/// # Design Notes
///
/// - **Drives are documents**: a drive is stored as a document addressed by
///   its own id; the drive-level methods manage the container lifecycle.
/// - **Append is transactional**: `add_*_operations` persists the accepted
///   operations together with the post-batch document (header, states,
///   revisions) or not at all.
/// - **Cascade is the caller's job**: `delete_drive` drops the drive's
///   stored documents; emitting per-document cleanup (listener cursors,
///   sync units) is driven by the engine on top.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────
    // Drive Operations
    // ─────────────────────────────────────────────────────────────────────

    /// Fetch a drive document by id.
    async fn get_drive(&self, id: &DriveId) -> Result<Document>;

    /// List all drive ids.
    async fn get_drives(&self) -> Result<Vec<DriveId>>;

    /// Create a drive from its initial document.
    ///
    /// Fails with `AlreadyExists` if the drive id is taken.
    async fn create_drive(&self, id: &DriveId, document: Document) -> Result<()>;

    /// Delete a drive and all documents stored under it.
    async fn delete_drive(&self, id: &DriveId) -> Result<()>;

    /// Append accepted operations to a drive's logs, persisting the updated
    /// document alongside.
    async fn add_drive_operations(
        &self,
        id: &DriveId,
        operations: &[Operation],
        document: &Document,
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Document Operations
    // ─────────────────────────────────────────────────────────────────────

    /// Fetch a document by drive and id.
    async fn get_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<Document>;

    /// List the ids of all documents stored under a drive.
    async fn get_documents(&self, drive_id: &DriveId) -> Result<Vec<DocumentId>>;

    /// Create a document under a drive.
    async fn create_document(
        &self,
        drive_id: &DriveId,
        id: &DocumentId,
        document: Document,
    ) -> Result<()>;

    /// Delete a document from a drive. Fails with `NotFound` if absent.
    async fn delete_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<()>;

    /// Append accepted operations to a document's logs, persisting the
    /// updated document alongside.
    async fn add_document_operations(
        &self,
        drive_id: &DriveId,
        id: &DocumentId,
        operations: &[Operation],
        document: &Document,
    ) -> Result<()>;
}
