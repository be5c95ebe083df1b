//! In-memory implementation of the DocumentStore trait.
//!
//! Primarily for testing. Same semantics as SQLite but nothing persists
//! past the store's lifetime.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use driveline_core::{Document, DocumentId, DriveId, Operation};

use crate::error::{Result, StoreError};
use crate::traits::DocumentStore;

/// In-memory store. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Drive documents by id.
    drives: BTreeMap<DriveId, Document>,

    /// Child documents, keyed by drive then document id.
    documents: BTreeMap<DriveId, BTreeMap<DocumentId, Document>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryStoreInner> {
        self.inner.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryStoreInner> {
        self.inner.write().expect("store lock poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_drive(&self, id: &DriveId) -> Result<Document> {
        self.read()
            .drives
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("drive {id}")))
    }

    async fn get_drives(&self) -> Result<Vec<DriveId>> {
        Ok(self.read().drives.keys().cloned().collect())
    }

    async fn create_drive(&self, id: &DriveId, document: Document) -> Result<()> {
        let mut inner = self.write();
        if inner.drives.contains_key(id) {
            return Err(StoreError::AlreadyExists(format!("drive {id}")));
        }
        inner.drives.insert(id.clone(), document);
        inner.documents.entry(id.clone()).or_default();
        Ok(())
    }

    async fn delete_drive(&self, id: &DriveId) -> Result<()> {
        let mut inner = self.write();
        if inner.drives.remove(id).is_none() {
            return Err(StoreError::NotFound(format!("drive {id}")));
        }
        inner.documents.remove(id);
        Ok(())
    }

    async fn add_drive_operations(
        &self,
        id: &DriveId,
        _operations: &[Operation],
        document: &Document,
    ) -> Result<()> {
        let mut inner = self.write();
        match inner.drives.get_mut(id) {
            Some(stored) => {
                *stored = document.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("drive {id}"))),
        }
    }

    async fn get_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<Document> {
        self.read()
            .documents
            .get(drive_id)
            .ok_or_else(|| StoreError::NotFound(format!("drive {drive_id}")))?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("document {drive_id}/{id}")))
    }

    async fn get_documents(&self, drive_id: &DriveId) -> Result<Vec<DocumentId>> {
        Ok(self
            .read()
            .documents
            .get(drive_id)
            .ok_or_else(|| StoreError::NotFound(format!("drive {drive_id}")))?
            .keys()
            .cloned()
            .collect())
    }

    async fn create_document(
        &self,
        drive_id: &DriveId,
        id: &DocumentId,
        document: Document,
    ) -> Result<()> {
        let mut inner = self.write();
        let documents = inner
            .documents
            .get_mut(drive_id)
            .ok_or_else(|| StoreError::NotFound(format!("drive {drive_id}")))?;
        if documents.contains_key(id) {
            return Err(StoreError::AlreadyExists(format!(
                "document {drive_id}/{id}"
            )));
        }
        documents.insert(id.clone(), document);
        Ok(())
    }

    async fn delete_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<()> {
        let mut inner = self.write();
        let documents = inner
            .documents
            .get_mut(drive_id)
            .ok_or_else(|| StoreError::NotFound(format!("drive {drive_id}")))?;
        if documents.remove(id).is_none() {
            return Err(StoreError::NotFound(format!("document {drive_id}/{id}")));
        }
        Ok(())
    }

    async fn add_document_operations(
        &self,
        drive_id: &DriveId,
        id: &DocumentId,
        _operations: &[Operation],
        document: &Document,
    ) -> Result<()> {
        let mut inner = self.write();
        let documents = inner
            .documents
            .get_mut(drive_id)
            .ok_or_else(|| StoreError::NotFound(format!("drive {drive_id}")))?;
        match documents.get_mut(id) {
            Some(stored) => {
                *stored = document.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("document {drive_id}/{id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driveline_core::{new_drive, Scope};
    use serde_json::json;

    fn make_drive(id: &str) -> (DriveId, Document) {
        let drive_id = DriveId::new(id);
        let document = new_drive(&drive_id, "Test", 1000);
        (drive_id, document)
    }

    #[tokio::test]
    async fn test_drive_lifecycle() {
        let store = MemoryStore::new();
        let (drive_id, document) = make_drive("d1");

        store.create_drive(&drive_id, document.clone()).await.unwrap();
        assert_eq!(store.get_drives().await.unwrap(), vec![drive_id.clone()]);
        assert_eq!(store.get_drive(&drive_id).await.unwrap(), document);

        let err = store.create_drive(&drive_id, document).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        store.delete_drive(&drive_id).await.unwrap();
        assert!(store.get_drive(&drive_id).await.is_err());
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let store = MemoryStore::new();
        let (drive_id, drive) = make_drive("d1");
        store.create_drive(&drive_id, drive).await.unwrap();

        let doc_id = DocumentId::new("doc-1");
        let document = Document::new(doc_id.clone(), "test/counter", json!({"count": 0}), 1000);
        store
            .create_document(&drive_id, &doc_id, document.clone())
            .await
            .unwrap();

        let fetched = store.get_document(&drive_id, &doc_id).await.unwrap();
        assert_eq!(fetched.revision(Scope::Global), -1);

        store.delete_document(&drive_id, &doc_id).await.unwrap();
        let err = store.delete_document(&drive_id, &doc_id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_drive_drops_documents() {
        let store = MemoryStore::new();
        let (drive_id, drive) = make_drive("d1");
        store.create_drive(&drive_id, drive).await.unwrap();

        let doc_id = DocumentId::new("doc-1");
        let document = Document::new(doc_id.clone(), "test/counter", json!({}), 1000);
        store
            .create_document(&drive_id, &doc_id, document)
            .await
            .unwrap();

        store.delete_drive(&drive_id).await.unwrap();
        assert!(store.get_document(&drive_id, &doc_id).await.is_err());
    }
}
