//! Persistence hooks.
//!
//! Databases and blob stores stay outside the hub; documents reach them
//! through exactly two calls — load and store — plus optional unload
//! notifications:
//!
//! ```text
//! registry miss ──► load_document(name) ──► snapshot | updates
//! persist timer ──► store_document(name, bytes)
//! idle unload   ──► before_unload(name) … after_unload(name)
//! ```
//!
//! [`MemoryStorage`] is the in-process backend used by tests and by servers
//! run without a configured database: it keeps one append-only update log
//! per document name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;

/// What a load produced: either one snapshot blob or an ordered update log.
/// Each is imported into a fresh replica in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Snapshot(Vec<u8>),
    Updates(Vec<Vec<u8>>),
}

impl DocumentSource {
    /// The blobs to import, in order.
    pub fn into_blobs(self) -> Vec<Vec<u8>> {
        match self {
            DocumentSource::Snapshot(snapshot) => vec![snapshot],
            DocumentSource::Updates(updates) => updates,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            DocumentSource::Snapshot(snapshot) => snapshot.is_empty(),
            DocumentSource::Updates(updates) => updates.is_empty(),
        }
    }
}

/// Storage hook failures.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// The backend failed; the message is backend-specific.
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Backend(e) => write!(f, "storage backend error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// The persistence contract. Implementations are shared across documents
/// and must be safe to call concurrently for different names.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the persisted state for `name`. A document that was never
    /// stored returns an empty update list.
    async fn load_document(&self, name: &str) -> Result<DocumentSource, StorageError>;

    /// Append one update blob for `name`.
    async fn store_document(&self, name: &str, update: &[u8]) -> Result<(), StorageError>;

    /// Called before a document is evicted from the registry.
    async fn before_unload(&self, _name: &str) {}

    /// Called after a document has been evicted from the registry.
    async fn after_unload(&self, _name: &str) {}
}

/// In-memory storage: one update log per document name.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    logs: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored update blobs for `name`.
    pub fn log_len(&self, name: &str) -> usize {
        self.logs
            .lock()
            .unwrap()
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Names with at least one stored blob.
    pub fn document_names(&self) -> Vec<String> {
        self.logs.lock().unwrap().keys().cloned().collect()
    }

    /// Replace the update log for `name` with a single snapshot blob.
    pub fn compact(&self, name: &str, snapshot: Vec<u8>) {
        self.logs
            .lock()
            .unwrap()
            .insert(name.to_owned(), vec![snapshot]);
    }

    /// Drop everything stored for `name`.
    pub fn remove(&self, name: &str) {
        self.logs.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_document(&self, name: &str) -> Result<DocumentSource, StorageError> {
        let logs = self.logs.lock().unwrap();
        Ok(DocumentSource::Updates(
            logs.get(name).cloned().unwrap_or_default(),
        ))
    }

    async fn store_document(&self, name: &str, update: &[u8]) -> Result<(), StorageError> {
        self.logs
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(storage
            .load_document("missing")
            .await
            .unwrap()
            .is_empty());

        storage.store_document("doc", &[1, 2]).await.unwrap();
        storage.store_document("doc", &[3]).await.unwrap();

        let source = storage.load_document("doc").await.unwrap();
        assert_eq!(
            source,
            DocumentSource::Updates(vec![vec![1, 2], vec![3]])
        );
        assert_eq!(storage.log_len("doc"), 2);
    }

    #[tokio::test]
    async fn test_memory_storage_isolated_by_name() {
        let storage = MemoryStorage::new();
        storage.store_document("a", &[1]).await.unwrap();
        storage.store_document("b", &[2]).await.unwrap();

        assert_eq!(storage.log_len("a"), 1);
        assert_eq!(storage.log_len("b"), 1);
        let mut names = storage.document_names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_memory_storage_compact() {
        let storage = MemoryStorage::new();
        for i in 0..5u8 {
            storage.store_document("doc", &[i]).await.unwrap();
        }
        storage.compact("doc", vec![0xAA]);
        assert_eq!(storage.log_len("doc"), 1);
        assert_eq!(
            storage.load_document("doc").await.unwrap(),
            DocumentSource::Updates(vec![vec![0xAA]])
        );
    }

    #[test]
    fn test_document_source_blobs() {
        let snapshot = DocumentSource::Snapshot(vec![1, 2, 3]);
        assert_eq!(snapshot.into_blobs(), vec![vec![1, 2, 3]]);

        let updates = DocumentSource::Updates(vec![vec![1], vec![2]]);
        assert_eq!(updates.into_blobs(), vec![vec![1], vec![2]]);

        assert!(DocumentSource::Updates(Vec::new()).is_empty());
        assert!(DocumentSource::Snapshot(Vec::new()).is_empty());
        assert!(!DocumentSource::Snapshot(vec![0]).is_empty());
    }
}
