//! In-Memory Storage Implementation
//!
//! Provides an in-memory document store for testing and dry runs.
//! Data is lost when the process exits.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::traits::{DocumentStore, StorageResult, WriteIntent};

/// In-memory document store
///
/// Same write semantics as the file store (empty-write refusal, serialized
/// writers) without touching the filesystem. Counts writes so tests can
/// assert how many times a caller persisted.
pub struct MemoryDocumentStore<D> {
    /// Current document set
    documents: RwLock<Vec<D>>,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
    /// Number of successful writes
    writes: AtomicUsize,
}

impl<D: Clone> MemoryDocumentStore<D> {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::with_documents(Vec::new())
    }

    /// Create a store pre-populated with documents
    pub fn with_documents(documents: Vec<D>) -> Self {
        Self {
            documents: RwLock::new(documents),
            write_lock: Mutex::new(()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Replace the contents without counting a write (simulates an external writer)
    pub fn replace_external(&self, documents: Vec<D>) {
        *self.documents.write() = documents;
    }

    fn write_locked(&self, documents: Vec<D>, allow_empty: bool) -> bool {
        let mut current = self.documents.write();
        if documents.is_empty() && !allow_empty && !current.is_empty() {
            return false;
        }

        *current = documents;
        self.writes.fetch_add(1, Ordering::SeqCst);
        true
    }
}

impl<D: Clone> Default for MemoryDocumentStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> DocumentStore<D> for MemoryDocumentStore<D>
where
    D: Clone + Send + Sync,
{
    fn load(&self) -> StorageResult<Vec<D>> {
        Ok(self.documents.read().clone())
    }

    fn save(&self, documents: &[D], allow_empty: bool) -> StorageResult<bool> {
        let _guard = self.write_lock.lock();
        Ok(self.write_locked(documents.to_vec(), allow_empty))
    }

    fn update(&self, mutate: &mut dyn FnMut(&mut Vec<D>) -> WriteIntent) -> StorageResult<bool> {
        let _guard = self.write_lock.lock();
        let mut documents = self.documents.read().clone();

        Ok(match mutate(&mut documents) {
            WriteIntent::Skip => false,
            WriteIntent::Save => self.write_locked(documents, false),
            WriteIntent::SaveAllowEmpty => self.write_locked(documents, true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let store = MemoryDocumentStore::new();
        assert!(store.save(&[1u32, 2, 3], false).unwrap());
        assert_eq!(store.load().unwrap(), vec![1, 2, 3]);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_empty_write_refusal() {
        let store = MemoryDocumentStore::with_documents(vec![1u32]);
        assert!(!store.save(&[], false).unwrap());
        assert_eq!(store.load().unwrap(), vec![1]);
        assert_eq!(store.write_count(), 0);

        assert!(store.save(&[], true).unwrap());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_update_skip_does_not_write() {
        let store = MemoryDocumentStore::with_documents(vec![1u32]);
        let written = store
            .update(&mut |docs| {
                docs.push(2);
                WriteIntent::Skip
            })
            .unwrap();

        assert!(!written);
        assert_eq!(store.load().unwrap(), vec![1]);
    }
}
