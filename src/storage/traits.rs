//! Storage Trait Definitions
//!
//! Defines the document store interface shared by the account, pool and
//! settings stores. Implementations can use the crash-safe file store
//! (production) or the in-memory store (testing).

use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Primary copy unreadable; the backup was substituted
    #[error("store corrupt at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Primary and backup are both unreadable
    #[error("store unrecoverable: {primary} and backup {backup} are both unreadable")]
    Unrecoverable { primary: PathBuf, backup: PathBuf },

    /// Staged file did not read back as written
    #[error("staged write failed validation: {0}")]
    Validation(String),

    /// Document set does not fit the store layout
    #[error("layout error: {0}")]
    Layout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// What a read-modify-write closure wants done with the mutated set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    /// Leave the store untouched
    Skip,
    /// Persist, refusing to empty a non-empty store
    Save,
    /// Persist even if the result is empty
    SaveAllowEmpty,
}

/// Document store interface
///
/// Implementations:
/// - `CrashSafeStore` - Atomic file store with backup/restore
/// - `MemoryDocumentStore` - In-memory storage for testing
pub trait DocumentStore<D>: Send + Sync {
    /// Load every document
    fn load(&self) -> StorageResult<Vec<D>>;

    /// Replace the whole document set.
    ///
    /// Returns `Ok(false)` without writing when `documents` is empty, the
    /// store currently holds documents and `allow_empty` is false.
    fn save(&self, documents: &[D], allow_empty: bool) -> StorageResult<bool>;

    /// Read-modify-write under the store's writer lock.
    ///
    /// Returns whether anything was persisted.
    fn update(&self, mutate: &mut dyn FnMut(&mut Vec<D>) -> WriteIntent) -> StorageResult<bool>;
}
