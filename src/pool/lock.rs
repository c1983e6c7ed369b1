//! Process-wide locks keyed by file path.
//!
//! The allocation lock is always injected at construction. [`LockRegistry`]
//! hands out the same instance for the same pool path, and the same store
//! writer mutex for the same document path. The entry point builds one
//! registry and every context in the process clones it, so allocators and
//! stores opened over one data directory never race on a document.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Process-local lock serializing every pool read-modify-write
#[derive(Clone)]
pub struct AllocationLock {
    inner: Arc<Mutex<()>>,
}

impl AllocationLock {
    /// Create a fresh lock. Prefer [`LockRegistry::lock_for`] when the pool
    /// lives on disk.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
        }
    }

    /// Block until the lock is held
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }

    /// Whether two handles guard the same pool
    pub fn same_as(&self, other: &AllocationLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for AllocationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationLock")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

/// One allocation lock per pool file and one writer mutex per store file.
///
/// Clones share the same maps.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    allocation: Arc<Mutex<HashMap<PathBuf, AllocationLock>>>,
    writers: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared allocation lock for `path`, created on first request
    pub fn lock_for(&self, path: &Path) -> AllocationLock {
        self.allocation
            .lock()
            .entry(lock_key(path))
            .or_default()
            .clone()
    }

    /// The shared writer mutex for the store at `path`
    pub fn write_lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.writers
            .lock()
            .entry(lock_key(path))
            .or_default()
            .clone()
    }
}

/// Canonical key for a pool path; the file itself may not exist yet
fn lock_key(path: &Path) -> PathBuf {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    match (parent.and_then(|p| p.canonicalize().ok()), path.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}
