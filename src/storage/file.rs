//! Crash-safe File Store
//!
//! Each store owns three sibling files:
//!
//! ```text
//! accounts.json       primary copy
//! accounts.json.bak   snapshot of the previous primary
//! accounts.json.tmp   staging file, only present during a write
//! ```
//!
//! A write goes `stage → fsync → read back → snapshot primary → rename`, so a
//! reader only ever sees a complete old or complete new primary. Writers
//! serialize on one mutex per store; stores opened over the same file share
//! it through [`CrashSafeStore::with_write_lock`]. Readers take no lock.

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::traits::{DocumentStore, StorageError, StorageResult, WriteIntent};
use crate::common::logging::log_store_event;

/// On-disk shape of a document set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentLayout {
    /// Top-level JSON array
    Array,
    /// `{"<key>": [...], "metadata": {...}}`
    Wrapped { key: &'static str },
    /// A single JSON object (or `null` when empty)
    Single,
}

/// Result of reading one copy of the store
enum ReadOutcome<D> {
    Missing,
    Parsed(Vec<D>),
    Unreadable(String),
}

/// Atomic document store with backup/restore
pub struct CrashSafeStore<D> {
    primary: PathBuf,
    backup: PathBuf,
    staging: PathBuf,
    layout: DocumentLayout,
    write_lock: Arc<Mutex<()>>,
    _marker: PhantomData<fn() -> D>,
}

impl<D> CrashSafeStore<D>
where
    D: Serialize + DeserializeOwned,
{
    /// Create a store rooted at `path` with the given layout
    pub fn new(path: impl AsRef<Path>, layout: DocumentLayout) -> Self {
        let primary = path.as_ref().to_path_buf();
        Self {
            backup: sibling(&primary, ".bak"),
            staging: sibling(&primary, ".tmp"),
            primary,
            layout,
            write_lock: Arc::new(Mutex::new(())),
            _marker: PhantomData,
        }
    }

    /// Store holding a top-level array
    pub fn array(path: impl AsRef<Path>) -> Self {
        Self::new(path, DocumentLayout::Array)
    }

    /// Store holding `{"<key>": [...], "metadata": {...}}`
    pub fn wrapped(path: impl AsRef<Path>, key: &'static str) -> Self {
        Self::new(path, DocumentLayout::Wrapped { key })
    }

    /// Store holding at most one document
    pub fn single(path: impl AsRef<Path>) -> Self {
        Self::new(path, DocumentLayout::Single)
    }

    /// Serialize writes with every other store holding `lock`
    pub fn with_write_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.write_lock = lock;
        self
    }

    /// Path of the primary copy
    pub fn path(&self) -> &Path {
        &self.primary
    }

    /// Path of the backup snapshot
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    fn decode(&self, bytes: &[u8]) -> StorageResult<Vec<D>> {
        match self.layout {
            DocumentLayout::Array => Ok(serde_json::from_slice(bytes)?),
            DocumentLayout::Wrapped { key } => {
                let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
                let items = value
                    .get_mut(key)
                    .map(serde_json::Value::take)
                    .ok_or_else(|| StorageError::Layout(format!("missing \"{}\" field", key)))?;
                Ok(serde_json::from_value(items)?)
            }
            DocumentLayout::Single => {
                Ok(serde_json::from_slice::<Option<D>>(bytes)?.into_iter().collect())
            }
        }
    }

    fn encode(&self, documents: &[D]) -> StorageResult<Vec<u8>> {
        let value = match self.layout {
            DocumentLayout::Array => serde_json::to_value(documents)?,
            DocumentLayout::Wrapped { key } => {
                let mut object = serde_json::Map::new();
                object.insert(key.to_string(), serde_json::to_value(documents)?);
                object.insert(
                    "metadata".to_string(),
                    serde_json::json!({
                        "updated_at": Utc::now().to_rfc3339(),
                        "count": documents.len()
                    }),
                );
                serde_json::Value::Object(object)
            }
            DocumentLayout::Single => {
                if documents.len() > 1 {
                    return Err(StorageError::Layout(format!(
                        "single-document store given {} documents",
                        documents.len()
                    )));
                }
                serde_json::to_value(documents.first())?
            }
        };

        Ok(serde_json::to_vec_pretty(&value)?)
    }

    fn read_copy(&self, path: &Path) -> ReadOutcome<D> {
        match fs::read(path) {
            Ok(bytes) => match self.decode(&bytes) {
                Ok(documents) => ReadOutcome::Parsed(documents),
                Err(e) => ReadOutcome::Unreadable(e.to_string()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => ReadOutcome::Missing,
            Err(e) => ReadOutcome::Unreadable(e.to_string()),
        }
    }

    /// Read the primary, falling back to the backup.
    ///
    /// The flag is true when the backup was substituted and the primary needs
    /// repair.
    fn read_current(&self) -> StorageResult<(Vec<D>, bool)> {
        let primary = match self.read_copy(&self.primary) {
            ReadOutcome::Parsed(documents) => return Ok((documents, false)),
            other => other,
        };
        let primary_missing = matches!(primary, ReadOutcome::Missing);

        match self.read_copy(&self.backup) {
            ReadOutcome::Parsed(documents) => {
                let reason = match primary {
                    ReadOutcome::Unreadable(reason) => reason,
                    _ => "primary copy missing".to_string(),
                };
                let corrupt = StorageError::Corrupt {
                    path: self.primary.clone(),
                    reason,
                };
                log_store_event(
                    "backup_promoted",
                    &self.primary.display().to_string(),
                    &corrupt.to_string(),
                );
                Ok((documents, true))
            }
            // First run: nothing written yet
            ReadOutcome::Missing if primary_missing => Ok((Vec::new(), false)),
            _ => Err(StorageError::Unrecoverable {
                primary: self.primary.clone(),
                backup: self.backup.clone(),
            }),
        }
    }

    /// Rewrite the primary from the promoted backup. Caller holds the write lock.
    fn repair_locked(&self, documents: &[D]) {
        let result = self
            .encode(documents)
            .and_then(|bytes| self.stage(&bytes))
            .and_then(|_| fs::rename(&self.staging, &self.primary).map_err(StorageError::from));

        match result {
            Ok(()) => {
                self.sync_parent();
                tracing::info!(path = %self.primary.display(), "Repaired primary from backup");
            }
            Err(e) => {
                let _ = fs::remove_file(&self.staging);
                tracing::warn!(path = %self.primary.display(), error = %e, "Primary repair failed");
            }
        }
    }

    fn stage(&self, bytes: &[u8]) -> StorageResult<()> {
        if let Some(parent) = self.staging.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(&self.staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn validate_staged(&self, documents: &[D]) -> StorageResult<()> {
        let bytes = fs::read(&self.staging)?;
        let decoded = self
            .decode(&bytes)
            .map_err(|e| StorageError::Validation(e.to_string()))?;

        if serde_json::to_value(&decoded)? != serde_json::to_value(documents)? {
            return Err(StorageError::Validation(
                "staged documents differ from the documents written".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy the current primary into the backup slot, only if it parses
    fn snapshot_primary(&self) -> StorageResult<()> {
        if !matches!(self.read_copy(&self.primary), ReadOutcome::Parsed(_)) {
            return Ok(());
        }

        let backup_staging = sibling(&self.backup, ".tmp");
        fs::copy(&self.primary, &backup_staging)?;
        File::open(&backup_staging)?.sync_all()?;
        fs::rename(&backup_staging, &self.backup)?;
        Ok(())
    }

    #[cfg(unix)]
    fn sync_parent(&self) {
        if let Some(parent) = self.primary.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                tracing::debug!(error = %e, "Directory sync failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) {}

    fn write_locked(&self, documents: &[D], allow_empty: bool) -> StorageResult<bool> {
        if documents.is_empty() && !allow_empty {
            let holds_documents = match self.read_current() {
                Ok((existing, _)) => !existing.is_empty(),
                Err(_) => true,
            };
            if holds_documents {
                log_store_event(
                    "empty_write_refused",
                    &self.primary.display().to_string(),
                    "refusing to replace a non-empty store with an empty document set",
                );
                return Ok(false);
            }
        }

        let bytes = self.encode(documents)?;
        if let Err(e) = self.stage(&bytes).and_then(|_| self.validate_staged(documents)) {
            let _ = fs::remove_file(&self.staging);
            return Err(e);
        }

        self.snapshot_primary()?;
        fs::rename(&self.staging, &self.primary)?;
        self.sync_parent();

        tracing::debug!(
            path = %self.primary.display(),
            count = documents.len(),
            "Saved document store"
        );

        Ok(true)
    }
}

impl<D> DocumentStore<D> for CrashSafeStore<D>
where
    D: Serialize + DeserializeOwned,
{
    fn load(&self) -> StorageResult<Vec<D>> {
        let (documents, needs_repair) = self.read_current()?;

        if needs_repair {
            let _guard = self.write_lock.lock();
            // Another writer may have fixed it meanwhile
            if !matches!(self.read_copy(&self.primary), ReadOutcome::Parsed(_)) {
                self.repair_locked(&documents);
            }
        }

        Ok(documents)
    }

    fn save(&self, documents: &[D], allow_empty: bool) -> StorageResult<bool> {
        let _guard = self.write_lock.lock();
        self.write_locked(documents, allow_empty)
    }

    fn update(&self, mutate: &mut dyn FnMut(&mut Vec<D>) -> WriteIntent) -> StorageResult<bool> {
        let _guard = self.write_lock.lock();

        let (mut documents, needs_repair) = self.read_current()?;
        if needs_repair {
            self.repair_locked(&documents);
        }

        match mutate(&mut documents) {
            WriteIntent::Skip => Ok(false),
            WriteIntent::Save => self.write_locked(&documents, false),
            WriteIntent::SaveAllowEmpty => self.write_locked(&documents, true),
        }
    }
}

/// `accounts.json` + `.bak` -> `accounts.json.bak`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
