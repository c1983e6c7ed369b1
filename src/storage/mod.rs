//! Storage Layer Module
//!
//! Provides persistence for accounts, the resource pool and settings.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - Crash-safe file store for production
//! - In-memory implementation for testing

pub mod file;
pub mod memory;
pub mod traits;

// Re-exports for convenience
pub use file::{CrashSafeStore, DocumentLayout};
pub use memory::MemoryDocumentStore;
pub use traits::{DocumentStore, StorageError, StorageResult, WriteIntent};
