//! account-fleet - Account Fleet Management Core
//!
//! Manages many accounts of a third-party service: trades long-lived
//! artifacts for session credentials, hands out exhaustible payment
//! resources, and runs bulk per-account operations with crash-safe
//! persistence.
//!
//! ## Components
//!
//! 1. **Storage** - Crash-safe JSON document stores with backup/restore
//! 2. **Pool** - Lock-protected resource allocation with release-on-failure
//! 3. **Exchange** - PKCE begin/poll handshake and credential refresh
//! 4. **Batch** - Bounded worker pool with reconciled merge-back
//! 5. **Registry** - Account identity resolution and de-duplication
//!
//! ## Wiring
//!
//! The binary builds one [`FleetContext`] from [`FleetConfig`] and hands it
//! to every command; nothing is process-global.

pub mod batch;
pub mod common;
pub mod context;
pub mod exchange;
pub mod operations;
pub mod pool;
pub mod registry;
pub mod storage;
pub mod types;

// Re-exports: Common
pub use common::{FleetConfig, FleetError, Result, Settings};

// Re-exports: Context
pub use context::FleetContext;

// Re-exports: Storage
pub use storage::{CrashSafeStore, DocumentLayout, DocumentStore, MemoryDocumentStore, StorageError};

// Re-exports: Pool
pub use pool::{AllocationLock, LockRegistry, PoolError, PoolSummary, ResourceLease, ResourcePoolAllocator};

// Re-exports: Exchange
pub use exchange::{
    CredentialExchangeClient, ExchangeError, ExchangeTransport, HttpExchangeTransport, PollPolicy,
    SessionCredentials,
};

// Re-exports: Batch
pub use batch::{BatchError, BatchOrchestrator, BatchReport, ProgressEvent, StopSignal};

// Re-exports: Registry
pub use registry::{AccountRegistry, RegistryError};

// Re-exports: Operations
pub use operations::{BindOutcome, BindingAgent, CommandBindingAgent, Operation};

// Re-exports: Types
pub use types::{Account, AccountFlag, AccountPatch, Resource, ResourceState, SessionArtifact};
