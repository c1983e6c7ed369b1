//! Resource Pool
//!
//! Concurrent-safe allocation of pooled payment resources.

pub mod allocator;
pub mod lock;

pub use allocator::{ImportSummary, PoolError, PoolSummary, ResourceLease, ResourcePoolAllocator};
pub use lock::{AllocationLock, LockRegistry};
