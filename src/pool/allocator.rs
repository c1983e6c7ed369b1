//! Resource Pool Allocator
//!
//! Hands out pooled resources one at a time and records how each allocation
//! was settled. Every pool mutation is a read-modify-write of the whole pool
//! document, so all of them run under the injected [`AllocationLock`].
//!
//! ```text
//! available ──allocate──► allocated ──commit──► used
//!     ▲                       │
//!     └──────release──────────┤
//!                             └──retire──► used + problematic
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::lock::AllocationLock;
use crate::common::logging::log_pool_event;
use crate::storage::{DocumentStore, StorageError, WriteIntent};
use crate::types::resource::{Resource, ResourceParseError, ResourceState};

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool storage error: {0}")]
    Storage(#[from] StorageError),

    /// No available resource for a caller that requires one
    #[error("resource pool exhausted")]
    Exhausted,

    #[error("invalid resource on line {line}: {source}")]
    Import {
        line: usize,
        #[source]
        source: ResourceParseError,
    },
}

/// How an allocation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Used,
    Problematic,
    Released,
}

impl Settlement {
    fn event(&self) -> &'static str {
        match self {
            Settlement::Used => "resource_used",
            Settlement::Problematic => "resource_retired",
            Settlement::Released => "resource_released",
        }
    }
}

/// Resource pool allocator
pub struct ResourcePoolAllocator {
    /// Pool document store
    store: Arc<dyn DocumentStore<Resource>>,
    /// Lock shared with every other allocator on the same pool
    lock: AllocationLock,
}

impl ResourcePoolAllocator {
    /// Create an allocator over `store`, serialized by `lock`
    pub fn new(store: Arc<dyn DocumentStore<Resource>>, lock: AllocationLock) -> Self {
        Self { store, lock }
    }

    /// The allocation lock this allocator uses
    pub fn lock(&self) -> &AllocationLock {
        &self.lock
    }

    /// Allocate the first available resource in pool order.
    ///
    /// Returns a copy; `None` when the pool is exhausted.
    pub fn allocate_next(&self) -> Result<Option<Resource>, PoolError> {
        let _guard = self.lock.acquire();

        let mut allocated = None;
        self.store.update(&mut |resources| {
            match resources.iter_mut().find(|r| r.is_available()) {
                Some(resource) => {
                    resource.allocated = true;
                    allocated = Some(resource.clone());
                    WriteIntent::Save
                }
                None => WriteIntent::Skip,
            }
        })?;

        match &allocated {
            Some(resource) => {
                log_pool_event("resource_allocated", &resource.masked_identifier(), true, None)
            }
            None => tracing::warn!(target: "fleet::pool", "Resource pool exhausted"),
        }

        Ok(allocated)
    }

    /// Allocate and wrap in a lease that releases on drop
    pub fn lease_next(&self) -> Result<Option<ResourceLease<'_>>, PoolError> {
        Ok(self.allocate_next()?.map(|resource| ResourceLease {
            pool: self,
            resource,
            settled: false,
        }))
    }

    /// `allocated → used`
    pub fn mark_used(&self, resource: &Resource) -> Result<bool, PoolError> {
        self.settle(resource, Settlement::Used)
    }

    /// `allocated → used + problematic`; never reissued afterwards
    pub fn mark_problematic(&self, resource: &Resource) -> Result<bool, PoolError> {
        self.settle(resource, Settlement::Problematic)
    }

    /// `allocated → available`; only for failures before exposure
    pub fn release(&self, resource: &Resource) -> Result<bool, PoolError> {
        self.settle(resource, Settlement::Released)
    }

    /// Returns false (and logs) when the resource is missing or not allocated
    fn settle(&self, resource: &Resource, settlement: Settlement) -> Result<bool, PoolError> {
        let _guard = self.lock.acquire();

        let mut mismatch: Option<String> = None;
        self.store.update(&mut |resources| {
            let Some(stored) = resources
                .iter_mut()
                .find(|r| r.identifier == resource.identifier)
            else {
                mismatch = Some("resource not in pool".to_string());
                return WriteIntent::Skip;
            };

            if stored.state() != ResourceState::Allocated {
                mismatch = Some(format!("expected allocated, found {}", stored.state()));
                return WriteIntent::Skip;
            }

            stored.allocated = false;
            match settlement {
                Settlement::Used => stored.used = true,
                Settlement::Problematic => {
                    stored.used = true;
                    stored.problematic = true;
                }
                Settlement::Released => {}
            }
            WriteIntent::Save
        })?;

        let masked = resource.masked_identifier();
        match mismatch {
            None => {
                log_pool_event(settlement.event(), &masked, true, None);
                Ok(true)
            }
            Some(detail) => {
                log_pool_event(settlement.event(), &masked, false, Some(&detail));
                Ok(false)
            }
        }
    }

    /// Return every non-available resource matching `filter` to `available`
    pub fn reset<F>(&self, filter: F) -> Result<usize, PoolError>
    where
        F: Fn(&Resource) -> bool,
    {
        let _guard = self.lock.acquire();

        let mut count = 0;
        self.store.update(&mut |resources| {
            for resource in resources.iter_mut() {
                if !resource.is_available() && filter(resource) {
                    resource.clear_flags();
                    count += 1;
                }
            }
            if count > 0 {
                WriteIntent::Save
            } else {
                WriteIntent::Skip
            }
        })?;

        tracing::info!(target: "fleet::pool", count, "Reset pool resources");
        Ok(count)
    }

    /// Append resources, skipping identifiers already in the pool
    pub fn import(&self, resources: Vec<Resource>) -> Result<ImportSummary, PoolError> {
        let _guard = self.lock.acquire();

        let mut summary = ImportSummary::default();
        let mut incoming = Some(resources);
        self.store.update(&mut |pool| {
            let mut known: HashSet<String> = pool.iter().map(|r| r.identifier.clone()).collect();
            for resource in incoming.take().unwrap_or_default() {
                if known.insert(resource.identifier.clone()) {
                    pool.push(resource);
                    summary.added += 1;
                } else {
                    summary.duplicates += 1;
                }
            }
            if summary.added > 0 {
                WriteIntent::Save
            } else {
                WriteIntent::Skip
            }
        })?;

        Ok(summary)
    }

    /// Parse `identifier|key=value` lines (blank lines and `#` comments skipped) and import them
    pub fn import_lines(&self, text: &str) -> Result<ImportSummary, PoolError> {
        let mut resources = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let resource = Resource::parse_line(line).map_err(|source| PoolError::Import {
                line: index + 1,
                source,
            })?;
            resources.push(resource);
        }

        self.import(resources)
    }

    /// All resources in pool order
    pub fn list(&self) -> Result<Vec<Resource>, PoolError> {
        Ok(self.store.load()?)
    }

    /// Counts per state
    pub fn summary(&self) -> Result<PoolSummary, PoolError> {
        let resources = self.store.load()?;
        let mut summary = PoolSummary {
            total: resources.len(),
            ..PoolSummary::default()
        };

        for resource in &resources {
            match resource.state() {
                ResourceState::Available => summary.available += 1,
                ResourceState::Allocated => summary.allocated += 1,
                ResourceState::Used => summary.used += 1,
                ResourceState::Problematic => summary.problematic += 1,
            }
        }

        Ok(summary)
    }
}

/// One allocated resource, settled exactly once.
///
/// Dropping an unsettled lease releases the resource, so an early return or
/// panic before exposure never leaks an allocation.
pub struct ResourceLease<'a> {
    pool: &'a ResourcePoolAllocator,
    resource: Resource,
    settled: bool,
}

impl ResourceLease<'_> {
    /// The leased resource
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Confirmed success: mark used
    pub fn commit(mut self) -> Result<bool, PoolError> {
        self.settle(Settlement::Used)
    }

    /// Failed after exposure: mark used + problematic
    pub fn retire(mut self) -> Result<bool, PoolError> {
        self.settle(Settlement::Problematic)
    }

    /// Failed before exposure: make available again
    pub fn release(mut self) -> Result<bool, PoolError> {
        self.settle(Settlement::Released)
    }

    fn settle(&mut self, settlement: Settlement) -> Result<bool, PoolError> {
        // Settled even if persisting fails: a resource that may have been
        // exposed must not fall back to the release-on-drop path
        self.settled = true;
        self.pool.settle(&self.resource, settlement)
    }
}

impl Drop for ResourceLease<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        if let Err(e) = self.pool.settle(&self.resource, Settlement::Released) {
            tracing::error!(
                target: "fleet::pool",
                resource = %self.resource.masked_identifier(),
                error = %e,
                "Failed to release unsettled lease"
            );
        }
    }
}

/// Result of an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub duplicates: usize,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub total: usize,
    pub available: usize,
    pub allocated: usize,
    pub used: usize,
    pub problematic: usize,
}

impl fmt::Display for PoolSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool: {} total | available: {} | allocated: {} | used: {} | problematic: {}",
            self.total, self.available, self.allocated, self.used, self.problematic
        )
    }
}
