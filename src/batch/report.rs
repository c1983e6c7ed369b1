//! Batch run bookkeeping: stop signal, progress events and the final report

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag shared between the caller and a run
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop dispatching
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How one item settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded,
    Failed,
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Emitted after every item settles, on the worker thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Items settled so far, this one included
    pub completed: usize,
    pub total: usize,
    /// Natural key of the item
    pub key: String,
    pub outcome: ItemOutcome,
}

/// A failed item and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub key: String,
    pub reason: String,
}

/// Summary of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Correlation id of the run
    pub job_id: String,
    pub operation: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Not dispatched because of a stop request
    pub skipped: usize,
    /// Successes folded into the store
    pub merged: usize,
    /// Successes whose record was removed during the run
    pub unmatched: usize,
    pub duplicates_removed: usize,
    pub failed_items: Vec<FailedItem>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl BatchReport {
    pub(crate) fn new(job_id: impl Into<String>, operation: impl Into<String>, total: usize) -> Self {
        Self {
            job_id: job_id.into(),
            operation: operation.into(),
            total,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            merged: 0,
            unmatched: 0,
            duplicates_removed: 0,
            failed_items: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Every item settled and none failed
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

fn serialize_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} total | succeeded: {} | failed: {} | skipped: {} | merged: {} | {:.1}s",
            self.operation,
            self.total,
            self.succeeded,
            self.failed,
            self.skipped,
            self.merged,
            self.elapsed.as_secs_f64()
        )?;
        if self.unmatched > 0 {
            write!(f, " | unmatched: {}", self.unmatched)?;
        }
        Ok(())
    }
}
