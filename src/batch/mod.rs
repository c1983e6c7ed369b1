//! Batch Jobs
//!
//! Generic orchestration for bulk per-account operations:
//! - `orchestrator` - Bounded worker pool with cooperative cancellation
//! - `merge` - Reconciled merge-back into the document store
//! - `report` - Stop signal, progress events and run summary

pub mod merge;
pub mod orchestrator;
pub mod report;

pub use merge::{dedupe, merge_back, reconcile, MergeKey, MergeOutcome, RecordIdentity, RecordPatch};
pub use orchestrator::{BatchError, BatchOrchestrator};
pub use report::{BatchReport, FailedItem, ItemOutcome, ProgressEvent, StopSignal};
