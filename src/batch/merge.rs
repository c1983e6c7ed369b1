//! Merge-back reconciliation
//!
//! Folds the successes of a batch run into a freshly reloaded document set:
//! collapse duplicates by natural key, then apply each success's patch to the
//! record it belongs to. Records changed by other writers during the run are
//! kept as reloaded; only the patched fields change.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use crate::storage::{DocumentStore, StorageResult, WriteIntent};

/// Identity and recency of a stored record
pub trait MergeKey {
    /// Authoritative identity, when known
    fn stable_id(&self) -> Option<&str>;

    /// Secondary identity, unique within a store after reconciliation
    fn natural_key(&self) -> String;

    /// Last modification
    fn updated_at(&self) -> DateTime<Utc>;

    /// Stamp a modification
    fn touch(&mut self, at: DateTime<Utc>);
}

/// Fields a worker wants set on the record it processed
pub trait RecordPatch<R> {
    fn apply(&self, record: &mut R);
}

/// Identity of a batch item, captured before dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    pub stable_id: Option<String>,
    pub natural_key: String,
}

impl RecordIdentity {
    pub fn of<R: MergeKey>(record: &R) -> Self {
        Self {
            stable_id: record.stable_id().map(str::to_string),
            natural_key: record.natural_key(),
        }
    }

    /// Position of the matching record: stable id first, then natural key
    pub fn locate<R: MergeKey>(&self, records: &[R]) -> Option<usize> {
        self.stable_id
            .as_deref()
            .and_then(|id| records.iter().position(|r| r.stable_id() == Some(id)))
            .or_else(|| {
                records
                    .iter()
                    .position(|r| r.natural_key() == self.natural_key)
            })
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.natural_key)
    }
}

/// What a merge-back did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Successes applied to a record
    pub merged: usize,
    /// Successes whose record no longer exists
    pub unmatched: usize,
    /// Records dropped as duplicates
    pub duplicates_removed: usize,
    /// Whether the store was written
    pub persisted: bool,
}

/// Collapse records sharing a natural key, keeping the most recently updated
/// one (the later entry on a tie) at the first entry's position.
///
/// Returns the number of records removed.
pub fn dedupe<R: MergeKey>(records: &mut Vec<R>) -> usize {
    let before = records.len();
    let mut index: HashMap<String, usize> = HashMap::with_capacity(before);
    let mut kept: Vec<R> = Vec::with_capacity(before);

    for record in records.drain(..) {
        let key = record.natural_key();
        match index.get(&key) {
            Some(&position) => {
                if record.updated_at() >= kept[position].updated_at() {
                    kept[position] = record;
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(record);
            }
        }
    }

    *records = kept;
    before - records.len()
}

/// Dedupe `records` and apply every patch; does not persist
pub fn reconcile<R, P>(
    records: &mut Vec<R>,
    successes: &[(RecordIdentity, P)],
    now: DateTime<Utc>,
) -> MergeOutcome
where
    R: MergeKey,
    P: RecordPatch<R>,
{
    let mut outcome = MergeOutcome {
        duplicates_removed: dedupe(records),
        ..MergeOutcome::default()
    };

    for (identity, patch) in successes {
        match identity.locate(records) {
            Some(position) => {
                let record = &mut records[position];
                patch.apply(record);
                record.touch(now);
                outcome.merged += 1;
            }
            None => {
                tracing::warn!(
                    target: "fleet::batch",
                    item = %identity,
                    "Record removed during the run; result not merged"
                );
                outcome.unmatched += 1;
            }
        }
    }

    outcome
}

/// Reload, reconcile and persist once, under the store's writer lock.
///
/// Nothing is written when there is nothing to merge and no duplicate to
/// collapse.
pub fn merge_back<R, P>(
    store: &dyn DocumentStore<R>,
    successes: &[(RecordIdentity, P)],
    now: DateTime<Utc>,
) -> StorageResult<MergeOutcome>
where
    R: MergeKey,
    P: RecordPatch<R>,
{
    let mut outcome = MergeOutcome::default();
    let persisted = store.update(&mut |records| {
        outcome = reconcile(records, successes, now);
        if outcome.merged > 0 || outcome.duplicates_removed > 0 {
            WriteIntent::Save
        } else {
            WriteIntent::Skip
        }
    })?;

    outcome.persisted = persisted;
    Ok(outcome)
}
