//! Batch job orchestrator
//!
//! Fans a list of records out to a blocking per-item worker with bounded
//! concurrency, then folds the successes back into the store in one write.
//!
//! # Flow:
//! 1. For each item: wait for a worker slot, check the stop signal, dispatch
//! 2. Each worker runs on a blocking thread; errors and panics become failed items
//! 3. Progress fires after every item settles
//! 4. After all dispatched items settle: one reconciled merge-back

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::merge::{merge_back, MergeKey, RecordIdentity, RecordPatch};
use super::report::{BatchReport, FailedItem, ItemOutcome, ProgressEvent, StopSignal};
use crate::common::logging::{generate_correlation_id, log_batch_finished, log_batch_started};
use crate::storage::{DocumentStore, StorageError};

/// Batch run errors
///
/// Per-item failures are never errors; only the merge-back can fail a run.
/// Both variants carry the report computed before the failure.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("merge-back failed: {source}")]
    MergeBack {
        report: Box<BatchReport>,
        #[source]
        source: StorageError,
    },

    #[error("merge-back aborted: {reason}")]
    MergeAborted {
        report: Box<BatchReport>,
        reason: String,
    },
}

impl BatchError {
    /// Item outcomes of the run that failed to merge
    pub fn report(&self) -> &BatchReport {
        match self {
            BatchError::MergeBack { report, .. } | BatchError::MergeAborted { report, .. } => report,
        }
    }
}

/// Bounded-concurrency fan-out/fan-in over records of one store
pub struct BatchOrchestrator<R> {
    operation: String,
    store: Arc<dyn DocumentStore<R>>,
}

impl<R> BatchOrchestrator<R>
where
    R: MergeKey + Send + 'static,
{
    pub fn new(operation: impl Into<String>, store: Arc<dyn DocumentStore<R>>) -> Self {
        Self {
            operation: operation.into(),
            store,
        }
    }

    /// Run `worker` over `items` with at most `max_concurrency` in flight.
    ///
    /// `stop` is checked right before each dispatch; items not dispatched
    /// once it is set are counted as skipped.
    pub async fn run<P, W, F>(
        &self,
        items: Vec<R>,
        worker: W,
        max_concurrency: usize,
        progress: F,
        stop: &StopSignal,
    ) -> Result<BatchReport, BatchError>
    where
        P: RecordPatch<R> + Send + 'static,
        W: Fn(&R) -> crate::Result<P> + Send + Sync + 'static,
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let started = Instant::now();
        let job_id = generate_correlation_id();
        let total = items.len();
        let concurrency = max_concurrency.min(total).max(1);
        let mut report = BatchReport::new(&job_id, &self.operation, total);

        log_batch_started(&self.operation, &job_id, total, concurrency);

        let worker = Arc::new(worker);
        let progress = Arc::new(progress);
        let completed = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        let mut pending = items.into_iter();
        while let Some(item) = pending.next() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    report.skipped = 1 + pending.len();
                    break;
                }
            };
            if stop.is_stopped() {
                report.skipped = 1 + pending.len();
                tracing::info!(
                    target: "fleet::batch",
                    job_id = %job_id,
                    skipped = report.skipped,
                    "Stop requested; remaining items skipped"
                );
                break;
            }

            let identity = RecordIdentity::of(&item);
            let worker = worker.clone();
            let progress = progress.clone();
            let completed = completed.clone();

            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = match catch_unwind(AssertUnwindSafe(|| worker(&item))) {
                    Ok(Ok(patch)) => Ok(patch),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => Err(format!("worker panicked: {}", panic_message(payload))),
                };

                let event = ProgressEvent {
                    completed: completed.fetch_add(1, Ordering::SeqCst) + 1,
                    total,
                    key: identity.natural_key.clone(),
                    outcome: match result {
                        Ok(_) => ItemOutcome::Succeeded,
                        Err(_) => ItemOutcome::Failed,
                    },
                };
                if catch_unwind(AssertUnwindSafe(|| progress(&event))).is_err() {
                    tracing::warn!(target: "fleet::batch", item = %identity, "Progress callback panicked");
                }

                (identity, result)
            });
        }

        let mut successes: Vec<(RecordIdentity, P)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((identity, Ok(patch))) => {
                    report.succeeded += 1;
                    successes.push((identity, patch));
                }
                Ok((identity, Err(reason))) => {
                    tracing::warn!(
                        target: "fleet::batch",
                        job_id = %job_id,
                        item = %identity,
                        error = %reason,
                        "Item failed"
                    );
                    report.failed += 1;
                    report.failed_items.push(FailedItem {
                        key: identity.natural_key,
                        reason,
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    report.failed_items.push(FailedItem {
                        key: "<unknown>".to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let store = self.store.clone();
        let merged = tokio::task::spawn_blocking(move || {
            merge_back(store.as_ref(), &successes, chrono::Utc::now())
        })
        .await;

        let finish = |mut report: BatchReport| {
            report.elapsed = started.elapsed();
            log_batch_finished(
                &report.operation,
                &report.job_id,
                report.succeeded,
                report.failed,
                report.skipped,
                report.elapsed.as_millis() as u64,
            );
            report
        };

        match merged {
            Ok(Ok(outcome)) => {
                report.merged = outcome.merged;
                report.unmatched = outcome.unmatched;
                report.duplicates_removed = outcome.duplicates_removed;
                Ok(finish(report))
            }
            Ok(Err(source)) => {
                tracing::error!(target: "fleet::batch", job_id = %job_id, error = %source, "Merge-back failed");
                Err(BatchError::MergeBack {
                    report: Box::new(finish(report)),
                    source,
                })
            }
            Err(e) => Err(BatchError::MergeAborted {
                report: Box::new(finish(report)),
                reason: e.to_string(),
            }),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::FleetError;
    use crate::storage::{MemoryDocumentStore, StorageResult, WriteIntent};
    use crate::types::account::{Account, AccountFlag, AccountPatch};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn accounts(n: usize) -> Vec<Account> {
        (0..n)
            .map(|i| Account::new(format!("user{}@example.com", i)))
            .collect()
    }

    fn bound_patch() -> AccountPatch {
        AccountPatch::default().with_flag(AccountFlag::PaymentBound, true)
    }

    fn setup(n: usize) -> (Arc<MemoryDocumentStore<Account>>, BatchOrchestrator<Account>) {
        let store = Arc::new(MemoryDocumentStore::with_documents(accounts(n)));
        let orchestrator = BatchOrchestrator::new("test", store.clone() as Arc<dyn DocumentStore<Account>>);
        (store, orchestrator)
    }

    struct FailingStore;

    impl DocumentStore<Account> for FailingStore {
        fn load(&self) -> StorageResult<Vec<Account>> {
            Ok(accounts(3))
        }

        fn save(&self, _: &[Account], _: bool) -> StorageResult<bool> {
            Err(StorageError::Validation("disk full".into()))
        }

        fn update(&self, _: &mut dyn FnMut(&mut Vec<Account>) -> WriteIntent) -> StorageResult<bool> {
            Err(StorageError::Validation("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_failures_counted_and_successes_merged_once() {
        let (store, orchestrator) = setup(10);
        let failing: HashSet<String> = ["user2@example.com", "user5@example.com", "user7@example.com"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let report = orchestrator
            .run(
                accounts(10),
                move |account: &Account| {
                    if failing.contains(&account.email) {
                        Err(FleetError::validation("rejected"))
                    } else {
                        Ok(bound_patch())
                    }
                },
                4,
                |_| {},
                &StopSignal::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.total, 10);
        assert_eq!(report.succeeded, 7);
        assert_eq!(report.failed, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.merged, 7);
        assert_eq!(report.failed_items.len(), 3);
        assert!(report.failed_items.iter().all(|f| f.reason.contains("rejected")));

        let stored = store.load().unwrap();
        assert_eq!(stored.len(), 10);
        assert_eq!(stored.iter().filter(|a| a.has_flag(AccountFlag::PaymentBound)).count(), 7);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_progress_fires_per_settled_item() {
        let (_store, orchestrator) = setup(6);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        orchestrator
            .run(
                accounts(6),
                |account: &Account| {
                    if account.email.starts_with("user0") {
                        Err(FleetError::internal("boom"))
                    } else {
                        Ok(bound_patch())
                    }
                },
                3,
                move |event: &ProgressEvent| sink.lock().push(event.clone()),
                &StopSignal::new(),
            )
            .await
            .unwrap();

        let events = events.lock();
        let mut completed: Vec<usize> = events.iter().map(|e| e.completed).collect();
        completed.sort_unstable();
        assert_eq!(completed, vec![1, 2, 3, 4, 5, 6]);
        assert!(events.iter().all(|e| e.total == 6));
        assert_eq!(
            events.iter().filter(|e| e.outcome == ItemOutcome::Failed).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_before_start_skips_everything() {
        let (store, orchestrator) = setup(5);
        let stop = StopSignal::new();
        stop.stop();

        let report = orchestrator
            .run(
                accounts(5),
                |_: &Account| -> crate::Result<AccountPatch> { panic!("must not run") },
                2,
                |_| panic!("no progress for skipped items"),
                &stop,
            )
            .await
            .unwrap();

        assert_eq!(report.skipped, 5);
        assert_eq!(report.succeeded + report.failed, 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_mid_run_lets_in_flight_items_finish() {
        let (_store, orchestrator) = setup(5);
        let stop = StopSignal::new();
        let trip = stop.clone();

        let report = orchestrator
            .run(
                accounts(5),
                move |_: &Account| {
                    trip.stop();
                    Ok(bound_patch())
                },
                1,
                |_| {},
                &stop,
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 4);
        assert_eq!(report.merged, 1);
    }

    #[tokio::test]
    async fn test_panicking_worker_does_not_abort_siblings() {
        let (_store, orchestrator) = setup(4);

        let report = orchestrator
            .run(
                accounts(4),
                |account: &Account| {
                    if account.email == "user1@example.com" {
                        panic!("worker exploded");
                    }
                    Ok(bound_patch())
                },
                4,
                |_| {},
                &StopSignal::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_items[0].key, "user1@example.com");
        assert!(report.failed_items[0].reason.contains("worker exploded"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (_store, orchestrator) = setup(12);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (now, max) = (in_flight.clone(), peak.clone());

        orchestrator
            .run(
                accounts(12),
                move |_: &Account| {
                    let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(current, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    now.fetch_sub(1, Ordering::SeqCst);
                    Ok(bound_patch())
                },
                3,
                |_| {},
                &StopSignal::new(),
            )
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_concurrent_external_writes_survive_merge() {
        let (store, orchestrator) = setup(3);
        let external = store.clone();
        let written = Arc::new(AtomicBool::new(false));

        let report = orchestrator
            .run(
                accounts(3),
                move |_: &Account| {
                    if !written.swap(true, Ordering::SeqCst) {
                        let mut current = external.load()?;
                        current.push(Account::new("added-during-run@example.com"));
                        current[0].long_credential = Some("edited::elsewhere".into());
                        external.replace_external(current);
                    }
                    Ok(bound_patch())
                },
                1,
                |_| {},
                &StopSignal::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.merged, 3);
        let stored = store.load().unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().any(|a| a.email == "added-during-run@example.com"));
        assert_eq!(stored[0].long_credential.as_deref(), Some("edited::elsewhere"));
        assert!(stored[0].has_flag(AccountFlag::PaymentBound));
    }

    #[tokio::test]
    async fn test_removed_record_is_not_resurrected() {
        let (store, orchestrator) = setup(2);
        let external = store.clone();

        let report = orchestrator
            .run(
                accounts(2),
                move |account: &Account| {
                    if account.email == "user1@example.com" {
                        external.replace_external(accounts(1));
                    }
                    Ok(bound_patch())
                },
                1,
                |_| {},
                &StopSignal::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.merged, 1);
        assert_eq!(report.unmatched, 1);
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_collapsed_during_merge() {
        let mut seeded = accounts(2);
        seeded.push(Account::new("USER0@example.com"));
        let store = Arc::new(MemoryDocumentStore::with_documents(seeded));
        let orchestrator = BatchOrchestrator::new("test", store.clone() as Arc<dyn DocumentStore<Account>>);

        let report = orchestrator
            .run(accounts(2), |_: &Account| Ok(bound_patch()), 2, |_| {}, &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(report.duplicates_removed, 1);
        let stored = store.load().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|a| a.has_flag(AccountFlag::PaymentBound)));
    }

    #[tokio::test]
    async fn test_merge_failure_returns_report() {
        let orchestrator: BatchOrchestrator<Account> =
            BatchOrchestrator::new("test", Arc::new(FailingStore));

        let err = orchestrator
            .run(accounts(3), |_: &Account| Ok(bound_patch()), 2, |_| {}, &StopSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::MergeBack { .. }));
        assert_eq!(err.report().succeeded, 3);
        assert_eq!(err.report().merged, 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (store, orchestrator) = setup(2);
        let report = orchestrator
            .run(Vec::new(), |_: &Account| Ok(bound_patch()), 10, |_| {}, &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(report.total, 0);
        assert!(report.is_clean());
        assert_eq!(store.write_count(), 0);
    }
}
