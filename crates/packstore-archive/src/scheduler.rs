//! Background compaction.
//!
//! One scheduler runs per process. Every `interval` it asks the coordinator
//! for the local host's tasks that have been dirty for at least `min_age` and
//! compacts them on a bounded pool of blocking workers. Each compaction holds
//! the same path lock as live requests.

use crate::coordinator::CompactionTask;
use crate::error::{StoreError, StoreResult};
use crate::service::{ArchiveStore, unix_now};
use futures::stream::{self, StreamExt};
use packstore_common::config::CompactionConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What happened to one task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Archive rewritten and task removed
    Compacted { reclaimed: bool },
    /// Archive no longer exists; task removed
    Stale,
    /// Lock busy, archive held elsewhere, or shutting down; retried next pass
    Skipped,
    /// Compaction failed; task kept with this many failed attempts
    Retrying { attempts: u32 },
    /// Archive unusable or out of attempts; task removed
    Dropped,
}

/// Summary of one scheduler pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub due: usize,
    pub compacted: usize,
    pub stale: usize,
    pub skipped: usize,
    pub retrying: usize,
    pub dropped: usize,
}

impl PassReport {
    fn record(&mut self, outcome: CompactionOutcome) {
        match outcome {
            CompactionOutcome::Compacted { .. } => self.compacted += 1,
            CompactionOutcome::Stale => self.stale += 1,
            CompactionOutcome::Skipped => self.skipped += 1,
            CompactionOutcome::Retrying { .. } => self.retrying += 1,
            CompactionOutcome::Dropped => self.dropped += 1,
        }
    }
}

type PassObserver = Arc<dyn Fn(&PassReport) + Send + Sync>;

/// Periodic compaction of dirty archives owned by this host
pub struct CompactionScheduler {
    store: Arc<ArchiveStore>,
    interval: Duration,
    min_age: Duration,
    workers: usize,
    max_attempts: u32,
    observer: Option<PassObserver>,
}

impl CompactionScheduler {
    #[must_use]
    pub fn new(store: Arc<ArchiveStore>, config: &CompactionConfig) -> Self {
        Self {
            store,
            interval: config.interval().max(Duration::from_secs(1)),
            min_age: config.min_age(),
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            observer: None,
        }
    }

    /// Call `observer` with the report of every completed pass
    #[must_use]
    pub fn with_observer(
        mut self,
        observer: impl Fn(&PassReport) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Run passes until `shutdown` turns true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Compaction scheduler started (host={}, interval={:?}, min_age={:?}, workers={})",
            self.store.host_id(),
            self.interval,
            self.min_age,
            self.workers
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_pass(unix_now(), &shutdown).await {
                Ok(report) => {
                    if report.due > 0 {
                        info!(
                            "Compaction pass: {} due, {} compacted, {} stale, {} skipped, {} retrying, {} dropped",
                            report.due,
                            report.compacted,
                            report.stale,
                            report.skipped,
                            report.retrying,
                            report.dropped
                        );
                    }
                    if let Some(observer) = &self.observer {
                        observer(&report);
                    }
                }
                Err(e) => error!("Compaction pass failed: {}", e),
            }
        }

        info!("Compaction scheduler stopped");
    }

    /// Compact every task due at `now`. Jobs that have not started when
    /// `shutdown` turns true are skipped.
    pub async fn run_pass(
        &self,
        now: u64,
        shutdown: &watch::Receiver<bool>,
    ) -> StoreResult<PassReport> {
        let cutoff = now.saturating_sub(self.min_age.as_secs());
        let tasks = {
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || store.coordinator().due(store.host_id(), cutoff))
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))??
        };

        let mut report = PassReport {
            due: tasks.len(),
            ..PassReport::default()
        };
        if tasks.is_empty() {
            debug!("No archives due for compaction");
            return Ok(report);
        }

        let outcomes: Vec<CompactionOutcome> = stream::iter(tasks)
            .map(|task| {
                let store = Arc::clone(&self.store);
                let shutdown = shutdown.clone();
                let max_attempts = self.max_attempts;
                async move {
                    if *shutdown.borrow() {
                        return CompactionOutcome::Skipped;
                    }
                    let path = task.path.clone();
                    match tokio::task::spawn_blocking(move || {
                        compact_task(&store, &task, max_attempts)
                    })
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!("Compaction job for {} aborted: {}", path, e);
                            CompactionOutcome::Skipped
                        }
                    }
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }
        Ok(report)
    }
}

/// Compact one archive under its path lock
pub fn compact_task(
    store: &ArchiveStore,
    task: &CompactionTask,
    max_attempts: u32,
) -> CompactionOutcome {
    let _guard = match store.locks().acquire(&task.path) {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Skipping compaction of {}: {}", task.path, e);
            return CompactionOutcome::Skipped;
        }
    };

    let path = Path::new(&task.path);
    if !path.exists() {
        debug!("Archive {} is gone, dropping task", task.path);
        forget(store, &task.path);
        return CompactionOutcome::Stale;
    }

    let mut archive = match store.checkout(path, None) {
        Ok(archive) => archive,
        Err(e @ StoreError::AlreadyOpen { .. }) => {
            warn!("Skipping compaction: {}", e);
            return CompactionOutcome::Skipped;
        }
        Err(e) => {
            error!("Cannot open {} for compaction, dropping task: {}", task.path, e);
            forget(store, &task.path);
            return CompactionOutcome::Dropped;
        }
    };

    let compacted = archive.compact();
    store.checkin(archive);
    match compacted {
        Ok(reclaimed) => {
            forget(store, &task.path);
            debug!("Compacted {} (reclaimed={})", task.path, reclaimed);
            CompactionOutcome::Compacted { reclaimed }
        }
        Err(StoreError::Io(e)) => {
            error!("Cannot stat {}, dropping task: {}", task.path, e);
            forget(store, &task.path);
            CompactionOutcome::Dropped
        }
        Err(e) => {
            let attempts = match store.coordinator().record_failure(&task.path) {
                Ok(attempts) => attempts,
                Err(record_err) => {
                    error!(
                        "Failed to record compaction failure for {}: {}",
                        task.path, record_err
                    );
                    max_attempts
                }
            };
            if attempts >= max_attempts {
                error!(
                    "Compaction of {} failed {} times, dropping task: {}",
                    task.path, attempts, e
                );
                forget(store, &task.path);
                CompactionOutcome::Dropped
            } else {
                warn!(
                    "Compaction of {} failed (attempt {}/{}): {}",
                    task.path, attempts, max_attempts, e
                );
                CompactionOutcome::Retrying { attempts }
            }
        }
    }
}

fn forget(store: &ArchiveStore, path: &str) {
    if let Err(e) = store.coordinator().remove(path) {
        warn!("Failed to remove compaction task for {}: {}", path, e);
    }
}
