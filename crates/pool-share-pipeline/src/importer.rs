use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::FlushConfig;
use crate::database::Storage;
use crate::metrics::{COMMIT_DURATION, COMMIT_FAILURES, SHARES_COMMITTED, SHARES_REQUEUED};
use crate::shares::ShareQueue;

/// Point in time after which a flush runs regardless of queue length.
#[derive(Debug)]
pub struct ForceDeadline {
    interval: Duration,
    at: Mutex<Instant>,
}

impl ForceDeadline {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            at: Mutex::new(Instant::now() + interval),
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= *self.at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now() + self.interval;
    }

    pub fn deadline(&self) -> Instant {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of one import cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Batches committed successfully.
    pub batches: usize,
    pub committed: usize,
    /// Records handed back to the queue by a failed commit.
    pub requeued: usize,
    /// Queue length when the cycle ended.
    pub still_queued: usize,
}

impl ImportReport {
    fn absorb(&mut self, cycle: ImportReport) {
        self.batches += cycle.batches;
        self.committed += cycle.committed;
        self.requeued += cycle.requeued;
        self.still_queued = cycle.still_queued;
    }
}

/// Moves queued shares into the store in bounded batches.
pub struct BatchImporter {
    queue: Arc<ShareQueue>,
    storage: Arc<dyn Storage>,
    deadline: Arc<ForceDeadline>,
    min_batch: usize,
    max_batch: usize,
}

impl BatchImporter {
    pub fn new(
        queue: Arc<ShareQueue>,
        storage: Arc<dyn Storage>,
        deadline: Arc<ForceDeadline>,
        config: &FlushConfig,
    ) -> Self {
        Self {
            queue,
            storage,
            deadline,
            min_batch: config.min_batch,
            max_batch: config.max_batch,
        }
    }

    pub fn deadline(&self) -> &Arc<ForceDeadline> {
        &self.deadline
    }

    fn should_continue(&self, force: bool) -> bool {
        force || self.queue.len() >= self.min_batch || self.deadline.expired()
    }

    /// Commit batches until neither trigger holds, the queue runs dry, or a
    /// commit fails. A failed batch goes back to the queue and ends the cycle.
    pub async fn run_cycle(&self, mut force: bool) -> ImportReport {
        let mut report = ImportReport::default();

        while self.should_continue(force) {
            self.deadline.reset();
            force = false;

            let batch = self.queue.drain_up_to(self.max_batch);
            if batch.is_empty() {
                break;
            }

            debug!("Committing batch of {} shares", batch.len());
            let timer = COMMIT_DURATION.start_timer();
            let result = self.storage.import_shares(&batch).await;
            timer.observe_duration();

            match result {
                Ok(()) => {
                    report.batches += 1;
                    report.committed += batch.len();
                    SHARES_COMMITTED.inc_by(batch.len() as u64);
                }
                Err(e) => {
                    error!(
                        "Failed to commit {} shares, returning them to the queue: {}",
                        batch.len(),
                        e
                    );
                    COMMIT_FAILURES.inc();
                    SHARES_REQUEUED.inc_by(batch.len() as u64);
                    report.requeued = batch.len();
                    self.queue.requeue(batch);
                    break;
                }
            }
        }

        report.still_queued = self.queue.len();
        if report.batches > 0 {
            info!(
                "Committed {} shares in {} batches, {} still queued",
                report.committed, report.batches, report.still_queued
            );
        }
        report
    }

    /// Forced cycles until the queue is empty or a commit fails.
    pub async fn flush_all(&self) -> ImportReport {
        let mut report = ImportReport::default();
        loop {
            let cycle = self.run_cycle(true).await;
            report.absorb(cycle);
            if cycle.requeued > 0 || cycle.batches == 0 || cycle.still_queued == 0 {
                return report;
            }
        }
    }
}
