use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::archive::{ArchivalManager, ArchiveOutcome};
use crate::config::PipelineConfig;
use crate::coordinator::PoolCoordinator;
use crate::importer::{BatchImporter, ImportReport};
use crate::shares::ShareQueue;
use crate::shutdown::ShutdownCoordinator;
use crate::stats::{NodeStatusOracle, StatsCycle};

/// What a scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Neither the batch threshold nor the force deadline was reached.
    Idle,
    /// The flush ran to completion on the caller's task.
    Inline(ImportReport),
    /// The flush was spawned onto its own task.
    Dispatched,
    /// A dispatched flush from an earlier tick is still running.
    Busy,
}

/// Decides on every tick whether the queue should be flushed.
pub struct FlushScheduler {
    queue: Arc<ShareQueue>,
    importer: Arc<BatchImporter>,
    min_batch: usize,
    dispatch: bool,
    in_flight: Arc<Mutex<()>>,
}

impl FlushScheduler {
    pub fn new(
        queue: Arc<ShareQueue>,
        importer: Arc<BatchImporter>,
        min_batch: usize,
        dispatch: bool,
    ) -> Self {
        Self {
            queue,
            importer,
            min_batch,
            dispatch,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Held for as long as a flush started by this scheduler runs.
    pub fn in_flight(&self) -> Arc<Mutex<()>> {
        self.in_flight.clone()
    }

    /// Flushes inline unless the store blocks, in which case the flush is
    /// spawned.
    pub async fn tick(&self) -> FlushDecision {
        self.tick_with(self.dispatch).await
    }

    /// Like [`tick`](Self::tick) but always spawns the flush, so a hung
    /// store call never holds up the caller.
    pub async fn spawn_tick(&self) -> FlushDecision {
        self.tick_with(true).await
    }

    async fn tick_with(&self, dispatch: bool) -> FlushDecision {
        let queued = self.queue.len();
        let deadline = self.importer.deadline();
        if queued < self.min_batch && !deadline.expired() {
            return FlushDecision::Idle;
        }

        let Ok(permit) = self.in_flight.clone().try_lock_owned() else {
            debug!("Previous flush still running, skipping tick");
            return FlushDecision::Busy;
        };

        debug!("Flush triggered with {} shares queued", queued);
        deadline.reset();

        if dispatch {
            let importer = self.importer.clone();
            tokio::spawn(async move {
                let _permit = permit;
                importer.run_cycle(true).await;
            });
            FlushDecision::Dispatched
        } else {
            let report = self.importer.run_cycle(true).await;
            drop(permit);
            FlushDecision::Inline(report)
        }
    }
}

/// Drives flush, stats and archival on their own cadences until cancelled,
/// then flushes what is left.
pub struct PipelineRunner {
    config: PipelineConfig,
    scheduler: Arc<FlushScheduler>,
    stats: Option<Arc<StatsCycle>>,
    archive: Arc<ArchivalManager>,
    shutdown: ShutdownCoordinator,
}

impl PipelineRunner {
    pub fn new(coordinator: &PoolCoordinator, oracle: Option<Arc<dyn NodeStatusOracle>>) -> Self {
        let config = coordinator.config().clone();
        let storage = coordinator.storage();
        let scheduler = coordinator.scheduler();

        let stats = config
            .stats
            .enabled
            .then(|| Arc::new(StatsCycle::new(storage.clone(), oracle, &config.stats)));
        let archive = Arc::new(ArchivalManager::new(storage, config.archive.clone()));
        let shutdown = ShutdownCoordinator::new(coordinator.importer(), scheduler.in_flight());

        Self {
            config,
            scheduler,
            stats,
            archive,
            shutdown,
        }
    }

    pub async fn run(self, token: CancellationToken) -> ImportReport {
        let mut flush_tick = interval(self.config.flush.check_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_tick = interval(self.config.stats.check_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut archive_tick = interval(self.config.archive.interval);
        archive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stats_running = Arc::new(Mutex::new(()));
        let archive_running = Arc::new(Mutex::new(()));
        let archive_enabled = self.config.archive.enabled;

        info!(
            "Share pipeline started (check every {:?}, batch {}..{}, force after {:?})",
            self.config.flush.check_interval,
            self.config.flush.min_batch,
            self.config.flush.max_batch,
            self.config.flush.force_interval
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Share pipeline stopping");
                    break;
                }
                _ = flush_tick.tick() => {
                    let decision = self.scheduler.spawn_tick().await;
                    debug!("Flush tick: {:?}", decision);
                }
                _ = stats_tick.tick(), if self.stats.is_some() => {
                    if let (Some(stats), Ok(permit)) =
                        (self.stats.clone(), stats_running.clone().try_lock_owned())
                    {
                        tokio::spawn(async move {
                            let _permit = permit;
                            stats.run_if_due().await;
                        });
                    }
                }
                _ = archive_tick.tick(), if archive_enabled => {
                    let Ok(permit) = archive_running.clone().try_lock_owned() else {
                        debug!("Archival still running, skipping tick");
                        continue;
                    };
                    let archive = self.archive.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        match archive.run_cycle().await {
                            Ok(ArchiveOutcome::Archived { rows, .. }) => {
                                debug!("Archival cycle moved {} rows", rows)
                            }
                            Ok(_) => {}
                            Err(e) => error!("Archival cycle failed: {}", e),
                        }
                    });
                }
            }
        }

        self.shutdown.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlushConfig, StorageSettings};
    use crate::database::MemoryStore;
    use crate::importer::ForceDeadline;
    use crate::shares::ShareRecord;

    fn scheduler(dispatch: bool) -> (Arc<ShareQueue>, Arc<MemoryStore>, FlushScheduler) {
        let queue = Arc::new(ShareQueue::new());
        let store = Arc::new(MemoryStore::new(&StorageSettings::default()));
        let config = FlushConfig {
            min_batch: 3,
            max_batch: 10,
            ..FlushConfig::default()
        };
        let importer = Arc::new(BatchImporter::new(
            queue.clone(),
            store.clone(),
            Arc::new(ForceDeadline::new(config.force_interval)),
            &config,
        ));
        let scheduler = FlushScheduler::new(queue.clone(), importer, config.min_batch, dispatch);
        (queue, store, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_triggers_inline_flush() {
        let (queue, store, scheduler) = scheduler(false);
        queue.enqueue(ShareRecord::valid("w1", 1, 1.0));
        assert_eq!(scheduler.tick().await, FlushDecision::Idle);

        queue.enqueue(ShareRecord::valid("w1", 2, 1.0));
        queue.enqueue(ShareRecord::valid("w1", 3, 1.0));
        match scheduler.tick().await {
            FlushDecision::Inline(report) => assert_eq!(report.committed, 3),
            other => panic!("unexpected decision {:?}", other),
        }
        assert_eq!(store.committed_shares().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_while_dispatched_flush_runs() {
        let (queue, _store, scheduler) = scheduler(true);
        for ts in 0..3 {
            queue.enqueue(ShareRecord::valid("w1", ts, 1.0));
        }

        let held = scheduler.in_flight().try_lock_owned().unwrap();
        assert_eq!(scheduler.tick().await, FlushDecision::Busy);
        assert_eq!(queue.len(), 3);
        drop(held);

        assert_eq!(scheduler.tick().await, FlushDecision::Dispatched);
        let _ = scheduler.in_flight().lock().await;
        assert!(queue.is_empty());
    }
}
