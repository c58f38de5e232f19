use std::sync::Arc;

use tokio::signal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::importer::{BatchImporter, ImportReport};

/// Wait for SIGINT or SIGTERM, then cancel `token`.
pub async fn listen_for_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

/// Final flush of everything still queued.
pub struct ShutdownCoordinator {
    importer: Arc<BatchImporter>,
    in_flight: Arc<Mutex<()>>,
}

impl ShutdownCoordinator {
    pub fn new(importer: Arc<BatchImporter>, in_flight: Arc<Mutex<()>>) -> Self {
        Self {
            importer,
            in_flight,
        }
    }

    /// Waits out a dispatched flush before draining the queue. Anything
    /// left in `still_queued` was not committed.
    pub async fn shutdown(&self) -> ImportReport {
        let _guard = self.in_flight.lock().await;
        let report = self.importer.flush_all().await;
        if report.still_queued > 0 {
            error!(
                "Shutdown flush failed, {} shares were not committed",
                report.still_queued
            );
        } else {
            info!("Shutdown flush committed {} shares", report.committed);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlushConfig, StorageSettings};
    use crate::database::MemoryStore;
    use crate::importer::ForceDeadline;
    use crate::shares::{ShareQueue, ShareRecord};
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_commits_partial_batch() {
        let queue = Arc::new(ShareQueue::new());
        let store = Arc::new(MemoryStore::new(&StorageSettings::default()));
        let config = FlushConfig::default();
        let importer = Arc::new(BatchImporter::new(
            queue.clone(),
            store.clone(),
            Arc::new(ForceDeadline::new(config.force_interval)),
            &config,
        ));
        for ts in 0..7 {
            queue.enqueue(ShareRecord::valid("w1", ts, 1.0));
        }

        let shutdown = ShutdownCoordinator::new(importer, Arc::new(Mutex::new(())));
        let report = shutdown.shutdown().await;

        assert_eq!(report.committed, 7);
        assert!(queue.is_empty());
        assert_eq!(store.committed_shares().len(), 7);
    }

    #[tokio::test]
    async fn shutdown_commits_remainder_after_full_batch() {
        let queue = Arc::new(ShareQueue::new());
        let store = Arc::new(MemoryStore::new(&StorageSettings::default()));
        let config = FlushConfig::default();
        let importer = Arc::new(BatchImporter::new(
            queue.clone(),
            store.clone(),
            Arc::new(ForceDeadline::new(config.force_interval)),
            &config,
        ));
        for ts in 0..1050 {
            queue.enqueue(ShareRecord::valid("w1", ts, 1.0));
        }

        let shutdown = ShutdownCoordinator::new(importer, Arc::new(Mutex::new(())));
        let report = shutdown.shutdown().await;

        assert_eq!(report.committed, 1050);
        assert_eq!(report.still_queued, 0);
        assert!(queue.is_empty());
        assert_eq!(store.committed_shares().len(), 1050);
    }

    #[tokio::test]
    async fn failed_shutdown_flush_reports_uncommitted_shares() {
        let queue = Arc::new(ShareQueue::new());
        let store = Arc::new(MemoryStore::new(&StorageSettings::default()));
        let config = FlushConfig::default();
        let importer = Arc::new(BatchImporter::new(
            queue.clone(),
            store.clone(),
            Arc::new(ForceDeadline::new(config.force_interval)),
            &config,
        ));
        for ts in 0..1050 {
            queue.enqueue(ShareRecord::valid("w1", ts, 1.0));
        }
        store.fail_next_imports(1);

        let report = ShutdownCoordinator::new(importer, Arc::new(Mutex::new(())))
            .shutdown()
            .await;
        assert_eq!(report.requeued, 1000);
        assert_eq!(report.still_queued, 1050);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_flush() {
        let queue = Arc::new(ShareQueue::new());
        let store = Arc::new(MemoryStore::new(&StorageSettings::default()));
        let config = FlushConfig::default();
        let importer = Arc::new(BatchImporter::new(
            queue.clone(),
            store,
            Arc::new(ForceDeadline::new(config.force_interval)),
            &config,
        ));
        let in_flight = Arc::new(Mutex::new(()));
        let held = in_flight.clone().lock_owned().await;

        let shutdown = ShutdownCoordinator::new(importer, in_flight);
        let task = tokio::spawn(async move { shutdown.shutdown().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());
        drop(held);
        assert_eq!(task.await.unwrap().committed, 0);
    }

    #[tokio::test]
    async fn cancelled_token_stops_listener() {
        let token = CancellationToken::new();
        token.cancel();
        listen_for_signals(token.clone()).await;
        assert!(token.is_cancelled());
    }
}
