use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use pool_share_pipeline::archive::{ArchivalManager, ArchiveOutcome};
use pool_share_pipeline::config::{
    ArchiveCompression, ArchiveConfig, ArchiveMode, AuthConfig, FlushConfig, PipelineConfig,
    StatsConfig, StorageSettings,
};
use pool_share_pipeline::database::{MemoryStore, SqliteStore, Storage, UserRef};
use pool_share_pipeline::metrics::CLEANUP_RETRIES;
use pool_share_pipeline::scheduler::FlushDecision;
use pool_share_pipeline::shares::ShareRecord;
use pool_share_pipeline::{PipelineRunner, PoolCoordinator, PoolError};

fn memory_store(archive_age: Duration) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(&StorageSettings {
        archive_age,
        ..StorageSettings::default()
    }))
}

fn coordinator_with(store: Arc<dyn Storage>, flush: FlushConfig) -> PoolCoordinator {
    let config = PipelineConfig {
        flush,
        ..PipelineConfig::default()
    };
    PoolCoordinator::new(config, store).unwrap()
}

fn flush(min_batch: usize, max_batch: usize) -> FlushConfig {
    FlushConfig {
        min_batch,
        max_batch,
        ..FlushConfig::default()
    }
}

fn archive_config(mode: ArchiveMode, dir: &std::path::Path) -> ArchiveConfig {
    ArchiveConfig {
        enabled: true,
        mode,
        file: dir.join("shares"),
        compression: ArchiveCompression::Gzip,
        cleanup_retry_delay: Duration::from_secs(30),
        ..ArchiveConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn no_share_is_lost_across_failed_commits() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = coordinator_with(store.clone(), flush(10, 25));
    let scheduler = coordinator.scheduler();

    let mut ts = 0;
    for round in 0..10 {
        for _ in 0..20 {
            coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
            ts += 1;
        }
        if round % 3 == 1 {
            store.fail_next_imports(1);
        }
        scheduler.tick().await;
    }
    while coordinator.queue_len() > 0 {
        coordinator.importer().flush_all().await;
    }

    let mut committed: Vec<i64> = store
        .committed_shares()
        .iter()
        .map(|s| s.share.timestamp)
        .collect();
    committed.sort_unstable();
    assert_eq!(committed, (0..200).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn failed_batch_is_committed_by_a_later_cycle() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = coordinator_with(store.clone(), flush(1, 10));
    for ts in 0..3 {
        coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
    }

    store.fail_next_imports(1);
    let report = coordinator.importer().flush_all().await;
    assert_eq!(report.requeued, 3);
    assert_eq!(coordinator.queue_len(), 3);
    assert!(store.committed_shares().is_empty());

    let report = coordinator.importer().flush_all().await;
    assert_eq!(report.committed, 3);
    let order: Vec<i64> = store
        .committed_shares()
        .iter()
        .map(|s| s.share.timestamp)
        .collect();
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn force_deadline_flushes_a_partial_batch() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = coordinator_with(
        store.clone(),
        FlushConfig {
            min_batch: 100,
            force_interval: Duration::from_secs(60),
            ..FlushConfig::default()
        },
    );
    let scheduler = coordinator.scheduler();
    for ts in 0..50 {
        coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
    }

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(scheduler.tick().await, FlushDecision::Idle);
    assert_eq!(store.import_calls(), 0);

    tokio::time::advance(Duration::from_secs(1)).await;
    match scheduler.tick().await {
        FlushDecision::Inline(report) => {
            assert_eq!(report.batches, 1);
            assert_eq!(report.committed, 50);
        }
        other => panic!("expected an inline flush, got {:?}", other),
    }
    assert_eq!(store.batch_sizes(), vec![50]);
}

#[tokio::test(start_paused = true)]
async fn burst_is_committed_in_capped_batches() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = coordinator_with(store.clone(), flush(100, 1000));
    for ts in 0..2500 {
        coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
    }

    let report = coordinator.importer().flush_all().await;
    assert_eq!(report.batches, 3);
    assert_eq!(store.batch_sizes(), vec![1000, 1000, 500]);

    let first = &store.committed_shares()[..3];
    assert_eq!(
        first.iter().map(|s| s.share.timestamp).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
}

#[tokio::test(start_paused = true)]
async fn threshold_flush_leaves_remainder_queued() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = coordinator_with(store.clone(), flush(2, 2));
    coordinator.queue_share(ShareRecord::valid("w1", 1, 1.0));
    coordinator.queue_share(ShareRecord::valid("w1", 2, 1.0));
    coordinator.queue_share(ShareRecord::valid("w2", 3, 1.0));

    let decision = coordinator.scheduler().tick().await;
    assert!(matches!(decision, FlushDecision::Inline(report) if report.committed == 2));

    let workers: Vec<String> = store
        .committed_shares()
        .into_iter()
        .map(|s| s.share.worker_name)
        .collect();
    assert_eq!(workers, vec!["w1", "w1"]);
    assert_eq!(coordinator.queue_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn credential_cache_expires_after_ttl() {
    let store = memory_store(Duration::from_secs(86_400));
    let config = PipelineConfig {
        auth: AuthConfig {
            cache_ttl: Duration::from_secs(600),
            ..AuthConfig::default()
        },
        ..PipelineConfig::default()
    };
    let coordinator = PoolCoordinator::new(config, store.clone()).unwrap();
    coordinator.create_user("alice", "pw").await.unwrap();

    for _ in 0..5 {
        assert!(coordinator.authenticate("alice", "pw").await.unwrap());
    }
    assert_eq!(store.password_checks(), 1);

    tokio::time::advance(Duration::from_secs(600)).await;
    assert!(coordinator.authenticate("alice", "pw").await.unwrap());
    assert_eq!(store.password_checks(), 2);
}

#[tokio::test]
async fn sentinel_worker_cannot_be_deleted() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = coordinator_with(store.clone(), FlushConfig::default());

    for user in [UserRef::Name("0".to_string()), UserRef::Id(0)] {
        let result = coordinator.delete_user(&user).await;
        assert!(matches!(result, Err(PoolError::ProtectedRecord(_))));
    }
    assert_eq!(store.delete_user_calls(), 0);
    assert!(coordinator.get_user(&UserRef::Id(0)).await.unwrap().is_some());
}

async fn store_with_old_and_fresh_shares() -> Arc<MemoryStore> {
    let store = memory_store(Duration::from_secs(3600));
    let now = Utc::now().timestamp();
    let shares = vec![
        ShareRecord::valid("w1", 1_000, 1.0),
        ShareRecord::rejected("w2", 2_000, "stale"),
        ShareRecord::valid("w1", now, 1.0),
    ];
    store.import_shares(&shares).await.unwrap();
    store
}

#[tokio::test]
async fn file_archive_exports_then_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_old_and_fresh_shares().await;
    let manager = ArchivalManager::new(store.clone(), archive_config(ArchiveMode::File, dir.path()));

    let outcome = manager.run_cycle().await.unwrap();
    let ArchiveOutcome::Archived { cutoff, rows, file } = outcome else {
        panic!("expected an archive run, got {:?}", outcome);
    };
    assert_eq!(rows, 2);
    assert_eq!(store.last_archive_cutoff(), Some(cutoff));

    let path = file.unwrap();
    assert!(path.to_string_lossy().ends_with(".csv.gz"));
    let mut text = String::new();
    flate2::read::MultiGzDecoder::new(File::open(&path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        "\"1\",\"1000\",\"\",\"w1\",\"Y\",\"N\",\"\",\"\",\"1\",\"1\""
    );
    assert!(lines[1].contains("\"stale\""));

    assert_eq!(store.committed_shares().len(), 1);
    assert_eq!(manager.run_cycle().await.unwrap(), ArchiveOutcome::NothingToArchive);
}

#[tokio::test]
async fn store_archive_copies_into_secondary_table() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_old_and_fresh_shares().await;
    let manager = ArchivalManager::new(store.clone(), archive_config(ArchiveMode::Store, dir.path()));

    let outcome = manager.run_cycle().await.unwrap();
    assert!(matches!(outcome, ArchiveOutcome::Archived { rows: 2, file: None, .. }));
    assert_eq!(store.archived_shares().len(), 2);
    assert_eq!(store.committed_shares().len(), 1);
    assert_eq!(manager.run_cycle().await.unwrap(), ArchiveOutcome::NothingToArchive);
}

#[tokio::test]
async fn disabled_archival_does_nothing() {
    let store = store_with_old_and_fresh_shares().await;
    let manager = ArchivalManager::new(store.clone(), ArchiveConfig::default());

    assert_eq!(manager.run_cycle().await.unwrap(), ArchiveOutcome::Disabled);
    assert_eq!(store.last_archive_cutoff(), None);
    assert_eq!(store.committed_shares().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn archive_cleanup_is_retried_until_it_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_old_and_fresh_shares().await;
    store.fail_next_cleanups(2);
    let manager = ArchivalManager::new(store.clone(), archive_config(ArchiveMode::Store, dir.path()));

    let started = tokio::time::Instant::now();
    let outcome = manager.run_cycle().await.unwrap();

    assert!(matches!(outcome, ArchiveOutcome::Archived { rows: 2, .. }));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(store.committed_shares().len(), 1);
    assert!(CLEANUP_RETRIES.get() >= 2);
}

#[tokio::test(start_paused = true)]
async fn runner_flushes_queue_on_cancel() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = Arc::new(coordinator_with(store.clone(), FlushConfig::default()));
    let token = CancellationToken::new();
    let runner = PipelineRunner::new(&coordinator, None);
    let handle = tokio::spawn(runner.run(token.clone()));

    for ts in 0..5 {
        coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
    }
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.committed_shares().len(), 0);

    token.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.committed, 5);
    assert_eq!(coordinator.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn runner_commits_remainder_below_threshold_on_cancel() {
    let store = memory_store(Duration::from_secs(86_400));
    let coordinator = Arc::new(coordinator_with(store.clone(), FlushConfig::default()));
    let token = CancellationToken::new();
    let handle = tokio::spawn(PipelineRunner::new(&coordinator, None).run(token.clone()));

    for ts in 0..1050 {
        coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
    }
    token.cancel();
    let report = handle.await.unwrap();

    assert_eq!(report.still_queued, 0);
    assert_eq!(coordinator.queue_len(), 0);
    assert_eq!(store.committed_shares().len(), 1050);
}

#[tokio::test(start_paused = true)]
async fn stalled_commit_does_not_hold_up_stats() {
    let store = memory_store(Duration::from_secs(86_400));
    store.stall_imports(Duration::from_secs(3600));
    let config = PipelineConfig {
        stats: StatsConfig {
            enabled: true,
            interval: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
        },
        ..PipelineConfig::default()
    };
    let coordinator = Arc::new(PoolCoordinator::new(config, store.clone()).unwrap());
    for ts in 0..150 {
        coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
    }

    let token = CancellationToken::new();
    let handle = tokio::spawn(PipelineRunner::new(&coordinator, None).run(token.clone()));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(store.import_calls(), 1);
    assert!(store.committed_shares().is_empty());
    assert!(store.recompute_calls() >= 3);

    token.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.still_queued, 0);
    assert_eq!(store.committed_shares().len(), 150);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_store_flushes_are_dispatched() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStore::open(&SqliteStore::path_settings(&dir.path().join("pool.db")))
            .await
            .unwrap(),
    );
    let coordinator = coordinator_with(store.clone(), flush(3, 10));
    coordinator.create_user("w1", "pw").await.unwrap();
    for ts in 0..3 {
        coordinator.queue_share(ShareRecord::valid("w1", ts, 1.0));
    }

    assert_eq!(coordinator.scheduler().tick().await, FlushDecision::Dispatched);
    let _ = coordinator.scheduler().in_flight().lock().await;

    let user = coordinator
        .get_user(&UserRef::parse("w1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.total_shares, 3);
    assert_eq!(coordinator.queue_len(), 0);
}
