use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::credentials::CredentialCache;
use crate::database::{is_numeric_name, PoolStats, Storage, User, UserRef, WorkerStats};
use crate::error::{PoolError, Result};
use crate::importer::{BatchImporter, ForceDeadline};
use crate::metrics::SHARES_QUEUED;
use crate::scheduler::FlushScheduler;
use crate::shares::{ShareQueue, ShareRecord};

/// Entry point for the share producers and the admin surface.
pub struct PoolCoordinator {
    config: PipelineConfig,
    storage: Arc<dyn Storage>,
    queue: Arc<ShareQueue>,
    credentials: CredentialCache,
    importer: Arc<BatchImporter>,
    scheduler: Arc<FlushScheduler>,
}

impl PoolCoordinator {
    pub fn new(config: PipelineConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(ShareQueue::new());
        let deadline = Arc::new(ForceDeadline::new(config.flush.force_interval));
        let importer = Arc::new(BatchImporter::new(
            queue.clone(),
            storage.clone(),
            deadline,
            &config.flush,
        ));
        let scheduler = Arc::new(FlushScheduler::new(
            queue.clone(),
            importer.clone(),
            config.flush.min_batch,
            storage.is_blocking(),
        ));
        let credentials = CredentialCache::new(config.auth.cache_ttl);

        info!(
            "{} coordinator using {} storage",
            config.pool_name,
            storage.driver_name()
        );

        Ok(Self {
            config,
            storage,
            queue,
            credentials,
            importer,
            scheduler,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn importer(&self) -> Arc<BatchImporter> {
        self.importer.clone()
    }

    pub fn scheduler(&self) -> Arc<FlushScheduler> {
        self.scheduler.clone()
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    // Share intake

    pub fn queue_share(&self, share: ShareRecord) {
        self.queue.enqueue(share);
        SHARES_QUEUED.inc();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Commit everything queued, then record the block against its share.
    /// Waits out a dispatched flush that may hold the triggering share.
    pub async fn found_block(&self, share: ShareRecord) {
        info!("Updating found block share record for {}", share.worker_name);
        let in_flight = self.scheduler.in_flight();
        let _guard = in_flight.lock().await;
        let report = self.importer.flush_all().await;
        if report.still_queued > 0 {
            error!(
                "Found block update runs with {} shares still uncommitted",
                report.still_queued
            );
        }
        if let Err(e) = self.storage.update_found_block(&share).await {
            error!("Update found block share record failed: {}", e);
        }
    }

    // Workers

    pub async fn authenticate(&self, identity: &str, secret: &str) -> Result<bool> {
        self.credentials
            .check_and_cache(self.storage.as_ref(), identity, secret, &self.config.auth)
            .await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.storage.list_users().await
    }

    pub async fn get_user(&self, user: &UserRef) -> Result<Option<User>> {
        self.storage.get_user(user).await
    }

    pub async fn create_user(&self, identity: &str, secret: &str) -> Result<u64> {
        if identity.is_empty() {
            return Err(PoolError::Validation("username must not be empty".to_string()));
        }
        if UserRef::parse(identity).is_sentinel() {
            return Err(PoolError::ProtectedRecord(format!(
                "username {} is reserved",
                identity
            )));
        }
        if is_numeric_name(identity) {
            return Err(PoolError::Validation(format!(
                "username {} must not be all digits",
                identity
            )));
        }
        if self.storage.user_exists(identity).await? {
            return Err(PoolError::Validation(format!("user {} already exists", identity)));
        }
        self.storage.insert_user(identity, secret).await
    }

    pub async fn delete_user(&self, user: &UserRef) -> Result<()> {
        if user.is_sentinel() {
            return Err(PoolError::ProtectedRecord(format!("cannot delete user {}", user)));
        }
        self.storage.delete_user(user).await?;
        self.credentials.clear();
        debug!("Deleted user {}", user);
        Ok(())
    }

    pub async fn set_user_secret(&self, user: &UserRef, secret: &str) -> Result<()> {
        if user.is_sentinel() {
            return Err(PoolError::ProtectedRecord(format!("cannot update user {}", user)));
        }
        self.storage.update_user(user, secret).await?;
        self.credentials.clear();
        Ok(())
    }

    pub async fn set_worker_difficulty(&self, name: &str, difficulty: f64) -> Result<()> {
        if !difficulty.is_finite() || difficulty < 0.0 {
            return Err(PoolError::Validation(format!(
                "invalid difficulty {}",
                difficulty
            )));
        }
        self.storage.update_worker_difficulty(name, difficulty).await
    }

    pub async fn clear_all_worker_difficulty(&self) -> Result<()> {
        self.storage.clear_worker_difficulty().await
    }

    // Stats

    pub async fn get_pool_stats(&self) -> Result<PoolStats> {
        self.storage.get_pool_stats().await
    }

    pub async fn get_worker_stats(&self) -> Result<BTreeMap<String, WorkerStats>> {
        self.storage.get_worker_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use crate::database::MemoryStore;

    fn coordinator() -> (Arc<MemoryStore>, PoolCoordinator) {
        let store = Arc::new(MemoryStore::new(&StorageSettings::default()));
        let coordinator = PoolCoordinator::new(PipelineConfig::default(), store.clone()).unwrap();
        (store, coordinator)
    }

    #[tokio::test]
    async fn sentinel_is_protected_before_the_store() {
        let (store, coordinator) = coordinator();

        for user in [UserRef::Id(0), UserRef::parse("0")] {
            assert!(matches!(
                coordinator.delete_user(&user).await,
                Err(PoolError::ProtectedRecord(_))
            ));
            assert!(matches!(
                coordinator.set_user_secret(&user, "pw").await,
                Err(PoolError::ProtectedRecord(_))
            ));
        }
        assert_eq!(store.delete_user_calls(), 0);
    }

    #[tokio::test]
    async fn mutations_clear_the_credential_cache() {
        let (store, coordinator) = coordinator();
        coordinator.create_user("alice", "pw").await.unwrap();

        assert!(coordinator.authenticate("alice", "pw").await.unwrap());
        assert!(coordinator.authenticate("alice", "pw").await.unwrap());
        assert_eq!(store.password_checks(), 1);

        coordinator
            .set_user_secret(&UserRef::parse("alice"), "new")
            .await
            .unwrap();
        assert!(coordinator.credentials().is_empty());
        assert!(!coordinator.authenticate("alice", "pw").await.unwrap());
        assert!(coordinator.authenticate("alice", "new").await.unwrap());
    }

    #[tokio::test]
    async fn found_block_flushes_first() {
        let (store, coordinator) = coordinator();
        coordinator.queue_share(ShareRecord::valid("w1", 100, 1.0));

        let mut found = ShareRecord::valid("w1", 100, 1.0);
        found.block_hash = "00ab".to_string();
        coordinator.found_block(found).await;

        let committed = store.committed_shares();
        assert_eq!(committed.len(), 1);
        assert!(committed[0].upstream_result);
        assert_eq!(committed[0].solution, "00ab");
        assert_eq!(coordinator.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn found_block_waits_for_dispatched_flush() {
        let store = Arc::new(MemoryStore::new(&StorageSettings::default()));
        store.set_blocking(true);
        store.stall_imports(std::time::Duration::from_secs(5));
        let config = PipelineConfig {
            flush: crate::config::FlushConfig {
                min_batch: 1,
                ..crate::config::FlushConfig::default()
            },
            ..PipelineConfig::default()
        };
        let coordinator = PoolCoordinator::new(config, store.clone()).unwrap();

        coordinator.queue_share(ShareRecord::valid("w1", 100, 1.0));
        assert_eq!(
            coordinator.scheduler().tick().await,
            crate::scheduler::FlushDecision::Dispatched
        );
        tokio::task::yield_now().await;
        assert_eq!(coordinator.queue_len(), 0);
        assert!(store.committed_shares().is_empty());

        let mut found = ShareRecord::valid("w1", 100, 1.0);
        found.block_hash = "00ab".to_string();
        coordinator.found_block(found).await;

        let committed = store.committed_shares();
        assert_eq!(committed.len(), 1);
        assert!(committed[0].upstream_result);
        assert_eq!(committed[0].solution, "00ab");
    }

    #[tokio::test]
    async fn duplicate_and_reserved_names_are_rejected() {
        let (_store, coordinator) = coordinator();
        coordinator.create_user("alice", "pw").await.unwrap();

        assert!(matches!(
            coordinator.create_user("alice", "pw").await,
            Err(PoolError::Validation(_))
        ));
        assert!(matches!(
            coordinator.create_user("0", "pw").await,
            Err(PoolError::ProtectedRecord(_))
        ));
        assert!(matches!(
            coordinator.create_user("7", "pw").await,
            Err(PoolError::Validation(_))
        ));
        assert!(!coordinator.storage().user_exists("7").await.unwrap());
        assert!(matches!(
            coordinator.set_worker_difficulty("alice", f64::NAN).await,
            Err(PoolError::Validation(_))
        ));
    }
}
