use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::debug;

use super::schema::*;
use super::{ArchiveRowStream, Storage};
use crate::error::{PoolError, Result};
use crate::shares::ShareRecord;

/// The `none` driver: accepts every import and keeps no rows.
///
/// There is no worker table, so every worker authenticates. Only the pool
/// record is kept so node info still shows up in the stats endpoint.
#[derive(Debug, Default)]
pub struct NullStore {
    discarded: AtomicU64,
    pool_stats: Mutex<PoolStats>,
}

impl NullStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares accepted and dropped since startup.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Storage for NullStore {
    fn driver_name(&self) -> &'static str {
        "none"
    }

    async fn check_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn import_shares(&self, shares: &[ShareRecord]) -> Result<()> {
        self.discarded.fetch_add(shares.len() as u64, Ordering::Relaxed);
        debug!("Discarded {} shares", shares.len());
        Ok(())
    }

    async fn update_found_block(&self, share: &ShareRecord) -> Result<()> {
        debug!("Discarded found block from {}", share.worker_name);
        Ok(())
    }

    async fn check_password(&self, _username: &str, _secret: &str) -> Result<bool> {
        Ok(true)
    }

    async fn user_exists(&self, _username: &str) -> Result<bool> {
        Ok(true)
    }

    async fn get_user(&self, user: &UserRef) -> Result<Option<User>> {
        Ok(user.is_sentinel().then(User::sentinel))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(Vec::new())
    }

    async fn insert_user(&self, username: &str, _secret: &str) -> Result<u64> {
        Err(PoolError::Store(format!(
            "cannot add user {}: the none driver keeps no workers",
            username
        )))
    }

    async fn update_user(&self, user: &UserRef, _secret: &str) -> Result<()> {
        Err(PoolError::NotFound(format!("user {}", user)))
    }

    async fn delete_user(&self, user: &UserRef) -> Result<()> {
        if user.is_sentinel() {
            return Err(PoolError::ProtectedRecord(format!("cannot delete user {}", user)));
        }
        Ok(())
    }

    async fn update_worker_difficulty(&self, _username: &str, _difficulty: f64) -> Result<()> {
        Ok(())
    }

    async fn clear_worker_difficulty(&self) -> Result<()> {
        Ok(())
    }

    async fn recompute_stats(&self, window: Duration) -> Result<()> {
        let mut stats = self.pool_stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.window_secs = window.as_secs();
        stats.updated_at = Some(chrono::Utc::now().timestamp());
        Ok(())
    }

    async fn get_pool_stats(&self) -> Result<PoolStats> {
        Ok(self
            .pool_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn get_worker_stats(&self) -> Result<BTreeMap<String, WorkerStats>> {
        Ok(BTreeMap::new())
    }

    async fn update_pool_info(&self, info: PoolInfo) -> Result<()> {
        self.pool_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .info = info;
        Ok(())
    }

    async fn find_archive_cutoff(&self) -> Result<Option<i64>> {
        Ok(None)
    }

    async fn mark_archive_cutoff(&self, _cutoff: i64) -> Result<()> {
        Ok(())
    }

    async fn export_rows_to_secondary_store(&self, _cutoff: i64) -> Result<u64> {
        Ok(0)
    }

    async fn stream_rows_older_than(&self, _cutoff: i64) -> Result<ArchiveRowStream> {
        Ok(stream::empty().boxed())
    }

    async fn delete_rows_older_than(&self, _cutoff: i64) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn imports_are_accepted_and_dropped() {
        let store = NullStore::new();
        store
            .import_shares(&[
                ShareRecord::valid("w1", 1, 1.0),
                ShareRecord::rejected("w2", 2, "stale"),
            ])
            .await
            .unwrap();

        assert_eq!(store.discarded(), 2);
        assert!(store.get_worker_stats().await.unwrap().is_empty());
        assert_eq!(store.find_archive_cutoff().await.unwrap(), None);
    }

    #[tokio::test]
    async fn every_worker_authenticates() {
        let store = NullStore::new();
        assert!(store.check_password("anyone", "x").await.unwrap());
        assert!(store.insert_user("anyone", "x").await.is_err());
        assert!(matches!(
            store.delete_user(&UserRef::Id(0)).await,
            Err(PoolError::ProtectedRecord(_))
        ));
    }
}
