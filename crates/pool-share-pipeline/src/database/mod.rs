pub mod memory_store;
pub mod null_store;
pub mod redis_store;
pub mod schema;
pub mod sqlite_store;

pub use memory_store::MemoryStore;
pub use null_store::NullStore;
pub use redis_store::RedisStore;
pub use schema::*;
pub use sqlite_store::SqliteStore;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use tracing::{debug, error};

use crate::config::StorageSettings;
use crate::error::Result;
use crate::shares::ShareRecord;

/// Lazy, finite sequence of archive rows. Each call to
/// [`Storage::stream_rows_older_than`] starts again from the first row.
pub type ArchiveRowStream = BoxStream<'static, Result<ArchiveRow>>;

/// Everything the pipeline needs from a backing store.
#[async_trait]
pub trait Storage: Send + Sync {
    fn driver_name(&self) -> &'static str;

    /// Blocking stores get their flushes dispatched off the runner loop.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Fails with a schema error when the required tables are missing.
    async fn check_schema(&self) -> Result<()>;

    /// Commit a whole batch or nothing.
    async fn import_shares(&self, shares: &[ShareRecord]) -> Result<()>;
    async fn update_found_block(&self, share: &ShareRecord) -> Result<()>;

    async fn check_password(&self, username: &str, secret: &str) -> Result<bool>;
    async fn user_exists(&self, username: &str) -> Result<bool>;
    async fn get_user(&self, user: &UserRef) -> Result<Option<User>>;
    /// All workers except the sentinel.
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn insert_user(&self, username: &str, secret: &str) -> Result<u64>;
    async fn update_user(&self, user: &UserRef, secret: &str) -> Result<()>;
    /// Reassigns the worker's shares to the sentinel before deleting it.
    async fn delete_user(&self, user: &UserRef) -> Result<()>;
    async fn update_worker_difficulty(&self, username: &str, difficulty: f64) -> Result<()>;
    async fn clear_worker_difficulty(&self) -> Result<()>;

    async fn recompute_stats(&self, window: Duration) -> Result<()>;
    async fn get_pool_stats(&self) -> Result<PoolStats>;
    async fn get_worker_stats(&self) -> Result<BTreeMap<String, WorkerStats>>;
    async fn update_pool_info(&self, info: PoolInfo) -> Result<()>;

    async fn find_archive_cutoff(&self) -> Result<Option<i64>>;
    async fn mark_archive_cutoff(&self, cutoff: i64) -> Result<()>;
    async fn export_rows_to_secondary_store(&self, cutoff: i64) -> Result<u64>;
    async fn stream_rows_older_than(&self, cutoff: i64) -> Result<ArchiveRowStream>;
    async fn delete_rows_older_than(&self, cutoff: i64) -> Result<u64>;
}

pub type StorageFactory =
    Arc<dyn Fn(StorageSettings) -> BoxFuture<'static, Result<Arc<dyn Storage>>> + Send + Sync>;

/// Wrap an async constructor as a [`StorageFactory`].
pub fn factory<F, Fut>(open: F) -> StorageFactory
where
    F: Fn(StorageSettings) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Storage>>> + Send + 'static,
{
    Arc::new(move |settings| open(settings).boxed())
}

pub const FALLBACK_DRIVER: &str = "none";

/// Named storage drivers, resolved once at startup.
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

impl StorageRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "memory",
            factory(|settings| async move {
                Ok(Arc::new(MemoryStore::new(&settings)) as Arc<dyn Storage>)
            }),
        );
        registry.register(
            "none",
            factory(|_settings| async move { Ok(Arc::new(NullStore::new()) as Arc<dyn Storage>) }),
        );
        registry.register(
            "redis",
            factory(|settings| async move {
                let store = RedisStore::new(&settings).await?;
                Ok(Arc::new(store) as Arc<dyn Storage>)
            }),
        );
        registry.register(
            "sqlite",
            factory(|settings| async move {
                let store = SqliteStore::open(&settings).await?;
                Ok(Arc::new(store) as Arc<dyn Storage>)
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, factory: StorageFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Unknown driver names fall back to the discarding `none` driver.
    pub async fn open(&self, driver: &str, settings: StorageSettings) -> Result<Arc<dyn Storage>> {
        let factory = match self.factories.get(driver) {
            Some(factory) => {
                debug!("Opening {} storage", driver);
                factory
            }
            None => {
                error!("Invalid storage driver '{}' -- using {}", driver, FALLBACK_DRIVER);
                self.factories
                    .get(FALLBACK_DRIVER)
                    .ok_or_else(|| {
                        crate::error::PoolError::Configuration(format!(
                            "unknown storage driver '{}' and no fallback registered",
                            driver
                        ))
                    })?
            }
        };
        factory(settings).await
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_builtin_drivers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn unknown_driver_falls_back_to_none() {
        let registry = StorageRegistry::with_builtin_drivers();
        let store = registry
            .open("mssql", StorageSettings::default())
            .await
            .unwrap();
        assert_eq!(store.driver_name(), "none");
        store
            .import_shares(&[ShareRecord::valid("w1", 1, 1.0)])
            .await
            .unwrap();
        assert!(store.find_archive_cutoff().await.unwrap().is_none());
        assert!(logs_contain("Invalid storage driver"));
    }

    #[tokio::test]
    async fn builtin_drivers_are_listed() {
        let registry = StorageRegistry::default();
        assert_eq!(registry.drivers(), vec!["memory", "none", "redis", "sqlite"]);
    }

    #[tokio::test]
    async fn empty_registry_has_no_fallback() {
        let registry = StorageRegistry::empty();
        assert!(registry.open("none", StorageSettings::default()).await.is_err());
    }
}
