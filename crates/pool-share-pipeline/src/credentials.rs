use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::database::{is_numeric_name, Storage};
use crate::error::Result;
use crate::metrics::AUTH_CACHE_HITS;

#[derive(Debug)]
struct CacheState {
    keys: HashSet<String>,
    epoch: Instant,
}

/// Remembers worker credentials that already passed a check.
///
/// The whole set is dropped once it is older than the ttl, and on demand
/// after any worker mutation. Only digests are kept.
#[derive(Debug)]
pub struct CredentialCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

fn cache_key(identity: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b":-:");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

impl CredentialCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState {
                keys: HashSet::new(),
                epoch: Instant::now(),
            }),
        }
    }

    /// Lock the cache, dropping every entry first if the ttl has run out.
    fn lock_fresh(&self) -> MutexGuard<'_, CacheState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.epoch.elapsed() >= self.ttl {
            debug!("Credential cache expired, dropping {} entries", state.keys.len());
            state.keys.clear();
            state.epoch = Instant::now();
        }
        state
    }

    pub fn contains(&self, identity: &str, secret: &str) -> bool {
        self.lock_fresh().keys.contains(&cache_key(identity, secret))
    }

    pub fn insert(&self, identity: &str, secret: &str) {
        self.lock_fresh().keys.insert(cache_key(identity, secret));
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.keys.clear();
        state.epoch = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.lock_fresh().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check a worker's credentials, consulting the store only on a miss.
    pub async fn check_and_cache(
        &self,
        storage: &dyn Storage,
        identity: &str,
        secret: &str,
        auth: &AuthConfig,
    ) -> Result<bool> {
        if identity.is_empty() {
            info!("Rejecting authentication with an empty worker name");
            return Ok(false);
        }

        if self.contains(identity, secret) {
            AUTH_CACHE_HITS.inc();
            return Ok(true);
        }

        if !auth.check_password && storage.user_exists(identity).await? {
            self.insert(identity, secret);
            return Ok(true);
        }

        if storage.check_password(identity, secret).await? {
            self.insert(identity, secret);
            return Ok(true);
        }

        if auth.auto_add {
            if is_numeric_name(identity) {
                info!("Not adding worker {} with an all-digit name", identity);
                return Ok(false);
            }
            info!("Adding unknown worker {}", identity);
            storage.insert_user(identity, secret).await?;
            self.insert(identity, secret);
            return Ok(true);
        }

        debug!("Authentication failed for {}", identity);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use crate::database::MemoryStore;

    async fn store_with(user: &str, secret: &str) -> MemoryStore {
        let store = MemoryStore::new(&StorageSettings::default());
        store.insert_user(user, secret).await.unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn second_check_is_served_from_cache() {
        let store = store_with("alice", "pw").await;
        let cache = CredentialCache::new(Duration::from_secs(3600));
        let auth = AuthConfig::default();

        assert!(cache.check_and_cache(&store, "alice", "pw", &auth).await.unwrap());
        assert!(cache.check_and_cache(&store, "alice", "pw", &auth).await.unwrap());
        assert_eq!(store.password_checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_with_the_ttl() {
        let store = store_with("alice", "pw").await;
        let cache = CredentialCache::new(Duration::from_secs(60));
        let auth = AuthConfig::default();

        cache.check_and_cache(&store, "alice", "pw", &auth).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        cache.check_and_cache(&store, "alice", "pw", &auth).await.unwrap();
        assert_eq!(store.password_checks(), 2);
    }

    #[tokio::test]
    async fn wrong_secret_is_not_cached() {
        let store = store_with("alice", "pw").await;
        let cache = CredentialCache::new(Duration::from_secs(3600));
        let auth = AuthConfig::default();

        assert!(!cache.check_and_cache(&store, "alice", "nope", &auth).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn empty_identity_never_reaches_the_store() {
        let store = store_with("alice", "pw").await;
        let cache = CredentialCache::new(Duration::from_secs(3600));

        let ok = cache
            .check_and_cache(&store, "", "pw", &AuthConfig::default())
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(store.password_checks(), 0);
    }

    #[tokio::test]
    async fn unchecked_passwords_accept_known_workers() {
        let store = store_with("alice", "pw").await;
        let cache = CredentialCache::new(Duration::from_secs(3600));
        let auth = AuthConfig {
            check_password: false,
            ..AuthConfig::default()
        };

        assert!(cache.check_and_cache(&store, "alice", "anything", &auth).await.unwrap());
        assert!(!cache.check_and_cache(&store, "bob", "anything", &auth).await.unwrap());
    }

    #[tokio::test]
    async fn auto_add_creates_unknown_workers() {
        let store = MemoryStore::new(&StorageSettings::default());
        let cache = CredentialCache::new(Duration::from_secs(3600));
        let auth = AuthConfig {
            auto_add: true,
            ..AuthConfig::default()
        };

        assert!(cache.check_and_cache(&store, "carol", "pw", &auth).await.unwrap());
        assert!(store.user_exists("carol").await.unwrap());
        assert!(store.check_password("carol", "pw").await.unwrap());

        assert!(!cache.check_and_cache(&store, "42", "pw", &auth).await.unwrap());
        assert!(!store.user_exists("42").await.unwrap());
    }
}
