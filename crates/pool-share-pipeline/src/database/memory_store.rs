use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::debug;

use super::schema::*;
use super::{ArchiveRowStream, Storage};
use crate::config::StorageSettings;
use crate::error::{PoolError, Result};
use crate::shares::ShareRecord;

#[derive(Debug)]
struct MemoryState {
    users: BTreeMap<u64, (User, String)>,
    next_user_id: u64,
    shares: Vec<StoredShare>,
    next_share_id: u64,
    archived: Vec<StoredShare>,
    pool_stats: PoolStats,
    last_cutoff: Option<i64>,
    batch_sizes: Vec<usize>,
}

impl MemoryState {
    fn find_user(&self, user: &UserRef) -> Option<u64> {
        self.users
            .values()
            .find(|(u, _)| user.matches(u))
            .map(|(u, _)| u.id)
    }

    fn find_by_name(&self, username: &str) -> Option<u64> {
        self.find_user(&UserRef::Name(username.to_string()))
    }
}

/// In-process store; the `memory` driver, for development and tests.
///
/// Nothing survives a restart and committed shares are only released by
/// archival. It also counts calls and can be told to fail, stall or act as a
/// blocking store, which is what the pipeline tests drive.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    salt: String,
    archive_age: Duration,
    import_calls: AtomicU64,
    password_checks: AtomicU64,
    delete_user_calls: AtomicU64,
    recompute_calls: AtomicU64,
    failing_imports: AtomicU32,
    failing_cleanups: AtomicU32,
    import_delay: Mutex<Duration>,
    blocking: AtomicBool,
}

impl MemoryStore {
    pub fn new(settings: &StorageSettings) -> Self {
        let mut users = BTreeMap::new();
        users.insert(SENTINEL_USER_ID, (User::sentinel(), String::new()));

        Self {
            state: Mutex::new(MemoryState {
                users,
                next_user_id: SENTINEL_USER_ID + 1,
                shares: Vec::new(),
                next_share_id: 1,
                archived: Vec::new(),
                pool_stats: PoolStats::default(),
                last_cutoff: None,
                batch_sizes: Vec::new(),
            }),
            salt: settings.password_salt.clone(),
            archive_age: settings.archive_age,
            import_calls: AtomicU64::new(0),
            password_checks: AtomicU64::new(0),
            delete_user_calls: AtomicU64::new(0),
            recompute_calls: AtomicU64::new(0),
            failing_imports: AtomicU32::new(0),
            failing_cleanups: AtomicU32::new(0),
            import_delay: Mutex::new(Duration::ZERO),
            blocking: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` imports fail with a store error.
    pub fn fail_next_imports(&self, count: u32) {
        self.failing_imports.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` row deletions fail with a store error.
    pub fn fail_next_cleanups(&self, count: u32) {
        self.failing_cleanups.store(count, Ordering::SeqCst);
    }

    /// Sleep this long inside every import before touching state.
    pub fn stall_imports(&self, delay: Duration) {
        *self.import_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Report the store as blocking so flushes get dispatched.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn recompute_calls(&self) -> u64 {
        self.recompute_calls.load(Ordering::SeqCst)
    }

    pub fn import_calls(&self) -> u64 {
        self.import_calls.load(Ordering::SeqCst)
    }

    pub fn password_checks(&self) -> u64 {
        self.password_checks.load(Ordering::SeqCst)
    }

    pub fn delete_user_calls(&self) -> u64 {
        self.delete_user_calls.load(Ordering::SeqCst)
    }

    /// Committed shares still in the hot set, in commit order.
    pub fn committed_shares(&self) -> Vec<StoredShare> {
        self.lock().shares.clone()
    }

    pub fn archived_shares(&self) -> Vec<StoredShare> {
        self.lock().archived.clone()
    }

    /// Sizes of the successfully imported batches, in commit order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    pub fn last_archive_cutoff(&self) -> Option<i64> {
        self.lock().last_cutoff
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    async fn check_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn import_shares(&self, shares: &[ShareRecord]) -> Result<()> {
        self.import_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.import_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_imports) {
            return Err(PoolError::Store("injected import failure".to_string()));
        }

        let mut state = self.lock();
        for share in shares {
            let id = state.next_share_id;
            state.next_share_id += 1;

            let owner = state
                .find_by_name(&share.worker_name)
                .unwrap_or(SENTINEL_USER_ID);
            if let Some((user, _)) = state.users.get_mut(&owner) {
                user.record_share(share);
            }
            state.shares.push(StoredShare::new(id, share.clone()));
        }
        state.batch_sizes.push(shares.len());
        debug!("Imported {} shares into memory", shares.len());
        Ok(())
    }

    async fn update_found_block(&self, share: &ShareRecord) -> Result<()> {
        let mut state = self.lock();
        let found = state.shares.iter_mut().find(|s| {
            s.share.worker_name == share.worker_name && s.share.timestamp == share.timestamp
        });
        match found {
            Some(stored) => stored.mark_found(share),
            None => return Ok(()),
        }
        if share.is_valid {
            if let Some(id) = state.find_by_name(&share.worker_name) {
                if let Some((user, _)) = state.users.get_mut(&id) {
                    user.total_found += 1;
                }
            }
        }
        Ok(())
    }

    async fn check_password(&self, username: &str, secret: &str) -> Result<bool> {
        self.password_checks.fetch_add(1, Ordering::SeqCst);
        let digest = secret_digest(&self.salt, secret);
        let state = self.lock();
        Ok(state
            .users
            .values()
            .any(|(u, d)| u.username == username && *d == digest))
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        Ok(self.lock().find_by_name(username).is_some())
    }

    async fn get_user(&self, user: &UserRef) -> Result<Option<User>> {
        let state = self.lock();
        Ok(state
            .find_user(user)
            .and_then(|id| state.users.get(&id))
            .map(|(u, _)| u.clone()))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self
            .lock()
            .users
            .values()
            .filter(|(u, _)| u.id != SENTINEL_USER_ID)
            .map(|(u, _)| u.clone())
            .collect())
    }

    async fn insert_user(&self, username: &str, secret: &str) -> Result<u64> {
        let mut state = self.lock();
        if state.find_by_name(username).is_some() {
            return Err(PoolError::Store(format!("user {} already exists", username)));
        }
        let id = state.next_user_id;
        state.next_user_id += 1;
        state.users.insert(
            id,
            (
                User::new(id, username.to_string()),
                secret_digest(&self.salt, secret),
            ),
        );
        Ok(id)
    }

    async fn update_user(&self, user: &UserRef, secret: &str) -> Result<()> {
        let digest = secret_digest(&self.salt, secret);
        let mut state = self.lock();
        let id = state
            .find_user(user)
            .ok_or_else(|| PoolError::NotFound(format!("user {}", user)))?;
        if let Some((_, stored)) = state.users.get_mut(&id) {
            *stored = digest;
        }
        Ok(())
    }

    async fn delete_user(&self, user: &UserRef) -> Result<()> {
        if user.is_sentinel() {
            return Err(PoolError::ProtectedRecord(format!("cannot delete user {}", user)));
        }
        self.delete_user_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        let Some(id) = state.find_user(user) else {
            return Ok(());
        };
        if let Some((removed, _)) = state.users.remove(&id) {
            for stored in state.shares.iter_mut() {
                if stored.share.worker_name == removed.username {
                    stored.share.worker_name = SENTINEL_USERNAME.to_string();
                }
            }
        }
        Ok(())
    }

    async fn update_worker_difficulty(&self, username: &str, difficulty: f64) -> Result<()> {
        let mut state = self.lock();
        if let Some(id) = state.find_by_name(username) {
            if let Some((user, _)) = state.users.get_mut(&id) {
                user.difficulty = difficulty;
            }
        }
        Ok(())
    }

    async fn clear_worker_difficulty(&self) -> Result<()> {
        for (user, _) in self.lock().users.values_mut() {
            user.difficulty = 0.0;
        }
        Ok(())
    }

    async fn recompute_stats(&self, window: Duration) -> Result<()> {
        self.recompute_calls.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now().timestamp();
        let window_secs = window.as_secs();
        let since = now - window_secs as i64;

        let mut state = self.lock();
        let mut per_worker: BTreeMap<String, f64> = BTreeMap::new();
        let mut shares_in_window = 0;
        for stored in state.shares.iter().filter(|s| s.share.timestamp >= since) {
            shares_in_window += 1;
            if stored.share.is_valid {
                *per_worker.entry(stored.share.worker_name.clone()).or_insert(0.0) +=
                    stored.share.share_diff;
            }
        }

        let mut pool_hashrate = 0;
        let mut workers = 0;
        let mut alive_workers = 0;
        for (user, _) in state.users.values_mut() {
            user.speed = hashrate(per_worker.get(&user.username).copied().unwrap_or(0.0), window_secs);
            user.alive = user.last_checkin.is_some_and(|t| t >= since);
            pool_hashrate += user.speed;
            if user.id != SENTINEL_USER_ID {
                workers += 1;
                if user.alive {
                    alive_workers += 1;
                }
            }
        }

        let stats = &mut state.pool_stats;
        stats.hashrate = pool_hashrate;
        stats.workers = workers;
        stats.alive_workers = alive_workers;
        stats.shares_in_window = shares_in_window;
        stats.window_secs = window_secs;
        stats.updated_at = Some(now);
        Ok(())
    }

    async fn get_pool_stats(&self) -> Result<PoolStats> {
        Ok(self.lock().pool_stats.clone())
    }

    async fn get_worker_stats(&self) -> Result<BTreeMap<String, WorkerStats>> {
        Ok(self
            .lock()
            .users
            .values()
            .filter(|(u, _)| u.id != SENTINEL_USER_ID)
            .map(|(u, _)| (u.username.clone(), u.stats()))
            .collect())
    }

    async fn update_pool_info(&self, info: PoolInfo) -> Result<()> {
        self.lock().pool_stats.info = info;
        Ok(())
    }

    async fn find_archive_cutoff(&self) -> Result<Option<i64>> {
        let cutoff = Utc::now().timestamp() - self.archive_age.as_secs() as i64;
        let state = self.lock();
        Ok(state
            .shares
            .iter()
            .any(|s| s.share.timestamp < cutoff)
            .then_some(cutoff))
    }

    async fn mark_archive_cutoff(&self, cutoff: i64) -> Result<()> {
        self.lock().last_cutoff = Some(cutoff);
        Ok(())
    }

    async fn export_rows_to_secondary_store(&self, cutoff: i64) -> Result<u64> {
        let mut state = self.lock();
        let rows: Vec<StoredShare> = state
            .shares
            .iter()
            .filter(|s| s.share.timestamp < cutoff)
            .cloned()
            .collect();
        let copied = rows.len() as u64;
        for row in rows {
            if !state.archived.iter().any(|a| a.id == row.id) {
                state.archived.push(row);
            }
        }
        Ok(copied)
    }

    async fn stream_rows_older_than(&self, cutoff: i64) -> Result<ArchiveRowStream> {
        let rows: Vec<ArchiveRow> = self
            .lock()
            .shares
            .iter()
            .filter(|s| s.share.timestamp < cutoff)
            .map(StoredShare::archive_row)
            .collect();
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn delete_rows_older_than(&self, cutoff: i64) -> Result<u64> {
        if Self::take_failure(&self.failing_cleanups) {
            return Err(PoolError::Store("injected cleanup failure".to_string()));
        }
        let mut state = self.lock();
        let before = state.shares.len();
        state.shares.retain(|s| s.share.timestamp >= cutoff);
        Ok((before - state.shares.len()) as u64)
    }
}
