use super::schema::*;
use super::{ArchiveRowStream, Storage};
use crate::config::StorageSettings;
use crate::error::{PoolError, Result};
use crate::shares::ShareRecord;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

const SHARE_WINDOW_KEY: &str = "shares:window";
const SHARE_ARCHIVE_KEY: &str = "shares:archive";
const SHARE_NEXT_ID_KEY: &str = "share:next_id";
const USERS_KEY: &str = "users";
const USER_NEXT_ID_KEY: &str = "user:next_id";
const POOL_STATS_KEY: &str = "pool:stats";
const ARCHIVE_CUTOFF_KEY: &str = "archive:cutoff";

/// Share ids read per round trip while streaming an archive.
const STREAM_PAGE_SIZE: isize = 500;

fn share_key(id: u64) -> String {
    format!("share:{}", id)
}

fn archived_share_key(id: u64) -> String {
    format!("archive:share:{}", id)
}

fn user_key(id: u64) -> String {
    format!("user:{}", id)
}

fn worker_shares_key(username: &str) -> String {
    format!("shares:worker:{}", username)
}

/// Shares of unknown workers are indexed under the sentinel, whose index is
/// pruned with every other registered worker's.
fn index_name(worker_name: &str, owner: u64) -> &str {
    if owner == SENTINEL_USER_ID {
        SENTINEL_USERNAME
    } else {
        worker_name
    }
}

/// Redis keyspace: shares as JSON blobs indexed by time in a sorted set,
/// workers as hashes indexed by name.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    salt: String,
    archive_age: Duration,
}

impl RedisStore {
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;

        let store = Self {
            conn,
            salt: settings.password_salt.clone(),
            archive_age: settings.archive_age,
        };
        if settings.create_schema {
            store.ensure_sentinel().await?;
        }
        info!("Redis store connected to {}", settings.redis_url);
        Ok(store)
    }

    async fn ensure_sentinel(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: bool = conn
            .hset_nx(USERS_KEY, SENTINEL_USERNAME, SENTINEL_USER_ID)
            .await?;
        if created {
            let _: () = conn
                .hset_multiple(
                    user_key(SENTINEL_USER_ID),
                    &user_fields(&User::sentinel(), "")[..],
                )
                .await?;
            debug!("Created sentinel worker record");
        }
        Ok(())
    }

    // Worker lookups
    async fn resolve_user(&self, user: &UserRef) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        match user {
            UserRef::Id(id) => {
                let exists: bool = conn.exists(user_key(*id)).await?;
                Ok(exists.then_some(*id))
            }
            UserRef::Name(name) => Ok(conn.hget(USERS_KEY, name).await?),
        }
    }

    async fn load_user(&self, id: u64) -> Result<Option<User>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(user_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(user_from_fields(id, &fields)))
    }

    async fn user_ids(&self) -> Result<Vec<(String, u64)>> {
        let mut conn = self.conn.clone();
        let users: HashMap<String, u64> = conn.hgetall(USERS_KEY).await?;
        let mut users: Vec<(String, u64)> = users.into_iter().collect();
        users.sort_by_key(|(_, id)| *id);
        Ok(users)
    }

    // Share lookups
    async fn load_shares(&self, ids: &[u64]) -> Result<Vec<StoredShare>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ids.iter().map(|id| share_key(*id)).collect();
        let blobs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut shares = Vec::with_capacity(blobs.len());
        for json in blobs.into_iter().flatten() {
            shares.push(serde_json::from_str(&json)?);
        }
        Ok(shares)
    }

    async fn share_ids_older_than(&self, cutoff: i64) -> Result<Vec<u64>> {
        let mut conn = self.conn.clone();
        Ok(conn
            .zrangebyscore(SHARE_WINDOW_KEY, "-inf", format!("({}", cutoff))
            .await?)
    }

    async fn save_pool_stats(&self, stats: &PoolStats) -> Result<()> {
        let json = serde_json::to_string(stats)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(POOL_STATS_KEY, json).await?;
        Ok(())
    }
}

fn user_fields(user: &User, digest: &str) -> Vec<(&'static str, String)> {
    vec![
        ("username", user.username.clone()),
        ("password", digest.to_string()),
        ("difficulty", user.difficulty.to_string()),
        ("speed", user.speed.to_string()),
        ("total_shares", user.total_shares.to_string()),
        ("total_rejects", user.total_rejects.to_string()),
        ("total_found", user.total_found.to_string()),
        ("alive", u8::from(user.alive).to_string()),
    ]
}

fn user_from_fields(id: u64, fields: &HashMap<String, String>) -> User {
    fn num<T: std::str::FromStr + Default>(fields: &HashMap<String, String>, name: &str) -> T {
        fields
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    User {
        id,
        username: fields.get("username").cloned().unwrap_or_default(),
        difficulty: num(fields, "difficulty"),
        speed: num(fields, "speed"),
        last_checkin: fields.get("last_checkin").and_then(|v| v.parse().ok()),
        total_shares: num(fields, "total_shares"),
        total_rejects: num(fields, "total_rejects"),
        total_found: num(fields, "total_found"),
        alive: num::<u8>(fields, "alive") == 1,
    }
}

#[async_trait]
impl Storage for RedisStore {
    fn driver_name(&self) -> &'static str {
        "redis"
    }

    async fn check_schema(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(user_key(SENTINEL_USER_ID)).await?;
        if !exists {
            return Err(PoolError::Schema(
                "sentinel worker record is missing from redis".to_string(),
            ));
        }
        Ok(())
    }

    // Share operations
    async fn import_shares(&self, shares: &[ShareRecord]) -> Result<()> {
        if shares.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();

        // Ids are reserved up front; a failed batch only leaves a gap.
        let last_id: u64 = conn.incr(SHARE_NEXT_ID_KEY, shares.len() as u64).await?;
        let first_id = last_id + 1 - shares.len() as u64;

        let mut owners: HashMap<String, u64> = HashMap::new();
        for share in shares {
            if !owners.contains_key(&share.worker_name) {
                let id: Option<u64> = conn.hget(USERS_KEY, &share.worker_name).await?;
                owners.insert(share.worker_name.clone(), id.unwrap_or(SENTINEL_USER_ID));
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut checkins: HashMap<u64, i64> = HashMap::new();
        for (offset, share) in shares.iter().enumerate() {
            let id = first_id + offset as u64;
            let stored = StoredShare::new(id, share.clone());
            pipe.set(share_key(id), serde_json::to_string(&stored)?).ignore();
            pipe.zadd(SHARE_WINDOW_KEY, id, share.timestamp).ignore();

            let owner = owners[&share.worker_name];
            pipe.zadd(
                worker_shares_key(index_name(&share.worker_name, owner)),
                id,
                share.timestamp,
            )
            .ignore();
            let counter = if share.is_valid { "total_shares" } else { "total_rejects" };
            pipe.hincr(user_key(owner), counter, 1).ignore();
            let checkin = checkins.entry(owner).or_insert(share.timestamp);
            *checkin = (*checkin).max(share.timestamp);
        }
        for (owner, checkin) in checkins {
            pipe.hset(user_key(owner), "last_checkin", checkin).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        debug!("Imported {} shares into redis", shares.len());
        Ok(())
    }

    async fn update_found_block(&self, share: &ShareRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let owner = self
            .resolve_user(&UserRef::Name(share.worker_name.clone()))
            .await?;
        let index = index_name(&share.worker_name, owner.unwrap_or(SENTINEL_USER_ID));
        let ids: Vec<u64> = conn
            .zrangebyscore(worker_shares_key(index), share.timestamp, share.timestamp)
            .await?;
        let Some(mut stored) = self
            .load_shares(&ids)
            .await?
            .into_iter()
            .find(|s| s.share.worker_name == share.worker_name)
        else {
            return Ok(());
        };
        stored.mark_found(share);
        let _: () = conn
            .set(share_key(stored.id), serde_json::to_string(&stored)?)
            .await?;

        if share.is_valid {
            if let Some(owner) = owner {
                let _: () = conn.hincr(user_key(owner), "total_found", 1).await?;
            }
        }
        Ok(())
    }

    // Worker operations
    async fn check_password(&self, username: &str, secret: &str) -> Result<bool> {
        debug!("Checking username/password for {}", username);
        let Some(id) = self.resolve_user(&UserRef::Name(username.to_string())).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let stored: Option<String> = conn.hget(user_key(id), "password").await?;
        Ok(stored.is_some_and(|d| d == secret_digest(&self.salt, secret)))
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.hexists(USERS_KEY, username).await?)
    }

    async fn get_user(&self, user: &UserRef) -> Result<Option<User>> {
        debug!("Finding user with id or username of {}", user);
        match self.resolve_user(user).await? {
            Some(id) => self.load_user(id).await,
            None => Ok(None),
        }
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users = Vec::new();
        for (_, id) in self.user_ids().await? {
            if id == SENTINEL_USER_ID {
                continue;
            }
            if let Some(user) = self.load_user(id).await? {
                users.push(user);
            }
        }
        Ok(users)
    }

    async fn insert_user(&self, username: &str, secret: &str) -> Result<u64> {
        debug!("Adding new user {}", username);
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(USER_NEXT_ID_KEY, 1).await?;

        let claimed: bool = conn.hset_nx(USERS_KEY, username, id).await?;
        if !claimed {
            return Err(PoolError::Store(format!("user {} already exists", username)));
        }
        let user = User::new(id, username.to_string());
        let _: () = conn
            .hset_multiple(
                user_key(id),
                &user_fields(&user, &secret_digest(&self.salt, secret))[..],
            )
            .await?;
        Ok(id)
    }

    async fn update_user(&self, user: &UserRef, secret: &str) -> Result<()> {
        debug!("Updating password for user {}", user);
        let id = self
            .resolve_user(user)
            .await?
            .ok_or_else(|| PoolError::NotFound(format!("user {}", user)))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(user_key(id), "password", secret_digest(&self.salt, secret))
            .await?;
        Ok(())
    }

    async fn delete_user(&self, user: &UserRef) -> Result<()> {
        if user.is_sentinel() {
            return Err(PoolError::ProtectedRecord(format!("cannot delete user {}", user)));
        }
        debug!("Deleting user with id or username of {}", user);
        let Some(id) = self.resolve_user(user).await? else {
            return Ok(());
        };
        let Some(existing) = self.load_user(id).await? else {
            return Ok(());
        };

        let mut conn = self.conn.clone();
        let owned_key = worker_shares_key(&existing.username);
        let owned: Vec<(u64, i64)> = conn.zrange_withscores(&owned_key, 0, -1).await?;
        let ids: Vec<u64> = owned.iter().map(|(id, _)| *id).collect();
        let shares = self.load_shares(&ids).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for mut stored in shares {
            stored.share.worker_name = SENTINEL_USERNAME.to_string();
            pipe.set(share_key(stored.id), serde_json::to_string(&stored)?)
                .ignore();
        }
        for (share_id, ts) in &owned {
            pipe.zadd(worker_shares_key(SENTINEL_USERNAME), *share_id, *ts)
                .ignore();
        }
        pipe.del(&owned_key).ignore();
        pipe.del(user_key(id)).ignore();
        pipe.hdel(USERS_KEY, &existing.username).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn update_worker_difficulty(&self, username: &str, difficulty: f64) -> Result<()> {
        debug!("Setting difficulty for {} to {}", username, difficulty);
        if let Some(id) = self.resolve_user(&UserRef::Name(username.to_string())).await? {
            let mut conn = self.conn.clone();
            let _: () = conn.hset(user_key(id), "difficulty", difficulty).await?;
        }
        Ok(())
    }

    async fn clear_worker_difficulty(&self) -> Result<()> {
        debug!("Resetting difficulty for all workers");
        let mut pipe = redis::pipe();
        for (_, id) in self.user_ids().await? {
            pipe.hset(user_key(id), "difficulty", 0).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    // Pool stats
    async fn recompute_stats(&self, window: Duration) -> Result<()> {
        let now = Utc::now().timestamp();
        let window_secs = window.as_secs();
        let since = now - window_secs as i64;

        let mut conn = self.conn.clone();
        let ids: Vec<u64> = conn.zrangebyscore(SHARE_WINDOW_KEY, since, "+inf").await?;
        let shares = self.load_shares(&ids).await?;

        let mut per_worker: HashMap<String, f64> = HashMap::new();
        for stored in shares.iter().filter(|s| s.share.is_valid) {
            *per_worker.entry(stored.share.worker_name.clone()).or_insert(0.0) +=
                stored.share.share_diff;
        }

        let mut stats = self.get_pool_stats().await?;
        stats.hashrate = 0;
        stats.workers = 0;
        stats.alive_workers = 0;

        let mut pipe = redis::pipe();
        for (name, id) in self.user_ids().await? {
            let Some(user) = self.load_user(id).await? else {
                continue;
            };
            let speed = hashrate(per_worker.get(&name).copied().unwrap_or(0.0), window_secs);
            let alive = user.last_checkin.is_some_and(|t| t >= since);
            pipe.hset(user_key(id), "speed", speed).ignore();
            pipe.hset(user_key(id), "alive", u8::from(alive)).ignore();

            stats.hashrate += speed;
            if id != SENTINEL_USER_ID {
                stats.workers += 1;
                if alive {
                    stats.alive_workers += 1;
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;

        stats.shares_in_window = ids.len() as u64;
        stats.window_secs = window_secs;
        stats.updated_at = Some(now);
        self.save_pool_stats(&stats).await
    }

    async fn get_pool_stats(&self) -> Result<PoolStats> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(POOL_STATS_KEY).await?;

        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(PoolStats::default()),
        }
    }

    async fn get_worker_stats(&self) -> Result<BTreeMap<String, WorkerStats>> {
        Ok(self
            .list_users()
            .await?
            .into_iter()
            .map(|u| (u.username.clone(), u.stats()))
            .collect())
    }

    async fn update_pool_info(&self, info: PoolInfo) -> Result<()> {
        let mut stats = self.get_pool_stats().await?;
        stats.info = info;
        self.save_pool_stats(&stats).await
    }

    // Archive operations
    async fn find_archive_cutoff(&self) -> Result<Option<i64>> {
        let cutoff = Utc::now().timestamp() - self.archive_age.as_secs() as i64;
        let mut conn = self.conn.clone();
        let eligible: u64 = conn
            .zcount(SHARE_WINDOW_KEY, "-inf", format!("({}", cutoff))
            .await?;
        Ok((eligible > 0).then_some(cutoff))
    }

    async fn mark_archive_cutoff(&self, cutoff: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(ARCHIVE_CUTOFF_KEY, cutoff).await?;
        Ok(())
    }

    async fn export_rows_to_secondary_store(&self, cutoff: i64) -> Result<u64> {
        let ids = self.share_ids_older_than(cutoff).await?;
        let shares = self.load_shares(&ids).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for stored in &shares {
            pipe.set(archived_share_key(stored.id), serde_json::to_string(stored)?)
                .ignore();
            pipe.zadd(SHARE_ARCHIVE_KEY, stored.id, stored.share.timestamp)
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(shares.len() as u64)
    }

    async fn stream_rows_older_than(&self, cutoff: i64) -> Result<ArchiveRowStream> {
        let store = self.clone();
        let upper = format!("({}", cutoff);
        let pages = stream::unfold(Some(0isize), move |offset| {
            let store = store.clone();
            let upper = upper.clone();
            async move {
                let offset = offset?;
                let mut conn = store.conn.clone();
                let page: Result<Vec<StoredShare>> = async {
                    let ids: Vec<u64> = conn
                        .zrangebyscore_limit(SHARE_WINDOW_KEY, "-inf", upper, offset, STREAM_PAGE_SIZE)
                        .await?;
                    store.load_shares(&ids).await
                }
                .await;

                match page {
                    Ok(shares) if shares.is_empty() => None,
                    Ok(shares) => {
                        let next = offset + STREAM_PAGE_SIZE;
                        let rows: Vec<Result<ArchiveRow>> =
                            shares.iter().map(|s| Ok(s.archive_row())).collect();
                        Some((rows, Some(next)))
                    }
                    Err(e) => Some((vec![Err(e)], None)),
                }
            }
        });
        Ok(pages.flat_map(stream::iter).boxed())
    }

    async fn delete_rows_older_than(&self, cutoff: i64) -> Result<u64> {
        let ids = self.share_ids_older_than(cutoff).await?;
        let upper = format!("({}", cutoff);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.del(share_key(*id)).ignore();
        }
        pipe.zrembyscore(SHARE_WINDOW_KEY, "-inf", &upper).ignore();
        for (name, _) in self.user_ids().await? {
            pipe.zrembyscore(worker_shares_key(&name), "-inf", &upper)
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!("Cleaned up {} old shares", ids.len());
        Ok(ids.len() as u64)
    }
}
