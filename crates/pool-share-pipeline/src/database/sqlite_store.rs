use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::schema::*;
use super::{ArchiveRowStream, Storage};
use crate::config::StorageSettings;
use crate::error::{PoolError, Result};
use crate::shares::ShareRecord;

const REQUIRED_TABLES: [&str; 4] = ["shares", "shares_archive", "pool_worker", "pool"];

/// Rows fetched per blocking call while streaming an archive.
const STREAM_PAGE_SIZE: i64 = 500;

const USER_COLUMNS: &str = "id, username, difficulty, speed, last_checkin, \
     total_shares, total_rejects, total_found, alive";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS shares (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        time INTEGER NOT NULL,
        rem_host TEXT NOT NULL,
        username TEXT NOT NULL,
        our_result TEXT NOT NULL,
        upstream_result TEXT NOT NULL DEFAULT 'N',
        reason TEXT NOT NULL,
        solution TEXT NOT NULL,
        difficulty REAL NOT NULL,
        share_diff REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_shares_time ON shares(time);
    CREATE INDEX IF NOT EXISTS idx_shares_username ON shares(username, time);
    CREATE TABLE IF NOT EXISTS shares_archive (
        id INTEGER PRIMARY KEY,
        time INTEGER NOT NULL,
        rem_host TEXT NOT NULL,
        username TEXT NOT NULL,
        our_result TEXT NOT NULL,
        upstream_result TEXT NOT NULL,
        reason TEXT NOT NULL,
        solution TEXT NOT NULL,
        difficulty REAL NOT NULL,
        share_diff REAL NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pool_worker (
        id INTEGER PRIMARY KEY,
        username TEXT UNIQUE NOT NULL,
        password TEXT NOT NULL,
        difficulty REAL NOT NULL DEFAULT 0,
        speed INTEGER NOT NULL DEFAULT 0,
        last_checkin INTEGER,
        total_shares INTEGER NOT NULL DEFAULT 0,
        total_rejects INTEGER NOT NULL DEFAULT 0,
        total_found INTEGER NOT NULL DEFAULT 0,
        alive INTEGER NOT NULL DEFAULT 0
    );
    INSERT OR IGNORE INTO pool_worker (id, username, password) VALUES (0, '0', '');
    CREATE TABLE IF NOT EXISTS pool (
        parameter TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// SQLite-backed store. Every call runs on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    salt: String,
    archive_age: Duration,
}

impl SqliteStore {
    pub async fn open(settings: &StorageSettings) -> Result<Self> {
        let path = settings.sqlite_path.clone();
        let create_schema = settings.create_schema;

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            if create_schema {
                conn.execute_batch(SCHEMA)?;
            }
            Ok(conn)
        })
        .await??;

        info!("SQLite store opened at {}", settings.sqlite_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            salt: settings.password_salt.clone(),
            archive_age: settings.archive_age,
        })
    }

    pub fn path_settings(path: &Path) -> StorageSettings {
        StorageSettings {
            sqlite_path: path.to_path_buf(),
            ..StorageSettings::default()
        }
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut guard)
        })
        .await?
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get::<_, i64>(0)? as u64,
        username: row.get(1)?,
        difficulty: row.get(2)?,
        speed: row.get::<_, i64>(3)? as u64,
        last_checkin: row.get(4)?,
        total_shares: row.get::<_, i64>(5)? as u64,
        total_rejects: row.get::<_, i64>(6)? as u64,
        total_found: row.get::<_, i64>(7)? as u64,
        alive: row.get(8)?,
    })
}

fn archive_row_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, ArchiveRow)> {
    let id: i64 = row.get(0)?;
    let time: i64 = row.get(1)?;
    let difficulty: f64 = row.get(8)?;
    let share_diff: f64 = row.get(9)?;
    Ok((
        id,
        vec![
            id.to_string(),
            time.to_string(),
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            difficulty.to_string(),
            share_diff.to_string(),
        ],
    ))
}

fn find_user(conn: &Connection, user: &UserRef) -> rusqlite::Result<Option<User>> {
    match user {
        UserRef::Id(id) => conn
            .query_row(
                &format!("SELECT {} FROM pool_worker WHERE id = ?1", USER_COLUMNS),
                params![*id as i64],
                user_from_row,
            )
            .optional(),
        UserRef::Name(name) => conn
            .query_row(
                &format!("SELECT {} FROM pool_worker WHERE username = ?1", USER_COLUMNS),
                params![name],
                user_from_row,
            )
            .optional(),
    }
}

fn load_pool_stats(conn: &Connection) -> Result<PoolStats> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM pool WHERE parameter = 'stats'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(PoolStats::default()),
    }
}

fn save_pool_stats(conn: &Connection, stats: &PoolStats) -> Result<()> {
    conn.execute(
        "INSERT INTO pool (parameter, value) VALUES ('stats', ?1)
         ON CONFLICT(parameter) DO UPDATE SET value = excluded.value",
        params![serde_json::to_string(stats)?],
    )?;
    Ok(())
}

#[async_trait]
impl Storage for SqliteStore {
    fn driver_name(&self) -> &'static str {
        "sqlite"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    async fn check_schema(&self) -> Result<()> {
        debug!("Checking database");
        self.with_conn(|conn| {
            for table in REQUIRED_TABLES {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |row| row.get(0),
                )?;
                if count == 0 {
                    return Err(PoolError::Schema(format!(
                        "There is no {} table. Have you imported the schema?",
                        table
                    )));
                }
            }
            Ok(())
        })
        .await
    }

    async fn import_shares(&self, shares: &[ShareRecord]) -> Result<()> {
        let shares = shares.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for share in &shares {
                tx.execute(
                    "INSERT INTO shares
                     (time, rem_host, username, our_result, upstream_result,
                      reason, solution, difficulty, share_diff)
                     VALUES (?1, ?2, ?3, ?4, 'N', ?5, ?6, ?7, ?8)",
                    params![
                        share.timestamp,
                        share.ip,
                        share.worker_name,
                        yes_no(share.is_valid),
                        share.invalid_reason,
                        share.block_hash,
                        share.difficulty,
                        share.share_diff,
                    ],
                )?;

                let (accepted, rejected) = if share.is_valid { (1, 0) } else { (0, 1) };
                let counters = "UPDATE pool_worker
                     SET total_shares = total_shares + ?1,
                         total_rejects = total_rejects + ?2,
                         last_checkin = MAX(COALESCE(last_checkin, ?3), ?3)";
                let updated = tx.execute(
                    &format!("{} WHERE username = ?4", counters),
                    params![accepted, rejected, share.timestamp, share.worker_name],
                )?;
                if updated == 0 {
                    tx.execute(
                        &format!("{} WHERE id = ?4", counters),
                        params![accepted, rejected, share.timestamp, SENTINEL_USER_ID as i64],
                    )?;
                }
            }
            tx.commit()?;
            debug!("Imported {} shares into SQLite", shares.len());
            Ok(())
        })
        .await
    }

    async fn update_found_block(&self, share: &ShareRecord) -> Result<()> {
        let share = share.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE shares SET upstream_result = ?1, solution = ?2
                 WHERE id = (SELECT id FROM shares WHERE time = ?3 AND username = ?4
                             ORDER BY id LIMIT 1)",
                params![
                    yes_no(share.is_valid),
                    share.block_hash,
                    share.timestamp,
                    share.worker_name
                ],
            )?;
            if updated > 0 && share.is_valid {
                tx.execute(
                    "UPDATE pool_worker SET total_found = total_found + 1 WHERE username = ?1",
                    params![share.worker_name],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn check_password(&self, username: &str, secret: &str) -> Result<bool> {
        debug!("Checking username/password for {}", username);
        let username = username.to_string();
        let digest = secret_digest(&self.salt, secret);
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pool_worker WHERE username = ?1 AND password = ?2",
                params![username, digest],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        let user = UserRef::Name(username.to_string());
        Ok(self.get_user(&user).await?.is_some())
    }

    async fn get_user(&self, user: &UserRef) -> Result<Option<User>> {
        let user = user.clone();
        self.with_conn(move |conn| Ok(find_user(conn, &user)?)).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pool_worker WHERE id > 0 ORDER BY id",
                USER_COLUMNS
            ))?;
            let users = stmt
                .query_map([], user_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    async fn insert_user(&self, username: &str, secret: &str) -> Result<u64> {
        debug!("Adding new user {}", username);
        let username = username.to_string();
        let digest = secret_digest(&self.salt, secret);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO pool_worker (username, password) VALUES (?1, ?2)",
                params![username, digest],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn update_user(&self, user: &UserRef, secret: &str) -> Result<()> {
        debug!("Updating password for user {}", user);
        let user = user.clone();
        let digest = secret_digest(&self.salt, secret);
        self.with_conn(move |conn| {
            let updated = match &user {
                UserRef::Id(id) => conn.execute(
                    "UPDATE pool_worker SET password = ?1 WHERE id = ?2",
                    params![digest, *id as i64],
                )?,
                UserRef::Name(name) => conn.execute(
                    "UPDATE pool_worker SET password = ?1 WHERE username = ?2",
                    params![digest, name],
                )?,
            };
            if updated == 0 {
                return Err(PoolError::NotFound(format!("user {}", user)));
            }
            Ok(())
        })
        .await
    }

    async fn delete_user(&self, user: &UserRef) -> Result<()> {
        if user.is_sentinel() {
            return Err(PoolError::ProtectedRecord(format!("cannot delete user {}", user)));
        }
        debug!("Deleting user with id or username of {}", user);
        let user = user.clone();
        self.with_conn(move |conn| {
            let Some(existing) = find_user(conn, &user)? else {
                return Ok(());
            };
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE shares SET username = ?1 WHERE username = ?2",
                params![SENTINEL_USERNAME, existing.username],
            )?;
            tx.execute(
                "DELETE FROM pool_worker WHERE id = ?1",
                params![existing.id as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_worker_difficulty(&self, username: &str, difficulty: f64) -> Result<()> {
        debug!("Setting difficulty for {} to {}", username, difficulty);
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE pool_worker SET difficulty = ?1 WHERE username = ?2",
                params![difficulty, username],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_worker_difficulty(&self) -> Result<()> {
        debug!("Resetting difficulty for all workers");
        self.with_conn(|conn| {
            conn.execute("UPDATE pool_worker SET difficulty = 0", [])?;
            Ok(())
        })
        .await
    }

    async fn recompute_stats(&self, window: Duration) -> Result<()> {
        let now = Utc::now().timestamp();
        let window_secs = window.as_secs();
        let since = now - window_secs as i64;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let per_worker: BTreeMap<String, f64> = {
                let mut stmt = tx.prepare(
                    "SELECT username, SUM(share_diff) FROM shares
                     WHERE time >= ?1 AND our_result = 'Y' GROUP BY username",
                )?;
                let rows = stmt
                    .query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<BTreeMap<String, f64>>>()?;
                rows
            };
            let shares_in_window: i64 = tx.query_row(
                "SELECT COUNT(*) FROM shares WHERE time >= ?1",
                params![since],
                |row| row.get(0),
            )?;

            let users: Vec<User> = {
                let mut stmt = tx.prepare(&format!("SELECT {} FROM pool_worker", USER_COLUMNS))?;
                let users = stmt
                    .query_map([], user_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                users
            };

            let mut stats = load_pool_stats(&tx)?;
            stats.hashrate = 0;
            stats.workers = 0;
            stats.alive_workers = 0;
            for user in &users {
                let speed = hashrate(
                    per_worker.get(&user.username).copied().unwrap_or(0.0),
                    window_secs,
                );
                let alive = user.last_checkin.is_some_and(|t| t >= since);
                tx.execute(
                    "UPDATE pool_worker SET speed = ?1, alive = ?2 WHERE id = ?3",
                    params![speed as i64, alive, user.id as i64],
                )?;
                stats.hashrate += speed;
                if user.id != SENTINEL_USER_ID {
                    stats.workers += 1;
                    if alive {
                        stats.alive_workers += 1;
                    }
                }
            }
            stats.shares_in_window = shares_in_window as u64;
            stats.window_secs = window_secs;
            stats.updated_at = Some(now);
            save_pool_stats(&tx, &stats)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_pool_stats(&self) -> Result<PoolStats> {
        self.with_conn(|conn| load_pool_stats(conn)).await
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
        self.with_conn(move |conn| {
            let mut stats = load_pool_stats(conn)?;
            stats.info = info;
            save_pool_stats(conn, &stats)
        })
        .await
    }

    async fn find_archive_cutoff(&self) -> Result<Option<i64>> {
        let cutoff = Utc::now().timestamp() - self.archive_age.as_secs() as i64;
        self.with_conn(move |conn| {
            let eligible: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM shares WHERE time < ?1)",
                params![cutoff],
                |row| row.get(0),
            )?;
            Ok(eligible.then_some(cutoff))
        })
        .await
    }

    async fn mark_archive_cutoff(&self, cutoff: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO pool (parameter, value) VALUES ('archive_cutoff', ?1)
                 ON CONFLICT(parameter) DO UPDATE SET value = excluded.value",
                params![cutoff.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn export_rows_to_secondary_store(&self, cutoff: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let copied = conn.execute(
                "INSERT OR IGNORE INTO shares_archive
                 SELECT id, time, rem_host, username, our_result, upstream_result,
                        reason, solution, difficulty, share_diff
                 FROM shares WHERE time < ?1",
                params![cutoff],
            )?;
            Ok(copied as u64)
        })
        .await
    }

    async fn stream_rows_older_than(&self, cutoff: i64) -> Result<ArchiveRowStream> {
        let conn = self.conn.clone();
        // Pages are keyed on id so a restarted stream begins at the first row again.
        let pages = stream::unfold(Some(0i64), move |after| {
            let conn = conn.clone();
            async move {
                let after = after?;
                let page = tokio::task::spawn_blocking(move || -> Result<Vec<(i64, ArchiveRow)>> {
                    let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
                    let mut stmt = guard.prepare(
                        "SELECT id, time, rem_host, username, our_result, upstream_result,
                                reason, solution, difficulty, share_diff
                         FROM shares WHERE time < ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![cutoff, after, STREAM_PAGE_SIZE], archive_row_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                })
                .await
                .map_err(PoolError::from)
                .and_then(|page| page);

                match page {
                    Ok(rows) if rows.is_empty() => None,
                    Ok(rows) => {
                        let next = rows.last().map(|(id, _)| *id);
                        let items: Vec<Result<ArchiveRow>> =
                            rows.into_iter().map(|(_, row)| Ok(row)).collect();
                        Some((items, next))
                    }
                    Err(e) => Some((vec![Err(e)], None)),
                }
            }
        });
        Ok(pages.flat_map(stream::iter).boxed())
    }

    async fn delete_rows_older_than(&self, cutoff: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM shares WHERE time < ?1", params![cutoff])?;
            Ok(deleted as u64)
        })
        .await
    }
}
