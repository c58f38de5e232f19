use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::shares::ShareRecord;

/// Worker id reserved for unattributed shares.
pub const SENTINEL_USER_ID: u64 = 0;
pub const SENTINEL_USERNAME: &str = "0";

/// One archived share rendered in store column order.
pub type ArchiveRow = Vec<String>;

/// Column order of an [`ArchiveRow`].
pub const ARCHIVE_COLUMNS: [&str; 10] = [
    "id",
    "time",
    "rem_host",
    "username",
    "our_result",
    "upstream_result",
    "reason",
    "solution",
    "difficulty",
    "share_diff",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserRef {
    Id(u64),
    Name(String),
}

/// All-digit names would be read back as ids, so workers may not use them.
pub fn is_numeric_name(raw: &str) -> bool {
    !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit())
}

impl UserRef {
    /// All-digit input is an id, anything else a worker name.
    pub fn parse(raw: &str) -> Self {
        if is_numeric_name(raw) {
            if let Ok(id) = raw.parse() {
                return UserRef::Id(id);
            }
        }
        UserRef::Name(raw.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        match self {
            UserRef::Id(id) => *id == SENTINEL_USER_ID,
            UserRef::Name(name) => name == SENTINEL_USERNAME,
        }
    }

    pub fn matches(&self, user: &User) -> bool {
        match self {
            UserRef::Id(id) => user.id == *id,
            UserRef::Name(name) => user.username == *name,
        }
    }
}

impl std::fmt::Display for UserRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRef::Id(id) => write!(f, "{}", id),
            UserRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub difficulty: f64,
    pub speed: u64,
    pub last_checkin: Option<i64>,
    pub total_shares: u64,
    pub total_rejects: u64,
    pub total_found: u64,
    pub alive: bool,
}

impl User {
    pub fn new(id: u64, username: String) -> Self {
        Self {
            id,
            username,
            difficulty: 0.0,
            speed: 0,
            last_checkin: None,
            total_shares: 0,
            total_rejects: 0,
            total_found: 0,
            alive: false,
        }
    }

    pub fn sentinel() -> Self {
        Self::new(SENTINEL_USER_ID, SENTINEL_USERNAME.to_string())
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            username: self.username.clone(),
            speed: self.speed,
            last_checkin: self.last_checkin,
            total_shares: self.total_shares,
            total_rejects: self.total_rejects,
            total_found: self.total_found,
            alive: self.alive,
            difficulty: self.difficulty,
        }
    }

    /// Count one imported share against this worker.
    pub fn record_share(&mut self, share: &ShareRecord) {
        if share.is_valid {
            self.total_shares += 1;
        } else {
            self.total_rejects += 1;
        }
        self.last_checkin = Some(self.last_checkin.map_or(share.timestamp, |t| t.max(share.timestamp)));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub username: String,
    pub speed: u64,
    pub last_checkin: Option<i64>,
    pub total_shares: u64,
    pub total_rejects: u64,
    pub total_found: u64,
    pub alive: bool,
    pub difficulty: f64,
}

/// Node fields merged into the pool record once per stats cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub blocks: u64,
    pub balance: f64,
    pub connections: u64,
    pub difficulty: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub hashrate: u64,
    pub workers: u64,
    pub alive_workers: u64,
    pub shares_in_window: u64,
    pub window_secs: u64,
    pub updated_at: Option<i64>,
    pub info: PoolInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredShare {
    pub id: u64,
    pub share: ShareRecord,
    pub upstream_result: bool,
    pub solution: String,
}

impl StoredShare {
    pub fn new(id: u64, share: ShareRecord) -> Self {
        let solution = share.block_hash.clone();
        Self {
            id,
            share,
            upstream_result: false,
            solution,
        }
    }

    pub fn archive_row(&self) -> ArchiveRow {
        vec![
            self.id.to_string(),
            self.share.timestamp.to_string(),
            self.share.ip.clone(),
            self.share.worker_name.clone(),
            yes_no(self.share.is_valid).to_string(),
            yes_no(self.upstream_result).to_string(),
            self.share.invalid_reason.clone(),
            self.solution.clone(),
            self.share.difficulty.to_string(),
            self.share.share_diff.to_string(),
        ]
    }

    /// Apply a found-block update; the caller matched worker and time.
    pub fn mark_found(&mut self, found: &ShareRecord) {
        self.upstream_result = found.is_valid;
        self.solution = found.block_hash.clone();
    }
}

pub fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Y"
    } else {
        "N"
    }
}

/// Salted digest stored in place of a worker secret.
pub fn secret_digest(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hashrate estimate from summed share difficulty over a window.
pub fn hashrate(total_share_diff: f64, window_secs: u64) -> u64 {
    if window_secs == 0 {
        return 0;
    }
    (total_share_diff * 4_294_967_296.0 / window_secs as f64) as u64
}
