use serde::{Deserialize, Serialize};

/// One proof-of-work submission from a worker, valid or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub worker_name: String,
    pub block_header: String,
    pub block_hash: String,
    pub difficulty: f64,
    pub timestamp: i64,
    pub is_valid: bool,
    pub ip: String,
    pub block_height: u64,
    pub prev_hash: String,
    /// Empty for valid shares.
    pub invalid_reason: String,
    pub share_diff: f64,
}

impl ShareRecord {
    pub fn valid(worker_name: &str, timestamp: i64, share_diff: f64) -> Self {
        Self {
            worker_name: worker_name.to_string(),
            block_header: String::new(),
            block_hash: String::new(),
            difficulty: share_diff,
            timestamp,
            is_valid: true,
            ip: String::new(),
            block_height: 0,
            prev_hash: String::new(),
            invalid_reason: String::new(),
            share_diff,
        }
    }

    pub fn rejected(worker_name: &str, timestamp: i64, reason: &str) -> Self {
        Self {
            is_valid: false,
            invalid_reason: reason.to_string(),
            ..Self::valid(worker_name, timestamp, 0.0)
        }
    }
}
