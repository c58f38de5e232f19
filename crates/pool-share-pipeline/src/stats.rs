use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::StatsConfig;
use crate::database::{PoolInfo, Storage};
use crate::error::{PoolError, Result};

/// Source of the node figures merged into the pool record.
#[async_trait]
pub trait NodeStatusOracle: Send + Sync {
    async fn node_info(&self) -> Result<PoolInfo>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GetInfo {
    #[serde(default)]
    blocks: u64,
    #[serde(default)]
    balance: f64,
    #[serde(default)]
    connections: u64,
    #[serde(default)]
    difficulty: f64,
}

/// `getinfo` over the coin daemon's JSON-RPC interface.
pub struct RpcNodeOracle {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl RpcNodeOracle {
    pub fn new(url: &str, username: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[async_trait]
impl NodeStatusOracle for RpcNodeOracle {
    async fn node_info(&self) -> Result<PoolInfo> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: "pool",
            method: "getinfo",
            params: Vec::new(),
        };

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: RpcResponse<GetInfo> = response.json().await?;

        if let Some(err) = body.error.filter(|e| !e.is_null()) {
            return Err(PoolError::NodeStatus(format!("getinfo failed: {}", err)));
        }
        let info = body
            .result
            .ok_or_else(|| PoolError::NodeStatus("getinfo returned no result".to_string()))?;

        Ok(PoolInfo {
            blocks: info.blocks,
            balance: info.balance,
            connections: info.connections,
            difficulty: info.difficulty,
        })
    }
}

/// What one stats run managed to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub recomputed: bool,
    pub pool_info_merged: bool,
}

/// Periodic recompute of worker and pool statistics.
pub struct StatsCycle {
    storage: Arc<dyn Storage>,
    oracle: Option<Arc<dyn NodeStatusOracle>>,
    interval: Duration,
    next_due: Mutex<Instant>,
}

impl StatsCycle {
    pub fn new(
        storage: Arc<dyn Storage>,
        oracle: Option<Arc<dyn NodeStatusOracle>>,
        config: &StatsConfig,
    ) -> Self {
        Self {
            storage,
            oracle,
            interval: config.interval,
            // First check after startup runs immediately.
            next_due: Mutex::new(Instant::now()),
        }
    }

    fn claim_run(&self) -> bool {
        let mut next_due = self.next_due.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now < *next_due {
            return false;
        }
        *next_due = now + self.interval;
        true
    }

    /// Run once if the interval has elapsed since the last run.
    pub async fn run_if_due(&self) -> Option<StatsReport> {
        if !self.claim_run() {
            return None;
        }
        Some(self.run().await)
    }

    async fn run(&self) -> StatsReport {
        let mut report = StatsReport::default();

        match self.storage.recompute_stats(self.interval).await {
            Ok(()) => report.recomputed = true,
            Err(e) => error!("Failed to recompute pool stats: {}", e),
        }

        if let Some(oracle) = &self.oracle {
            match oracle.node_info().await {
                Ok(info) => {
                    debug!("Node reports {} blocks, {} connections", info.blocks, info.connections);
                    match self.storage.update_pool_info(info).await {
                        Ok(()) => report.pool_info_merged = true,
                        Err(e) => error!("Failed to store node info: {}", e),
                    }
                }
                Err(e) => warn!("Node status unavailable, keeping previous pool info: {}", e),
            }
        }

        info!(
            "Stats cycle finished (recomputed: {}, node info: {})",
            report.recomputed, report.pool_info_merged
        );
        report
    }
}
