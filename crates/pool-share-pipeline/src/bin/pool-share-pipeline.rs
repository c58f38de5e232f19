use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pool_share_pipeline::{
    api,
    config::{
        ArchiveCompression, ArchiveConfig, ArchiveMode, AuthConfig, FlushConfig, PipelineConfig,
        StatsConfig, StorageSettings,
    },
    database::StorageRegistry,
    metrics::register_metrics,
    shutdown::listen_for_signals,
    stats::{NodeStatusOracle, RpcNodeOracle},
    PipelineRunner, PoolCoordinator,
};

#[derive(Parser, Debug)]
#[clap(name = "pool-share-pipeline")]
#[clap(about = "Mining pool share ingestion and archival service", long_about = None)]
struct Args {
    /// Pool name
    #[clap(long, env = "POOL_NAME", default_value = "Stratum Mining Pool")]
    pool_name: String,

    /// Storage driver: sqlite, redis, none, or memory for development
    #[clap(long, env = "POOL_STORAGE_DRIVER", default_value = "sqlite")]
    storage_driver: String,

    /// Redis URL for the redis driver
    #[clap(long, env = "POOL_REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Database file for the sqlite driver
    #[clap(long, env = "POOL_SQLITE_PATH", default_value = "pool.db")]
    sqlite_path: PathBuf,

    /// Fail at startup instead of creating missing tables
    #[clap(long, env = "POOL_NO_CREATE_SCHEMA")]
    no_create_schema: bool,

    /// Salt mixed into stored worker password digests
    #[clap(long, env = "POOL_PASSWORD_SALT", default_value = "")]
    password_salt: String,

    /// Seconds between queue checks
    #[clap(long, env = "POOL_LOADER_CHECK_SECS", default_value = "5")]
    loader_check_secs: u64,

    /// Queue length that triggers a commit
    #[clap(long, env = "POOL_LOADER_MIN_BATCH", default_value = "100")]
    loader_min_batch: usize,

    /// Maximum shares per commit
    #[clap(long, env = "POOL_LOADER_MAX_BATCH", default_value = "1000")]
    loader_max_batch: usize,

    /// Seconds after which a commit runs regardless of queue length
    #[clap(long, env = "POOL_LOADER_FORCE_SECS", default_value = "60")]
    loader_force_secs: u64,

    /// Seconds a cached worker credential stays valid
    #[clap(long, env = "POOL_USER_CACHE_SECS", default_value = "3600")]
    user_cache_secs: u64,

    /// Accept any known worker without checking its password
    #[clap(long, env = "POOL_SKIP_PASSWORD_CHECK")]
    skip_password_check: bool,

    /// Create unknown workers on first authentication
    #[clap(long, env = "POOL_USERS_AUTOADD")]
    users_autoadd: bool,

    /// Disable periodic stats recomputation
    #[clap(long, env = "POOL_STATS_DISABLED")]
    stats_disabled: bool,

    /// Stats averaging window in seconds
    #[clap(long, env = "POOL_STATS_AVG_SECS", default_value = "300")]
    stats_avg_secs: u64,

    /// Coin daemon JSON-RPC URL used for pool info
    #[clap(long, env = "POOL_RPC_URL")]
    rpc_url: Option<String>,

    #[clap(long, env = "POOL_RPC_USER", default_value = "")]
    rpc_user: String,

    #[clap(long, env = "POOL_RPC_PASSWORD", default_value = "")]
    rpc_password: String,

    /// Move old shares out of the hot store
    #[clap(long, env = "POOL_ARCHIVE_SHARES")]
    archive_shares: bool,

    /// Archive target: db or file
    #[clap(long, env = "POOL_ARCHIVE_MODE", default_value = "file")]
    archive_mode: ArchiveMode,

    /// Seconds between archival cycles
    #[clap(long, env = "POOL_ARCHIVE_INTERVAL_SECS", default_value = "300")]
    archive_interval_secs: u64,

    /// Shares older than this many seconds are archived
    #[clap(long, env = "POOL_ARCHIVE_AGE_SECS", default_value = "86400")]
    archive_age_secs: u64,

    /// Base path of the archive file
    #[clap(long, env = "POOL_ARCHIVE_FILE", default_value = "archives/shares")]
    archive_file: PathBuf,

    /// Do not suffix the archive file with the cutoff time
    #[clap(long, env = "POOL_ARCHIVE_NO_TIMESTAMP")]
    archive_no_timestamp: bool,

    /// Archive compression: none, gzip or bzip2
    #[clap(long, env = "POOL_ARCHIVE_COMPRESS", default_value = "none")]
    archive_compress: ArchiveCompression,

    /// HTTP API bind address
    #[clap(long, env = "POOL_HTTP_BIND", default_value = "0.0.0.0:8080")]
    http_bind: SocketAddr,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            pool_name: self.pool_name.clone(),
            flush: FlushConfig {
                check_interval: Duration::from_secs(self.loader_check_secs),
                min_batch: self.loader_min_batch,
                max_batch: self.loader_max_batch,
                force_interval: Duration::from_secs(self.loader_force_secs),
            },
            stats: StatsConfig {
                enabled: !self.stats_disabled,
                interval: Duration::from_secs(self.stats_avg_secs),
                check_interval: Duration::from_secs(self.loader_check_secs),
            },
            archive: ArchiveConfig {
                enabled: self.archive_shares,
                mode: self.archive_mode,
                interval: Duration::from_secs(self.archive_interval_secs),
                file: self.archive_file.clone(),
                file_append_time: !self.archive_no_timestamp,
                compression: self.archive_compress,
                ..ArchiveConfig::default()
            },
            auth: AuthConfig {
                check_password: !self.skip_password_check,
                auto_add: self.users_autoadd,
                cache_ttl: Duration::from_secs(self.user_cache_secs),
            },
        }
    }

    fn storage_settings(&self) -> StorageSettings {
        StorageSettings {
            redis_url: self.redis_url.clone(),
            sqlite_path: self.sqlite_path.clone(),
            create_schema: !self.no_create_schema,
            password_salt: self.password_salt.clone(),
            archive_age: Duration::from_secs(self.archive_age_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting {} share pipeline", args.pool_name);
    info!("Storage driver: {}", args.storage_driver);

    register_metrics().context("failed to register metrics")?;

    let config = args.pipeline_config();
    config.validate().context("invalid pipeline configuration")?;

    let storage = StorageRegistry::with_builtin_drivers()
        .open(&args.storage_driver, args.storage_settings())
        .await
        .context("failed to open storage")?;
    storage
        .check_schema()
        .await
        .context("storage schema check failed")?;

    let oracle: Option<Arc<dyn NodeStatusOracle>> = match &args.rpc_url {
        Some(url) => Some(Arc::new(RpcNodeOracle::new(
            url,
            &args.rpc_user,
            &args.rpc_password,
        )?)),
        None => None,
    };

    let coordinator = Arc::new(PoolCoordinator::new(config, storage)?);
    let token = CancellationToken::new();
    tokio::spawn(listen_for_signals(token.clone()));

    let runner = PipelineRunner::new(&coordinator, oracle);
    let pipeline = tokio::spawn(runner.run(token.clone()));

    let listener = tokio::net::TcpListener::bind(args.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", args.http_bind))?;
    info!("HTTP API listening on {}", args.http_bind);

    let server_token = token.clone();
    let server = axum::serve(listener, api::router(coordinator.clone()))
        .with_graceful_shutdown(async move { server_token.cancelled().await });
    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
        token.cancel();
    }

    let report = pipeline.await.context("share pipeline task failed")?;
    if report.still_queued > 0 {
        anyhow::bail!("{} shares could not be committed at shutdown", report.still_queued);
    }

    info!("Share pipeline shut down");
    Ok(())
}
