use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PoolError, Result};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pool_name: String,
    pub flush: FlushConfig,
    pub stats: StatsConfig,
    pub archive: ArchiveConfig,
    pub auth: AuthConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_name: "Stratum Mining Pool".to_string(),
            flush: FlushConfig::default(),
            stats: StatsConfig::default(),
            archive: ArchiveConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.flush.validate()?;
        if self.stats.enabled && self.stats.interval.is_zero() {
            return Err(PoolError::Configuration(
                "stats interval must be greater than zero".to_string(),
            ));
        }
        self.archive.validate()?;
        if self.auth.cache_ttl.is_zero() {
            return Err(PoolError::Configuration(
                "user cache ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Share loader settings: when the queue is checked and how much is committed at once.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// How often the scheduler evaluates the queue.
    pub check_interval: Duration,
    /// Queue length that triggers a commit on its own.
    pub min_batch: usize,
    /// Upper bound on records in one commit.
    pub max_batch: usize,
    /// Maximum time between commits regardless of queue length.
    pub force_interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            min_batch: 100,
            max_batch: 1000,
            force_interval: Duration::from_secs(60),
        }
    }
}

impl FlushConfig {
    fn validate(&self) -> Result<()> {
        if self.min_batch == 0 || self.max_batch == 0 {
            return Err(PoolError::Configuration(
                "min_batch and max_batch must be at least 1".to_string(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(PoolError::Configuration(
                "flush check interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub enabled: bool,
    /// Averaging window, also the minimum spacing between two stats runs.
    pub interval: Duration,
    /// How often the runner asks whether a stats run is due.
    pub check_interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Copy into the store's secondary table/keyspace.
    Store,
    /// Export to a CSV file on local disk.
    File,
}

impl std::str::FromStr for ArchiveMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "db" | "store" => Ok(ArchiveMode::Store),
            "file" => Ok(ArchiveMode::File),
            other => Err(PoolError::Configuration(format!(
                "unknown archive mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveCompression {
    None,
    Gzip,
    Bzip2,
}

impl ArchiveCompression {
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ArchiveCompression::None => None,
            ArchiveCompression::Gzip => Some("gz"),
            ArchiveCompression::Bzip2 => Some("bz2"),
        }
    }
}

impl std::str::FromStr for ArchiveCompression {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(ArchiveCompression::None),
            "gzip" | "gz" => Ok(ArchiveCompression::Gzip),
            "bzip2" | "bz2" => Ok(ArchiveCompression::Bzip2),
            other => Err(PoolError::Configuration(format!(
                "unknown archive compression '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub mode: ArchiveMode,
    /// How often the runner starts an archival cycle.
    pub interval: Duration,
    /// Base path of the export file; `.csv` and the compression suffix are appended.
    pub file: PathBuf,
    /// Suffix the file name with the cutoff time so each run gets its own file.
    pub file_append_time: bool,
    pub compression: ArchiveCompression,
    /// Fixed pause between failed cleanup attempts.
    pub cleanup_retry_delay: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ArchiveMode::File,
            interval: Duration::from_secs(300),
            file: PathBuf::from("archives/shares"),
            file_append_time: true,
            compression: ArchiveCompression::None,
            cleanup_retry_delay: Duration::from_secs(30),
        }
    }
}

impl ArchiveConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.interval.is_zero() {
            return Err(PoolError::Configuration(
                "archive interval must be greater than zero".to_string(),
            ));
        }
        if self.mode == ArchiveMode::File && self.file.as_os_str().is_empty() {
            return Err(PoolError::Configuration(
                "archive file mode needs a file path".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When false, any known worker name is accepted without checking the secret.
    pub check_password: bool,
    /// Create unknown workers on first authentication.
    pub auto_add: bool,
    pub cache_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            check_password: true,
            auto_add: false,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Connection settings handed to a storage factory.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub redis_url: String,
    pub sqlite_path: PathBuf,
    /// Create missing tables on open instead of failing the schema check.
    pub create_schema: bool,
    pub password_salt: String,
    /// Rows older than this are eligible for archival.
    pub archive_age: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            sqlite_path: PathBuf::from("pool.db"),
            create_schema: true,
            password_salt: String::new(),
            archive_age: Duration::from_secs(86_400),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_is_rejected() {
        let mut config = PipelineConfig::default();
        config.flush.min_batch = 0;
        assert!(matches!(
            config.validate(),
            Err(PoolError::Configuration(_))
        ));
    }

    #[test]
    fn archive_settings_parse() {
        assert_eq!("db".parse::<ArchiveMode>().unwrap(), ArchiveMode::Store);
        assert_eq!("file".parse::<ArchiveMode>().unwrap(), ArchiveMode::File);
        assert_eq!(
            "bzip2".parse::<ArchiveCompression>().unwrap(),
            ArchiveCompression::Bzip2
        );
        assert!("lzma".parse::<ArchiveCompression>().is_err());
        assert_eq!(ArchiveCompression::Gzip.extension(), Some("gz"));
    }
}
