use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Protected record: {0}")]
    ProtectedRecord(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Node status error: {0}")]
    NodeStatus(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PoolError {
    /// Backend failures that the pipeline recovers from locally (requeue, retry, skip).
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            PoolError::Store(_) | PoolError::Redis(_) | PoolError::Sqlite(_) | PoolError::Join(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
