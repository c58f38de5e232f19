pub mod api;
pub mod archive;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod database;
pub mod error;
pub mod importer;
pub mod metrics;
pub mod scheduler;
pub mod shares;
pub mod shutdown;
pub mod stats;

pub use coordinator::PoolCoordinator;
pub use error::{PoolError, Result};
pub use scheduler::PipelineRunner;
