// Core infrastructure shared by the pool engine

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{EngineConfig, EngineConfigBuilder, PoolSettings, DEFAULT_MAX_WORKERS};
pub use errors::{ParallelError, Result, WorkerError};
