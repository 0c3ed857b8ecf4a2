// Core infrastructure: errors and configuration
pub mod core;

// Worker pools: units, dispatch, completion and the namespace registry
pub mod pool;

// Re-exports for convenience
pub use crate::core::config::{EngineConfig, EngineConfigBuilder, PoolSettings};
pub use crate::core::errors::{ParallelError, Result, WorkerError};
pub use pool::{
    Codec, CompletionState, ContextInitializer, ContextState, Handler, Invocation, ParamBinding,
    ParamRole, Payload, Pool, PoolConfig, PoolEvent, PoolRegistry, PoolStats, PoolSummary,
    TaskResult, UnitContext, UnitId, UnitState,
};
