pub mod codec;
pub(crate) mod dispatcher;
pub mod events;
pub mod handler;
#[allow(clippy::module_inception)]
pub mod pool;
pub mod registry;
pub mod tracker;
pub mod unit;

pub use codec::{Codec, WireValue};
pub use events::{PoolEvent, PoolStats, PoolSummary, TaskResult};
pub use handler::{
    Argument, ContextInitializer, ContextState, Handler, Invocation, ParamBinding, ParamRole,
    UnitContext,
};
pub use pool::{Payload, Pool, PoolConfig};
pub use registry::PoolRegistry;
pub use tracker::{CompletionState, CompletionTracker};
pub use unit::{UnitId, UnitState};
