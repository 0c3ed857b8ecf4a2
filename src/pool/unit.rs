//! Execution units.
//!
//! Each unit is a dedicated OS thread driving its own current-thread tokio
//! runtime. It talks to the pool only through two channels: batches of encoded
//! frames come in, one [`UnitEvent`] per batch goes out.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::errors::{ParallelError, Result, WorkerError};
use crate::pool::codec::Codec;
use crate::pool::handler::{ContextInitializer, Handler, Invocation, ParamBinding, UnitContext};

/// Index of a unit within its pool
pub type UnitId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitState {
    /// Spawned, context initializer still running
    Starting,
    /// Accepting work
    Ready,
    /// Bootstrap failed; answers every payload with a bootstrap error
    Failed,
    /// Thread is gone
    Exited,
}

impl UnitState {
    /// Whether the dispatcher may still place work on the unit
    pub fn is_usable(&self) -> bool {
        matches!(self, UnitState::Starting | UnitState::Ready)
    }
}

/// One encoded payload tagged with its submission sequence number
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FrameOutcome {
    pub seq: u64,
    pub outcome: std::result::Result<Vec<u8>, WorkerError>,
}

#[derive(Debug)]
pub(crate) enum UnitEvent {
    Ready {
        unit: UnitId,
    },
    BootstrapFailed {
        unit: UnitId,
        message: String,
    },
    Completed {
        unit: UnitId,
        outcomes: Vec<FrameOutcome>,
    },
    Exited {
        unit: UnitId,
        reason: String,
    },
}

/// Everything a unit is started with; never changes afterwards
#[derive(Clone)]
pub(crate) struct UnitSpec {
    pub unit: UnitId,
    pub namespace: Arc<str>,
    pub handler: Arc<dyn Handler>,
    pub initializer: Option<Arc<dyn ContextInitializer>>,
    pub bindings: Arc<[ParamBinding]>,
    pub codec: Codec,
}

/// Start a unit thread
pub(crate) fn spawn_unit(
    spec: UnitSpec,
    commands: mpsc::UnboundedReceiver<Vec<Frame>>,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> Result<JoinHandle<()>> {
    let name = format!("{}-unit-{}", spec.namespace, spec.unit);
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let _guard = ExitGuard {
                unit: spec.unit,
                events: events.clone(),
            };

            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(unit = spec.unit, error = %e, "Failed to build unit runtime");
                    let _ = events.send(UnitEvent::BootstrapFailed {
                        unit: spec.unit,
                        message: format!("runtime: {}", e),
                    });
                    return;
                }
            };

            runtime.block_on(run_unit(spec, commands, events));
        })
        .map_err(|e| ParallelError::io("spawn unit thread", e))
}

/// Reports the thread going away, including by panic
struct ExitGuard {
    unit: UnitId,
    events: mpsc::UnboundedSender<UnitEvent>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reason = if std::thread::panicking() {
            "unit thread panicked"
        } else {
            "unit thread stopped"
        };
        let _ = self.events.send(UnitEvent::Exited {
            unit: self.unit,
            reason: reason.to_string(),
        });
    }
}

async fn run_unit(
    spec: UnitSpec,
    mut commands: mpsc::UnboundedReceiver<Vec<Frame>>,
    events: mpsc::UnboundedSender<UnitEvent>,
) {
    let context = match bootstrap(&spec).await {
        Ok(ctx) => {
            info!(namespace = %spec.namespace, unit = spec.unit, "Unit ready");
            let _ = events.send(UnitEvent::Ready { unit: spec.unit });
            Ok(Arc::new(ctx))
        }
        Err(message) => {
            error!(namespace = %spec.namespace, unit = spec.unit, error = %message, "Unit bootstrap failed");
            let _ = events.send(UnitEvent::BootstrapFailed {
                unit: spec.unit,
                message: message.clone(),
            });
            Err(message)
        }
    };

    while let Some(batch) = commands.recv().await {
        debug!(unit = spec.unit, size = batch.len(), "Unit received batch");
        let outcomes = match &context {
            Ok(ctx) => {
                let mut outcomes = Vec::with_capacity(batch.len());
                for frame in batch {
                    outcomes.push(process_frame(&spec, ctx, frame).await);
                }
                outcomes
            }
            Err(message) => batch
                .into_iter()
                .map(|frame| FrameOutcome {
                    seq: frame.seq,
                    outcome: Err(WorkerError::Bootstrap {
                        unit: spec.unit,
                        message: message.clone(),
                    }),
                })
                .collect(),
        };

        if events
            .send(UnitEvent::Completed {
                unit: spec.unit,
                outcomes,
            })
            .is_err()
        {
            debug!(unit = spec.unit, "Pool dropped, stopping unit");
            break;
        }
    }
}

async fn bootstrap(spec: &UnitSpec) -> std::result::Result<UnitContext, String> {
    let state = match &spec.initializer {
        None => None,
        Some(initializer) => match AssertUnwindSafe(initializer.initialize())
            .catch_unwind()
            .await
        {
            Ok(Ok(state)) => Some(state),
            Ok(Err(e)) => return Err(format!("{:#}", e)),
            Err(panic) => {
                return Err(format!(
                    "context initializer panicked: {}",
                    panic_message(panic.as_ref())
                ))
            }
        },
    };
    Ok(UnitContext::new(spec.unit, spec.namespace.clone(), state))
}

async fn process_frame(spec: &UnitSpec, ctx: &Arc<UnitContext>, frame: Frame) -> FrameOutcome {
    let seq = frame.seq;
    let payload = match spec.codec.decode(&frame.bytes) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(unit = spec.unit, seq, error = %e, "Payload decode failed");
            return FrameOutcome {
                seq,
                outcome: Err(WorkerError::Decode {
                    unit: spec.unit,
                    format: spec.codec.name().to_string(),
                    message: decode_message(&e),
                }),
            };
        }
    };

    let call = Invocation::bind(&spec.bindings, payload, ctx);
    let outcome = match AssertUnwindSafe(spec.handler.execute(call))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => spec.codec.encode(&value).map_err(|e| WorkerError::Runtime {
            unit: spec.unit,
            message: format!("failed to encode result: {}", decode_message(&e)),
        }),
        Ok(Err(e)) => {
            warn!(unit = spec.unit, seq, error = %e, "Handler returned error");
            Err(WorkerError::Runtime {
                unit: spec.unit,
                message: format!("{:#}", e),
            })
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(unit = spec.unit, seq, panic = %message, "Handler panicked");
            Err(WorkerError::Runtime {
                unit: spec.unit,
                message: format!("handler panicked: {}", message),
            })
        }
    };

    FrameOutcome { seq, outcome }
}

/// Serialization errors render with their source attached
pub(crate) fn decode_message(err: &ParallelError) -> String {
    match err {
        ParallelError::Serialization { source, .. } => source.to_string(),
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
