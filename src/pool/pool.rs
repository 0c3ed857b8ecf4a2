use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::PoolSettings;
use crate::core::errors::{ParallelError, Result, WorkerError};
use crate::pool::codec::Codec;
use crate::pool::dispatcher::{Dispatcher, Pushed};
use crate::pool::events::{PoolEvent, PoolStats, PoolSummary, TaskResult};
use crate::pool::handler::{ContextInitializer, Handler, ParamBinding};
use crate::pool::tracker::CompletionTracker;
use crate::pool::unit::{
    decode_message, spawn_unit, Frame, UnitEvent, UnitId, UnitSpec, UnitState,
};

/// Everything needed to create a pool
#[derive(Clone)]
pub struct PoolConfig {
    pub namespace: String,
    pub settings: PoolSettings,
    pub bindings: Vec<ParamBinding>,
    pub handler: Arc<dyn Handler>,
    pub context_initializer: Option<Arc<dyn ContextInitializer>>,
}

impl PoolConfig {
    pub fn new<H: Handler>(namespace: impl Into<String>, handler: H) -> Self {
        Self {
            namespace: namespace.into(),
            settings: PoolSettings::default(),
            bindings: ParamBinding::defaults(),
            handler: Arc::new(handler),
            context_initializer: None,
        }
    }

    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.settings.worker_count = worker_count;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.settings.batch_size = batch_size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.settings.set_flush_interval(interval);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.settings.codec = codec;
        self
    }

    pub fn bindings(mut self, bindings: Vec<ParamBinding>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn context_initializer<I: ContextInitializer>(mut self, initializer: I) -> Self {
        self.context_initializer = Some(Arc::new(initializer));
        self
    }

    pub fn validate(&self, max_workers: usize) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(ParallelError::configuration_field(
                "namespace must not be empty",
                "namespace",
            ));
        }
        self.settings.validate(max_workers)?;
        ParamBinding::validate(&self.bindings)
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("namespace", &self.namespace)
            .field("settings", &self.settings)
            .field("bindings", &self.bindings)
            .field("context_initializer", &self.context_initializer.is_some())
            .finish()
    }
}

/// One unit of input
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Encoded with the pool's codec before dispatch
    Record(Value),
    /// Already encoded with the pool's codec
    Encoded(Vec<u8>),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Record(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Encoded(bytes)
    }
}

/// Handle to a running pool. Clones share the same units; the units wind down
/// once every handle is dropped.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    id: Uuid,
    namespace: String,
    settings: PoolSettings,
    senders: Vec<mpsc::UnboundedSender<Vec<Frame>>>,
    runtime: Handle,
    core: Mutex<PoolCore>,
    end_tx: watch::Sender<Option<PoolSummary>>,
    settled_tx: watch::Sender<usize>,
    started_at: DateTime<Utc>,
}

struct PoolCore {
    tracker: CompletionTracker,
    dispatcher: Dispatcher,
    units: Vec<UnitSlot>,
    subscribers: Vec<mpsc::UnboundedSender<PoolEvent>>,
    failed: u64,
}

struct UnitSlot {
    state: UnitState,
    /// Sequence numbers delivered to the unit and not yet answered
    outstanding: HashSet<u64>,
    /// Bootstrap finished one way or another
    settled: bool,
}

impl Pool {
    /// Validate `config` and start its units. Must run inside a tokio runtime.
    pub(crate) fn spawn(config: PoolConfig, max_workers: usize) -> Result<Self> {
        config.validate(max_workers)?;
        let runtime = Handle::try_current().map_err(|e| ParallelError::runtime(e.to_string()))?;

        let PoolConfig {
            namespace,
            settings,
            bindings,
            handler,
            context_initializer,
        } = config;

        let shared_namespace: Arc<str> = Arc::from(namespace.as_str());
        let bindings: Arc<[ParamBinding]> = bindings.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut senders = Vec::with_capacity(settings.worker_count);
        for unit in 0..settings.worker_count {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let spec = UnitSpec {
                unit,
                namespace: shared_namespace.clone(),
                handler: handler.clone(),
                initializer: context_initializer.clone(),
                bindings: bindings.clone(),
                codec: settings.codec,
            };
            spawn_unit(spec, command_rx, event_tx.clone())?;
            senders.push(command_tx);
        }
        drop(event_tx);

        let units = (0..settings.worker_count)
            .map(|_| UnitSlot {
                state: UnitState::Starting,
                outstanding: HashSet::new(),
                settled: false,
            })
            .collect();

        let (end_tx, _) = watch::channel(None);
        let (settled_tx, _) = watch::channel(0);
        let shared = Arc::new(PoolShared {
            id: Uuid::new_v4(),
            namespace,
            settings: settings.clone(),
            senders,
            runtime: runtime.clone(),
            core: Mutex::new(PoolCore {
                tracker: CompletionTracker::new(),
                dispatcher: Dispatcher::new(settings.batch_size),
                units,
                subscribers: Vec::new(),
                failed: 0,
            }),
            end_tx,
            settled_tx,
            started_at: Utc::now(),
        });

        runtime.spawn(collect(Arc::downgrade(&shared), event_rx));

        info!(
            pool_id = %shared.id,
            namespace = %shared.namespace,
            workers = settings.worker_count,
            batch_size = settings.batch_size,
            codec = settings.codec.name(),
            "Pool created"
        );
        Ok(Self { shared })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn worker_count(&self) -> usize {
        self.shared.senders.len()
    }

    /// Register for pool events. Only events raised after this call are seen.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.core.lock().subscribers.push(tx);
        rx
    }

    /// Hand one payload to the pool and return its sequence number.
    ///
    /// Never waits on a unit. Fails with `NoWorkersAvailable` when no unit can
    /// take work; a rejected payload is not counted.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<u64> {
        let shared = &self.shared;
        let bytes = match payload.into() {
            Payload::Record(value) => shared.settings.codec.encode(&value)?,
            Payload::Encoded(bytes) => bytes,
        };

        let mut guard = shared.core.lock();
        let core = &mut *guard;
        if core.tracker.end_requested() {
            return Err(ParallelError::input_ended(&shared.namespace));
        }
        if !core.units.iter().any(|slot| slot.state.is_usable()) {
            warn!(namespace = %shared.namespace, "Rejecting payload, no usable units");
            return Err(ParallelError::no_workers(&shared.namespace));
        }

        let seq = core.dispatcher.next_seq();
        core.tracker.record_sent();
        match core.dispatcher.push(Frame { seq, bytes }) {
            Pushed::Flush(batch) => {
                shared.deliver(core, batch);
                shared.check_completion(core);
            }
            Pushed::Buffered {
                opened: Some(generation),
            } => shared.schedule_flush(generation),
            Pushed::Buffered { opened: None } => {}
        }
        Ok(seq)
    }

    /// Close input and flush anything buffered. Calling it again has no effect.
    pub fn end_of_input(&self) {
        let shared = &self.shared;
        let mut guard = shared.core.lock();
        let core = &mut *guard;
        if core.tracker.end_requested() {
            return;
        }
        core.tracker.request_end();
        debug!(
            namespace = %shared.namespace,
            sent = core.tracker.sent(),
            completed = core.tracker.completed(),
            "Input ended"
        );
        if let Some(batch) = core.dispatcher.take_buffer() {
            shared.deliver(core, batch);
        }
        shared.check_completion(core);
    }

    /// Wait until every unit finished bootstrap. Returns how many are ready.
    pub async fn await_start(&self) -> Result<usize> {
        let expected = self.worker_count();
        let mut rx = self.shared.settled_tx.subscribe();
        rx.wait_for(|settled| *settled >= expected)
            .await
            .map_err(|_| ParallelError::internal("pool dropped while starting"))?;

        let ready = self
            .shared
            .core
            .lock()
            .units
            .iter()
            .filter(|slot| slot.state == UnitState::Ready)
            .count();
        if ready == 0 {
            return Err(ParallelError::no_workers(&self.shared.namespace));
        }
        Ok(ready)
    }

    /// Wait for the terminal signal
    pub async fn await_end(&self) -> Result<PoolSummary> {
        let mut rx = self.shared.end_tx.subscribe();
        let summary = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ParallelError::internal("pool dropped before completion"))?;
        summary
            .clone()
            .ok_or_else(|| ParallelError::internal("completion signalled without summary"))
    }

    pub fn stats(&self) -> PoolStats {
        let core = self.shared.core.lock();
        PoolStats {
            pool_id: self.shared.id,
            namespace: self.shared.namespace.clone(),
            state: core.tracker.state(),
            sent: core.tracker.sent(),
            completed: core.tracker.completed(),
            failed: core.failed,
            buffered: core.dispatcher.buffered(),
            units: core.units.iter().map(|slot| slot.state).collect(),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("namespace", &self.shared.namespace)
            .field("workers", &self.shared.senders.len())
            .finish()
    }
}

/// Drain unit events into the pool until the pool or every unit is gone
async fn collect(shared: Weak<PoolShared>, mut events: mpsc::UnboundedReceiver<UnitEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply(event);
    }
    debug!("Pool event collector stopped");
}

impl PoolShared {
    fn apply(&self, event: UnitEvent) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        match event {
            UnitEvent::Ready { unit } => {
                if core.units[unit].state == UnitState::Starting {
                    core.units[unit].state = UnitState::Ready;
                }
                self.settle(core, unit);
            }
            UnitEvent::BootstrapFailed { unit, message } => {
                if core.units[unit].state != UnitState::Exited {
                    core.units[unit].state = UnitState::Failed;
                }
                self.settle(core, unit);
                error!(namespace = %self.namespace, unit, error = %message, "Unit failed to start");
                emit(core, PoolEvent::Error(WorkerError::Bootstrap { unit, message }));
            }
            UnitEvent::Completed { unit, outcomes } => {
                for outcome in outcomes {
                    let seq = outcome.seq;
                    if !core.units[unit].outstanding.remove(&seq) {
                        debug!(unit, seq, "Ignoring outcome that is no longer outstanding");
                        continue;
                    }
                    let result = outcome.outcome.and_then(|bytes| {
                        self.settings.codec.decode(&bytes).map_err(|e| {
                            warn!(unit, seq, error = %e, "Result decode failed");
                            WorkerError::Decode {
                                unit,
                                format: self.settings.codec.name().to_string(),
                                message: decode_message(&e),
                            }
                        })
                    });
                    record(
                        core,
                        TaskResult {
                            seq,
                            unit: Some(unit),
                            outcome: result,
                        },
                    );
                }
            }
            UnitEvent::Exited { unit, reason } => self.handle_exit(core, unit, reason),
        }
        self.check_completion(core);
    }

    /// Place a batch on the next usable unit, skipping units whose channel is gone
    fn deliver(&self, core: &mut PoolCore, mut batch: Vec<Frame>) {
        loop {
            let PoolCore {
                dispatcher, units, ..
            } = &mut *core;
            let Some(unit) = dispatcher.select(units.len(), |id| units[id].state.is_usable())
            else {
                warn!(
                    namespace = %self.namespace,
                    size = batch.len(),
                    "No usable units left for buffered payloads"
                );
                for frame in batch {
                    record(
                        core,
                        TaskResult {
                            seq: frame.seq,
                            unit: None,
                            outcome: Err(WorkerError::Unavailable {
                                message: format!("pool '{}' has no usable units", self.namespace),
                            }),
                        },
                    );
                }
                return;
            };

            let seqs: Vec<u64> = batch.iter().map(|frame| frame.seq).collect();
            match self.senders[unit].send(batch) {
                Ok(()) => {
                    debug!(namespace = %self.namespace, unit, size = seqs.len(), "Flushed batch");
                    core.units[unit].outstanding.extend(seqs);
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    batch = returned;
                    self.handle_exit(core, unit, "command channel closed".to_string());
                }
            }
        }
    }

    /// Start the interval timer for the batch opened at `generation`
    fn schedule_flush(self: &Arc<Self>, generation: u64) {
        let shared = Arc::downgrade(self);
        let interval = self.settings.flush_interval();
        self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(shared) = shared.upgrade() {
                shared.flush_generation(generation);
            }
        });
    }

    fn flush_generation(&self, generation: u64) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if let Some(batch) = core.dispatcher.take_generation(generation) {
            debug!(namespace = %self.namespace, size = batch.len(), "Flush interval elapsed");
            self.deliver(core, batch);
            self.check_completion(core);
        }
    }

    fn handle_exit(&self, core: &mut PoolCore, unit: UnitId, reason: String) {
        if core.units[unit].state == UnitState::Exited {
            return;
        }
        core.units[unit].state = UnitState::Exited;
        self.settle(core, unit);

        let mut lost: Vec<u64> = core.units[unit].outstanding.drain().collect();
        lost.sort_unstable();
        error!(
            namespace = %self.namespace,
            unit,
            reason = %reason,
            outstanding = lost.len(),
            "Unit exited"
        );
        for seq in lost {
            record(
                core,
                TaskResult {
                    seq,
                    unit: Some(unit),
                    outcome: Err(WorkerError::Exit {
                        unit,
                        reason: reason.clone(),
                    }),
                },
            );
        }
        emit(core, PoolEvent::Error(WorkerError::Exit { unit, reason }));
    }

    fn settle(&self, core: &mut PoolCore, unit: UnitId) {
        if core.units[unit].settled {
            return;
        }
        core.units[unit].settled = true;
        let settled = core.units.iter().filter(|slot| slot.settled).count();
        self.settled_tx.send_replace(settled);
    }

    fn check_completion(&self, core: &mut PoolCore) {
        if !core.tracker.try_complete(core.dispatcher.buffered()) {
            return;
        }
        let summary = PoolSummary {
            pool_id: self.id,
            namespace: self.namespace.clone(),
            sent: core.tracker.sent(),
            completed: core.tracker.completed(),
            failed: core.failed,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        info!(
            namespace = %self.namespace,
            sent = summary.sent,
            failed = summary.failed,
            "Pool drained"
        );
        emit(core, PoolEvent::End(summary.clone()));
        self.end_tx.send_replace(Some(summary));
    }
}

fn record(core: &mut PoolCore, result: TaskResult) {
    if !core.tracker.record_completed() {
        return;
    }
    if result.outcome.is_err() {
        core.failed += 1;
    }
    emit(core, PoolEvent::Result(result));
}

/// Subscribers whose receiver is gone are dropped
fn emit(core: &mut PoolCore, event: PoolEvent) {
    core.subscribers
        .retain(|subscriber| subscriber.send(event.clone()).is_ok());
}
