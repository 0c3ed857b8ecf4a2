use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::core::errors::WorkerError;
use crate::pool::tracker::CompletionState;
use crate::pool::unit::{UnitId, UnitState};

/// Everything a pool reports to its subscribers
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Outcome of one payload
    Result(TaskResult),
    /// Pool-level failure (unit bootstrap or exit)
    Error(WorkerError),
    /// Input ended and every accepted payload is accounted for; sent once
    End(PoolSummary),
}

impl PoolEvent {
    pub fn is_end(&self) -> bool {
        matches!(self, PoolEvent::End(_))
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Submission index returned by `send`
    pub seq: u64,
    /// Unit that produced the outcome, if it reached one
    pub unit: Option<UnitId>,
    pub outcome: Result<Value, WorkerError>,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&WorkerError> {
        self.outcome.as_ref().err()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSummary {
    pub pool_id: Uuid,
    pub namespace: String,
    pub sent: u64,
    pub completed: u64,
    /// Payloads whose outcome was an error
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PoolSummary {
    pub fn succeeded(&self) -> u64 {
        self.completed - self.failed
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub pool_id: Uuid,
    pub namespace: String,
    pub state: CompletionState,
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
    /// Payloads waiting in the batch buffer
    pub buffered: usize,
    pub units: Vec<UnitState>,
}

impl PoolStats {
    pub fn usable_units(&self) -> usize {
        self.units.iter().filter(|s| s.is_usable()).count()
    }
}
