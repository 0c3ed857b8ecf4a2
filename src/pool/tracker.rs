use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionState {
    /// Nothing sent, input still open
    Idle,
    /// Input open, at least one payload sent
    Sending,
    /// Input ended, results or buffered payloads outstanding
    Draining,
    /// Terminal signal emitted
    Completed,
}

/// Sent/completed bookkeeping with a one-shot terminal latch.
///
/// Owners call [`CompletionTracker::try_complete`] after every change that
/// could satisfy the terminal condition; it returns `true` exactly once.
#[derive(Debug, Default, Clone)]
pub struct CompletionTracker {
    sent: u64,
    completed: u64,
    end_requested: bool,
    end_emitted: bool,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    /// Counts one finished payload; never lets `completed` pass `sent`
    pub fn record_completed(&mut self) -> bool {
        if self.completed >= self.sent {
            error!(
                sent = self.sent,
                completed = self.completed,
                "Completion recorded with nothing in flight"
            );
            return false;
        }
        self.completed += 1;
        true
    }

    pub fn request_end(&mut self) {
        self.end_requested = true;
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn in_flight(&self) -> u64 {
        self.sent - self.completed
    }

    pub fn end_requested(&self) -> bool {
        self.end_requested
    }

    pub fn end_emitted(&self) -> bool {
        self.end_emitted
    }

    pub fn state(&self) -> CompletionState {
        if self.end_emitted {
            CompletionState::Completed
        } else if self.end_requested {
            CompletionState::Draining
        } else if self.sent == 0 {
            CompletionState::Idle
        } else {
            CompletionState::Sending
        }
    }

    /// Latch the terminal signal if input ended and everything converged.
    /// `queued` is work the pool still holds outside the counters.
    pub fn try_complete(&mut self, queued: usize) -> bool {
        if self.end_emitted || !self.end_requested {
            return false;
        }
        if self.completed != self.sent || queued > 0 {
            return false;
        }
        self.end_emitted = true;
        true
    }
}
