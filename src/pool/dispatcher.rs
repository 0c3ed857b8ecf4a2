use crate::pool::unit::{Frame, UnitId};

/// Result of buffering one frame
#[derive(Debug, PartialEq)]
pub(crate) enum Pushed {
    /// Batch is full and must be delivered now
    Flush(Vec<Frame>),
    /// Frame is waiting; `opened` carries the generation when it started a new batch
    Buffered { opened: Option<u64> },
}

/// Round-robin placement plus the pool-level batch buffer.
///
/// The cursor only moves forward. With every unit usable, the n-th placement
/// lands on unit `n % units`; unusable units are skipped in cursor order.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    cursor: u64,
    next_seq: u64,
    batch_size: usize,
    buffer: Vec<Frame>,
    generation: u64,
}

impl Dispatcher {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            cursor: 0,
            next_seq: 0,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            generation: 0,
        }
    }

    /// Submission index for the next accepted payload
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Pick the next usable unit, or `None` if there is none
    pub fn select(&mut self, units: usize, usable: impl Fn(UnitId) -> bool) -> Option<UnitId> {
        if units == 0 {
            return None;
        }
        for offset in 0..units as u64 {
            let candidate = ((self.cursor + offset) % units as u64) as UnitId;
            if usable(candidate) {
                self.cursor += offset + 1;
                return Some(candidate);
            }
        }
        None
    }

    pub fn push(&mut self, frame: Frame) -> Pushed {
        let opened = self.buffer.is_empty();
        self.buffer.push(frame);
        if self.buffer.len() >= self.batch_size {
            return Pushed::Flush(self.drain());
        }
        Pushed::Buffered {
            opened: opened.then_some(self.generation),
        }
    }

    /// Take whatever is buffered
    pub fn take_buffer(&mut self) -> Option<Vec<Frame>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.drain())
        }
    }

    /// Take the buffer only if it is still the batch opened at `generation`
    pub fn take_generation(&mut self, generation: u64) -> Option<Vec<Frame>> {
        if self.generation == generation {
            self.take_buffer()
        } else {
            None
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn drain(&mut self) -> Vec<Frame> {
        self.generation += 1;
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size))
    }
}
