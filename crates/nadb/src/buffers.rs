use crate::types::Operation;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded, append-only log of recent operations
///
/// The oldest entry is evicted once `capacity` is reached. On a primary it
/// feeds catch-up for newly connected secondaries; on a secondary it is an
/// audit trail of what was applied. Readers take snapshot copies, so an
/// eviction never disturbs a catch-up already in flight.
#[derive(Debug)]
pub struct OperationLog {
    ops: VecDeque<Operation>,
    capacity: usize,
}

impl OperationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append an operation, evicting the oldest entry if the log is full
    pub fn push(&mut self, op: Operation) {
        if self.ops.len() >= self.capacity {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence of the newest entry, if any
    pub fn last_sequence(&self) -> Option<u64> {
        self.ops.back().map(Operation::sequence)
    }

    /// Copy of the newest `n` entries, oldest first
    pub fn tail(&self, n: usize) -> Vec<Operation> {
        let skip = self.ops.len().saturating_sub(n);
        self.ops.iter().skip(skip).cloned().collect()
    }

    /// Copy of every entry with `sequence >= from_sequence`
    pub fn since(&self, from_sequence: u64) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|op| op.sequence() >= from_sequence)
            .cloned()
            .collect()
    }

    /// Copy of the whole log
    pub fn snapshot(&self) -> Vec<Operation> {
        self.ops.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

/// An encoded frame waiting in a link's outbound queue
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub sequence: u64,
    pub frame: Bytes,
}

/// Bounded outbound queue for one replica link
///
/// Producers never block: `try_push` refuses when the queue is full and the
/// caller decides what to do with the frame. The queue is internally
/// synchronized so broadcasters and the drain loop can share it.
#[derive(Debug)]
pub struct SendQueue {
    frames: Mutex<VecDeque<QueuedFrame>>,
    max_size: usize,
}

impl SendQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    /// Enqueue a frame at the back. Returns false if the queue is full.
    pub fn try_push(&self, item: QueuedFrame) -> bool {
        let mut frames = self.frames.lock();
        if frames.len() >= self.max_size {
            return false;
        }
        frames.push_back(item);
        true
    }

    /// Put a frame back at the front after a failed send, keeping order
    pub fn requeue(&self, item: QueuedFrame) {
        self.frames.lock().push_front(item);
    }

    pub fn pop(&self) -> Option<QueuedFrame> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.lock().len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}
