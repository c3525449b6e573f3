//! Ops produced while disconnected, replayed in order on reconnect.

use std::collections::VecDeque;

use playpen_core::ReplicaOp;

/// Bounded FIFO of unsent ops.
pub struct OfflineQueue {
    ops: VecDeque<ReplicaOp>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: VecDeque::new(),
            capacity,
        }
    }

    /// Hands the op back when the queue is full.
    pub fn push(&mut self, op: ReplicaOp) -> Result<(), ReplicaOp> {
        if self.ops.len() == self.capacity {
            return Err(op);
        }
        self.ops.push_back(op);
        Ok(())
    }

    /// Everything queued, oldest first.
    pub fn take_all(&mut self) -> Vec<ReplicaOp> {
        std::mem::take(&mut self.ops).into()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
