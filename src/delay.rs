//! Sampled end-to-end latency measurement.
//!
//! The sender stamps a [`DelayNode`] when a command enters the target write
//! pipeline; the receiver pops it when the matching reply arrives and
//! records the difference. Sampling adapts to the queue's free space so a
//! burst cannot starve the queue while low traffic still gets measured:
//!
//! | free slots | sample when |
//! |------------|-------------|
//! | ≥ 4096 | every send |
//! | ≥ 1024 | `send_id % 10 == 0` |
//! | ≥ 128  | `send_id % 100 == 0` |
//! | else   | `send_id % 1000 == 0` |
//!
//! Enqueue never blocks: when the queue is full the sample is dropped with
//! a warning. Measurement is best-effort by design.

use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

/// A sampled send: the monotonic send-id and when it hit the write pipeline.
#[derive(Debug, Clone, Copy)]
pub struct DelayNode {
    pub id: u64,
    pub sent_at: Instant,
}

/// Decide whether the send with `send_id` should be sampled given the
/// queue's current free space.
pub fn should_sample(free: usize, send_id: u64) -> bool {
    free >= 4096
        || (free >= 1024 && send_id % 10 == 0)
        || (free >= 128 && send_id % 100 == 0)
        || send_id % 1000 == 0
}

/// Producer half of the delay queue (owned by the sender).
#[derive(Debug)]
pub struct DelaySender {
    syncer_id: usize,
    tx: mpsc::Sender<DelayNode>,
}

/// Consumer half of the delay queue (owned by the receiver).
#[derive(Debug)]
pub struct DelayReceiver {
    rx: mpsc::Receiver<DelayNode>,
}

/// Create the bounded single-producer/single-consumer delay queue.
pub fn delay_queue(syncer_id: usize, capacity: usize) -> (DelaySender, DelayReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (DelaySender { syncer_id, tx }, DelayReceiver { rx })
}

impl DelaySender {
    /// Free slots in the queue right now.
    pub fn free(&self) -> usize {
        self.tx.capacity()
    }

    /// Queued samples awaiting a reply (for `Info()`).
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Sample this send if the policy selects it. Never blocks.
    pub fn maybe_push(&self, send_id: u64) {
        if !should_sample(self.free(), send_id) {
            return;
        }
        let node = DelayNode {
            id: send_id,
            sent_at: Instant::now(),
        };
        if self.tx.try_send(node).is_err() {
            crate::metrics::record_delay_sample_dropped(self.syncer_id);
            warn!(syncer_id = self.syncer_id, send_id, "delay queue full, sample dropped");
        }
    }
}

impl DelayReceiver {
    /// Pop the next sample if one is queued. Never blocks.
    pub fn try_pop(&mut self) -> Option<DelayNode> {
        self.rx.try_recv().ok()
    }
}
