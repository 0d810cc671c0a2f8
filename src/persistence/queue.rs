// =============================================================================
// Record Queue — the single shared buffer between dispatcher and batcher
// =============================================================================
//
// A bounded FIFO of `BatchRecord`s with the backpressure drop policy built
// into admission: above the high-water mark the oldest trade records are shed
// first; book snapshot records are never dropped. This is the only
// admission-control point between ingestion and storage.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::BatchRecord;

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Queued with no side effects.
    Accepted,
    /// Queued; this many older trade records were shed to honour the
    /// high-water mark.
    AcceptedShed(usize),
    /// Refused: a droppable record arrived with the queue at hard capacity
    /// and nothing left to shed.
    Rejected,
}

pub struct RecordQueue {
    records: Mutex<VecDeque<BatchRecord>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    high_water: usize,
}

impl RecordQueue {
    pub fn new(capacity: usize, high_water: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
            high_water: high_water.min(capacity).max(1),
        }
    }

    /// Enqueue one record, applying the drop policy.
    ///
    /// Trade records are admitted only below hard capacity and may shed older
    /// trades above the high-water mark. Book deltas and snapshots are always
    /// admitted — the batcher drains (or spills) continuously, so they cannot
    /// grow without bound.
    pub fn push(&self, record: BatchRecord) -> Enqueued {
        if self.closed.load(Ordering::Acquire) {
            return Enqueued::Rejected;
        }

        let mut q = self.records.lock();

        if record.is_droppable()
            && q.len() >= self.capacity
            && !q.iter().any(BatchRecord::is_droppable)
        {
            return Enqueued::Rejected;
        }

        q.push_back(record);

        // Shed the oldest trade records until the queue is back at the mark.
        let mut shed = 0;
        if q.len() > self.high_water {
            let mut i = 0;
            while q.len() > self.high_water && i < q.len() {
                if q[i].is_droppable() {
                    q.remove(i);
                    shed += 1;
                } else {
                    i += 1;
                }
            }
        }

        drop(q);
        self.notify.notify_one();

        if shed > 0 {
            Enqueued::AcceptedShed(shed)
        } else {
            Enqueued::Accepted
        }
    }

    /// Dequeue up to `max` records in FIFO order, waiting while the queue is
    /// empty. Returns `None` once the queue is closed and drained.
    pub async fn pop_chunk(&self, max: usize) -> Option<Vec<BatchRecord>> {
        let max = max.max(1);
        loop {
            {
                let mut q = self.records.lock();
                if !q.is_empty() {
                    let n = max.min(q.len());
                    return Some(q.drain(..n).collect());
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop admitting records; the consumer drains what remains.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the drop policy is currently engaged.
    pub fn is_backpressured(&self) -> bool {
        self.depth() > self.high_water
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
