// =============================================================================
// Persistence Batcher — batched durable writes under backpressure
// =============================================================================
//
// Independent worker draining the record queue. A batch flushes when it
// reaches `batch_size` or when `flush_interval` has elapsed since the last
// flush, whichever comes first. Failed flushes retry the same batch with
// exponential backoff up to a limit, then spill it to the fallback log rather
// than retrying forever. The queue closing triggers one final flush; nothing
// is durable until that flush succeeds or is spilled.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::hub::MarketHub;
use crate::persistence::queue::RecordQueue;
use crate::persistence::store::BatchStorage;
use crate::types::BatchRecord;

pub struct PersistenceBatcher {
    queue: Arc<RecordQueue>,
    store: Box<dyn BatchStorage>,
    hub: Arc<MarketHub>,
    batch_size: usize,
    flush_interval: Duration,
    retry_limit: u32,
    retry_base: Duration,
}

impl PersistenceBatcher {
    pub fn new(
        queue: Arc<RecordQueue>,
        store: Box<dyn BatchStorage>,
        hub: Arc<MarketHub>,
        batch_size: usize,
        flush_interval_ms: u64,
        retry_limit: u32,
        retry_base_ms: u64,
    ) -> Self {
        Self {
            queue,
            store,
            hub,
            batch_size: batch_size.max(1),
            flush_interval: Duration::from_millis(flush_interval_ms.max(1)),
            retry_limit,
            retry_base: Duration::from_millis(retry_base_ms.max(1)),
        }
    }

    /// Drain the queue until it closes, then perform the final flush.
    pub async fn run(self) {
        let Self {
            queue,
            mut store,
            hub,
            batch_size,
            flush_interval,
            retry_limit,
            retry_base,
        } = self;

        info!(
            batch_size,
            flush_interval_ms = flush_interval.as_millis() as u64,
            "persistence batcher started"
        );

        let mut pending: Vec<BatchRecord> = Vec::with_capacity(batch_size);
        let mut ticker = interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset(); // the first tick should come a full interval from now

        loop {
            hub.set_backpressure(queue.is_backpressured());

            let want = batch_size - pending.len();
            tokio::select! {
                chunk = queue.pop_chunk(want) => match chunk {
                    Some(records) => {
                        pending.extend(records);
                        if pending.len() >= batch_size {
                            flush(&mut store, &hub, retry_limit, retry_base, &mut pending).await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        debug!(records = pending.len(), "interval flush");
                        flush(&mut store, &hub, retry_limit, retry_base, &mut pending).await;
                    }
                }
            }
        }

        // Queue closed: whatever is left is the final batch.
        if !pending.is_empty() {
            info!(records = pending.len(), "final flush");
            flush(&mut store, &hub, retry_limit, retry_base, &mut pending).await;
        }
        hub.set_backpressure(false);
        info!("persistence batcher stopped");
    }
}

/// Write one batch all-or-nothing, retrying then spilling.
async fn flush(
    store: &mut Box<dyn BatchStorage>,
    hub: &MarketHub,
    retry_limit: u32,
    retry_base: Duration,
    pending: &mut Vec<BatchRecord>,
) {
    let n = pending.len();

    for attempt in 0..=retry_limit {
        match store.append(pending).await {
            Ok(()) => {
                hub.add_flushed_records(n as u64);
                debug!(records = n, "batch flushed");
                pending.clear();
                return;
            }
            Err(e) => {
                warn!(error = %e, attempt, records = n, "batch flush failed");
                if attempt < retry_limit {
                    let backoff = retry_base * 2u32.saturating_pow(attempt);
                    sleep(backoff).await;
                }
            }
        }
    }

    // Retries exhausted: spill instead of growing without bound.
    match store.spill(pending).await {
        Ok(()) => {
            hub.inc_spilled_batches();
            error!(records = n, "flush retries exhausted — batch spilled to fallback log");
        }
        Err(e) => {
            hub.add_dropped_records(n as u64);
            error!(error = %e, records = n, "spill failed — batch dropped");
        }
    }
    pending.clear();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::market_data::TradeHistory;
    use crate::persistence::queue::RecordQueue;
    use crate::types::{Px, Qty, Trade, TradeSide};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn trade_record(id: u64) -> BatchRecord {
        BatchRecord::Trade(Trade {
            trade_id: id,
            symbol: "BTCUSDT".into(),
            price: Px::parse("100").unwrap(),
            qty: Qty::parse("1").unwrap(),
            side: TradeSide::Buy,
            ts_ms: id as i64,
        })
    }

    /// In-memory store that can be told to fail the next N appends.
    #[derive(Clone, Default)]
    struct MockStore {
        appended: Arc<Mutex<Vec<Vec<BatchRecord>>>>,
        spilled: Arc<Mutex<Vec<Vec<BatchRecord>>>>,
        fail_next: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BatchStorage for MockStore {
        async fn append(&mut self, batch: &[BatchRecord]) -> Result<(), MonitorError> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(MonitorError::Persistence("injected failure".into()));
            }
            self.appended.lock().push(batch.to_vec());
            Ok(())
        }

        async fn spill(&mut self, batch: &[BatchRecord]) -> Result<(), MonitorError> {
            self.spilled.lock().push(batch.to_vec());
            Ok(())
        }
    }

    fn hub() -> Arc<MarketHub> {
        Arc::new(MarketHub::new(Arc::new(TradeHistory::new(16))))
    }

    fn batcher(
        queue: Arc<RecordQueue>,
        store: MockStore,
        hub: Arc<MarketHub>,
        batch_size: usize,
    ) -> PersistenceBatcher {
        PersistenceBatcher::new(queue, Box::new(store), hub, batch_size, 2000, 2, 10)
    }

    #[tokio::test(start_paused = true)]
    async fn size_triggered_flushes_then_timer_for_remainder() {
        let queue = Arc::new(RecordQueue::new(10_000, 10_000));
        let store = MockStore::default();
        let hub = hub();

        for id in 1..=120 {
            queue.push(trade_record(id));
        }

        let handle = tokio::spawn(batcher(queue.clone(), store.clone(), hub.clone(), 50).run());

        // Two full batches land immediately; the partial 20 waits for the
        // 2000 ms timer (auto-advanced by the paused clock).
        tokio::time::sleep(Duration::from_millis(2500)).await;
        {
            let batches = store.appended.lock();
            let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
            assert_eq!(sizes, vec![50, 50, 20]);
        }

        queue.close();
        handle.await.unwrap();

        // Every accepted record flushed exactly once.
        let batches = store.appended.lock();
        let mut ids: Vec<u64> = batches
            .iter()
            .flatten()
            .filter_map(|r| match r {
                BatchRecord::Trade(t) => Some(t.trade_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 120);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 120);
        assert_eq!(hub.flushed_records(), 120);
        assert_eq!(hub.flush_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn close_forces_final_partial_flush() {
        let queue = Arc::new(RecordQueue::new(100, 100));
        let store = MockStore::default();
        let hub = hub();

        for id in 1..=7 {
            queue.push(trade_record(id));
        }
        queue.close();

        batcher(queue, store.clone(), hub.clone(), 50).run().await;

        let batches = store.appended.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 7);
        assert_eq!(hub.flushed_records(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_same_batch() {
        let queue = Arc::new(RecordQueue::new(100, 100));
        let store = MockStore::default();
        store.fail_next.store(2, Ordering::SeqCst); // fail twice, then succeed
        let hub = hub();

        for id in 1..=5 {
            queue.push(trade_record(id));
        }
        queue.close();

        batcher(queue, store.clone(), hub.clone(), 5).run().await;

        let batches = store.appended.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
        assert!(store.spilled.lock().is_empty());
        assert_eq!(hub.spilled_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_spill_the_batch() {
        let queue = Arc::new(RecordQueue::new(100, 100));
        let store = MockStore::default();
        store.fail_next.store(100, Ordering::SeqCst); // never succeeds
        let hub = hub();

        for id in 1..=5 {
            queue.push(trade_record(id));
        }
        queue.close();

        batcher(queue, store.clone(), hub.clone(), 5).run().await;

        assert!(store.appended.lock().is_empty());
        let spilled = store.spilled.lock();
        assert_eq!(spilled.len(), 1);
        assert_eq!(spilled[0].len(), 5);
        assert_eq!(hub.spilled_batches(), 1);
        // Spilled, not silently dropped.
        assert_eq!(hub.dropped_records(), 0);
    }
}
