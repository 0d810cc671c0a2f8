// =============================================================================
// Dispatcher — sharded per-symbol event routing
// =============================================================================
//
// Single logical routing point between the connection manager and the models.
// Per-symbol events are hashed onto a fixed set of shard workers, each fed by
// its own channel: every event for a symbol flows through the same shard, so
// per-symbol arrival order is preserved while symbols process in parallel.
//
// Connection-state changes are handled inline (they are not per-symbol) and
// republished through the hub. Accepted events produce batch records for the
// persistence queue; the queue's admission policy is the only place records
// are ever dropped.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::MonitorError;
use crate::hub::MarketHub;
use crate::market_data::{DeltaOutcome, OrderBookEngine, SnapshotOutcome, TradeHistory};
use crate::persistence::queue::{Enqueued, RecordQueue};
use crate::types::{
    BatchRecord, BookDeltaRecord, BookSnapshotRecord, ConnectionState, DepthDeltaEvent,
    DepthSnapshotEvent, FeedEvent, Trade,
};

/// Capacity of each shard's inbox.
const SHARD_CHANNEL_CAPACITY: usize = 1024;

fn shard_for(symbol: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

/// State shared by every shard worker.
struct ShardCtx {
    hub: Arc<MarketHub>,
    books: Arc<OrderBookEngine>,
    trades: Arc<TradeHistory>,
    queue: Arc<RecordQueue>,
    resync_tx: mpsc::Sender<String>,
}

impl ShardCtx {
    fn enqueue(&self, record: BatchRecord) {
        match self.queue.push(record) {
            Enqueued::Accepted => {}
            Enqueued::AcceptedShed(n) => {
                self.hub.set_backpressure(true);
                self.hub.add_dropped_records(n as u64);
            }
            Enqueued::Rejected => {
                warn!(error = %MonitorError::QueueFull, "record rejected by persistence queue");
                self.hub.add_dropped_records(1);
            }
        }
    }

    async fn request_resync(&self, symbol: String) {
        self.hub.inc_resyncs();
        if self.resync_tx.send(symbol).await.is_err() {
            debug!("resync channel closed");
        }
    }

    async fn on_trade(&self, trade: Trade) {
        let symbol = trade.symbol.clone();
        if self.trades.append(trade.clone()) {
            self.enqueue(BatchRecord::Trade(trade));
            self.hub.touch();
        } else {
            debug!(symbol = %symbol, trade_id = trade.trade_id, "trade rejected by history");
        }
    }

    async fn on_delta(&self, delta: DepthDeltaEvent) {
        match self.books.apply_delta(&delta) {
            DeltaOutcome::Applied => {
                for (side, levels) in [
                    (crate::types::Side::Bid, &delta.bids),
                    (crate::types::Side::Ask, &delta.asks),
                ] {
                    for level in levels {
                        self.enqueue(BatchRecord::BookDelta(BookDeltaRecord {
                            symbol: delta.symbol.clone(),
                            update_id: delta.final_update_id,
                            side,
                            price: level.price,
                            qty: level.qty,
                            ts_ms: delta.ts_ms,
                        }));
                    }
                }
                self.publish(&delta.symbol);
            }
            DeltaOutcome::GapResync => {
                self.request_resync(delta.symbol.clone()).await;
            }
            DeltaOutcome::Stale | DeltaOutcome::Buffered => {}
        }
    }

    async fn on_snapshot(&self, snap: DepthSnapshotEvent) {
        match self.books.apply_snapshot(&snap) {
            SnapshotOutcome::Synced { replayed } => {
                if replayed > 0 {
                    debug!(symbol = %snap.symbol, replayed, "buffered deltas replayed after snapshot");
                }
                self.enqueue(BatchRecord::BookSnapshot(BookSnapshotRecord {
                    symbol: snap.symbol.clone(),
                    update_id: snap.last_update_id,
                    bids: snap.bids.clone(),
                    asks: snap.asks.clone(),
                    ts_ms: snap.ts_ms,
                }));
                self.publish(&snap.symbol);
            }
            SnapshotOutcome::ResyncNeeded => {
                self.request_resync(snap.symbol.clone()).await;
            }
        }
    }

    /// Push the fresh immutable book copy to the hub. Never blocks on
    /// readers.
    fn publish(&self, symbol: &str) {
        if let Some(snapshot) = self.books.snapshot(symbol) {
            self.hub.publish_snapshot(snapshot);
        }
    }
}

async fn shard_worker(shard_id: usize, mut rx: mpsc::Receiver<FeedEvent>, ctx: Arc<ShardCtx>) {
    debug!(shard_id, "shard worker started");
    while let Some(event) = rx.recv().await {
        match event {
            FeedEvent::Trade(trade) => ctx.on_trade(trade).await,
            FeedEvent::DepthDelta(delta) => ctx.on_delta(delta).await,
            FeedEvent::DepthSnapshot(snap) => ctx.on_snapshot(snap).await,
            // Connection-level; routed inline by the dispatcher.
            FeedEvent::StateChanged(_) => {}
        }
    }
    debug!(shard_id, "shard worker stopped");
}

pub struct Dispatcher {
    config: Arc<Config>,
    hub: Arc<MarketHub>,
    books: Arc<OrderBookEngine>,
    trades: Arc<TradeHistory>,
    queue: Arc<RecordQueue>,
    resync_tx: mpsc::Sender<String>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        hub: Arc<MarketHub>,
        books: Arc<OrderBookEngine>,
        trades: Arc<TradeHistory>,
        queue: Arc<RecordQueue>,
        resync_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            config,
            hub,
            books,
            trades,
            queue,
            resync_tx,
        }
    }

    /// Route events until the inbound channel closes, then drain the shards
    /// and close the persistence queue so the batcher can final-flush.
    pub async fn run(self, mut events: mpsc::Receiver<FeedEvent>) {
        let shard_count = self.config.shard_count;
        let ctx = Arc::new(ShardCtx {
            hub: self.hub.clone(),
            books: self.books.clone(),
            trades: self.trades,
            queue: self.queue.clone(),
            resync_tx: self.resync_tx,
        });

        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for shard_id in 0..shard_count {
            let (tx, rx) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
            senders.push(tx);
            workers.push(tokio::spawn(shard_worker(shard_id, rx, ctx.clone())));
        }
        info!(shards = shard_count, "dispatcher started");

        while let Some(event) = events.recv().await {
            match event {
                FeedEvent::StateChanged(state) => {
                    if state == ConnectionState::Disconnected {
                        // Every book is stale until its post-reconnect
                        // snapshot arrives.
                        self.books.begin_resync_all();
                    }
                    self.hub.set_connection_state(state);
                }
                other => {
                    let symbol = other.symbol().unwrap_or_default();
                    let shard = shard_for(symbol, shard_count);
                    if senders[shard].send(other).await.is_err() {
                        warn!(shard, "shard channel closed — stopping dispatcher");
                        break;
                    }
                }
            }
        }

        // Feed is gone: let the shards drain, then hand off to the batcher.
        drop(senders);
        for worker in workers {
            let _ = worker.await;
        }
        self.queue.close();
        info!("dispatcher stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriceLevel, Px, Qty, TradeSide};

    fn level(price: &str, qty: &str) -> PriceLevel {
        PriceLevel {
            price: Px::parse(price).unwrap(),
            qty: Qty::parse(qty).unwrap(),
        }
    }

    fn trade(symbol: &str, id: u64) -> FeedEvent {
        FeedEvent::Trade(Trade {
            trade_id: id,
            symbol: symbol.into(),
            price: Px::parse("100").unwrap(),
            qty: Qty::parse("1").unwrap(),
            side: TradeSide::Buy,
            ts_ms: id as i64,
        })
    }

    fn snapshot(symbol: &str, id: u64) -> FeedEvent {
        FeedEvent::DepthSnapshot(DepthSnapshotEvent {
            symbol: symbol.into(),
            last_update_id: id,
            bids: vec![level("100", "1")],
            asks: vec![level("101", "1")],
            ts_ms: 0,
        })
    }

    fn delta(symbol: &str, first: u64, last: u64) -> FeedEvent {
        FeedEvent::DepthDelta(DepthDeltaEvent {
            symbol: symbol.into(),
            first_update_id: first,
            final_update_id: last,
            bids: vec![level("100", "2")],
            asks: vec![],
            ts_ms: 0,
        })
    }

    struct Fixture {
        hub: Arc<MarketHub>,
        books: Arc<OrderBookEngine>,
        trades: Arc<TradeHistory>,
        queue: Arc<RecordQueue>,
        resync_rx: mpsc::Receiver<String>,
        events_tx: mpsc::Sender<FeedEvent>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start() -> Fixture {
        let config = Arc::new(Config::default());
        let trades = Arc::new(TradeHistory::new(100));
        let hub = Arc::new(MarketHub::new(trades.clone()));
        let books = Arc::new(OrderBookEngine::new(16));
        let queue = Arc::new(RecordQueue::new(1000, 1000));
        let (resync_tx, resync_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);

        let dispatcher = Dispatcher::new(
            config,
            hub.clone(),
            books.clone(),
            trades.clone(),
            queue.clone(),
            resync_tx,
        );
        let handle = tokio::spawn(dispatcher.run(events_rx));

        Fixture {
            hub,
            books,
            trades,
            queue,
            resync_rx,
            events_tx,
            handle,
        }
    }

    async fn finish(fx: Fixture) -> Vec<BatchRecord> {
        drop(fx.events_tx);
        fx.handle.await.unwrap();
        let mut records = Vec::new();
        while let Some(chunk) = fx.queue.pop_chunk(1024).await {
            records.extend(chunk);
        }
        records
    }

    #[test]
    fn shard_assignment_is_stable() {
        let a = shard_for("BTCUSDT", 4);
        assert_eq!(a, shard_for("BTCUSDT", 4));
        assert!(a < 4);
    }

    #[tokio::test]
    async fn trades_route_to_history_and_queue() {
        let fx = start();
        fx.events_tx.send(trade("BTCUSDT", 1)).await.unwrap();
        fx.events_tx.send(trade("BTCUSDT", 2)).await.unwrap();
        // Duplicate id: accepted by neither history nor queue.
        fx.events_tx.send(trade("BTCUSDT", 2)).await.unwrap();

        let trades = fx.trades.clone();
        let records = finish(fx).await;

        assert_eq!(trades.len("BTCUSDT"), 2);
        let queued_trades = records
            .iter()
            .filter(|r| matches!(r, BatchRecord::Trade(_)))
            .count();
        assert_eq!(queued_trades, 2);
    }

    #[tokio::test]
    async fn snapshot_then_delta_updates_book_and_persists() {
        let fx = start();
        fx.events_tx.send(snapshot("BTCUSDT", 100)).await.unwrap();
        fx.events_tx.send(delta("BTCUSDT", 101, 101)).await.unwrap();

        let hub = fx.hub.clone();
        let records = finish(fx).await;

        let published = hub.current_snapshot("BTCUSDT").unwrap();
        assert_eq!(published.last_update_id, 101);
        assert_eq!(published.bids[0], level("100", "2"));

        let snapshots = records
            .iter()
            .filter(|r| matches!(r, BatchRecord::BookSnapshot(_)))
            .count();
        let deltas = records
            .iter()
            .filter(|r| matches!(r, BatchRecord::BookDelta(_)))
            .count();
        assert_eq!(snapshots, 1);
        assert_eq!(deltas, 1); // one changed level
    }

    #[tokio::test]
    async fn gap_requests_exactly_one_resync() {
        let mut fx = start();
        fx.events_tx.send(snapshot("BTCUSDT", 100)).await.unwrap();
        fx.events_tx.send(delta("BTCUSDT", 105, 105)).await.unwrap();
        // Deltas during resync buffer silently — no extra request.
        fx.events_tx.send(delta("BTCUSDT", 106, 106)).await.unwrap();

        let requested = fx.resync_rx.recv().await.unwrap();
        assert_eq!(requested, "BTCUSDT");

        let hub = fx.hub.clone();
        let resync_rx_probe = fx.resync_rx.try_recv();
        assert!(resync_rx_probe.is_err());
        assert_eq!(hub.resyncs(), 1);

        finish(fx).await;
    }

    #[tokio::test]
    async fn stale_deltas_produce_no_records() {
        let fx = start();
        fx.events_tx.send(snapshot("BTCUSDT", 100)).await.unwrap();
        fx.events_tx.send(delta("BTCUSDT", 95, 99)).await.unwrap();

        let records = finish(fx).await;
        let deltas = records
            .iter()
            .filter(|r| matches!(r, BatchRecord::BookDelta(_)))
            .count();
        assert_eq!(deltas, 0);
    }

    #[tokio::test]
    async fn disconnect_marks_books_stale_and_updates_hub() {
        let fx = start();
        fx.events_tx.send(snapshot("BTCUSDT", 100)).await.unwrap();
        // The snapshot crosses a shard worker while state changes are routed
        // inline; wait for it to land before disconnecting.
        while fx.hub.current_snapshot("BTCUSDT").is_none() {
            tokio::task::yield_now().await;
        }
        fx.events_tx
            .send(FeedEvent::StateChanged(ConnectionState::Synced))
            .await
            .unwrap();
        fx.events_tx
            .send(FeedEvent::StateChanged(ConnectionState::Disconnected))
            .await
            .unwrap();

        let hub = fx.hub.clone();
        let books = fx.books.clone();
        finish(fx).await;

        assert_eq!(hub.connection_state(), ConnectionState::Disconnected);
        assert!(!hub.is_live());
        // Engine book discarded; the hub keeps the last published copy for
        // viewers, flagged stale via the connection state.
        assert!(books.snapshot("BTCUSDT").is_none());
        assert!(hub.current_snapshot("BTCUSDT").is_some());
    }

    #[tokio::test]
    async fn per_symbol_order_preserved_under_load() {
        let fx = start();
        fx.events_tx.send(snapshot("BTCUSDT", 0)).await.unwrap();
        for id in 1..=200u64 {
            fx.events_tx.send(delta("BTCUSDT", id, id)).await.unwrap();
        }

        let books = fx.books.clone();
        finish(fx).await;

        // Every delta applied in order: any reordering would have tripped the
        // gap detector and discarded the book.
        assert_eq!(books.snapshot("BTCUSDT").unwrap().last_update_id, 200);
    }

    #[tokio::test]
    async fn queue_closed_after_run_ends() {
        let fx = start();
        fx.events_tx.send(trade("BTCUSDT", 1)).await.unwrap();
        let queue = fx.queue.clone();
        finish(fx).await;
        assert!(queue.pop_chunk(1).await.is_none());
    }
}
