// =============================================================================
// Market Hub — read surface for view collaborators
// =============================================================================
//
// The single point where external viewers (console, GUI, visualisation — all
// outside this crate) observe the pipeline. Everything handed out is an
// immutable copy; readers never hold references into live mutable state, so
// reads never block ingestion.
//
// Change notification follows the version-counter pattern: every meaningful
// mutation bumps `version` and publishes it on a watch channel. Subscribers
// wake, then pull whatever snapshots they care about.
//
// Thread safety:
//   - Atomic counters for lock-free health gauges.
//   - parking_lot::RwLock for the snapshot map and connection state.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::market_data::TradeHistory;
use crate::types::{ConnectionState, OrderBookSnapshot, Px, Trade};

/// Serialisable snapshot of the pipeline's health gauges.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connection_state: String,
    pub live: bool,
    pub backpressure: bool,
    pub dropped_records: u64,
    pub flushed_records: u64,
    pub flush_count: u64,
    pub spilled_batches: u64,
    pub resyncs: u64,
    pub decode_errors: u64,
    pub uptime_secs: u64,
}

/// Shared read surface between the pipeline and its viewers.
pub struct MarketHub {
    snapshots: RwLock<HashMap<String, OrderBookSnapshot>>,
    connection_state: RwLock<ConnectionState>,
    trades: Arc<TradeHistory>,

    /// Bumped on every meaningful mutation; the watch channel republishes it.
    version: AtomicU64,
    changed_tx: watch::Sender<u64>,

    backpressure: AtomicBool,
    dropped_records: AtomicU64,
    flushed_records: AtomicU64,
    flush_count: AtomicU64,
    spilled_batches: AtomicU64,
    resyncs: AtomicU64,
    decode_errors: AtomicU64,

    start_time: Instant,
}

impl MarketHub {
    pub fn new(trades: Arc<TradeHistory>) -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            snapshots: RwLock::new(HashMap::new()),
            connection_state: RwLock::new(ConnectionState::default()),
            trades,
            version: AtomicU64::new(0),
            changed_tx,
            backpressure: AtomicBool::new(false),
            dropped_records: AtomicU64::new(0),
            flushed_records: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            spilled_batches: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ── Pull surface ────────────────────────────────────────────────────

    /// Latest published book for a symbol, as an owned copy.
    pub fn current_snapshot(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.snapshots.read().get(symbol).cloned()
    }

    /// The most recent `k` trades for a symbol, oldest first.
    pub fn recent_trades(&self, symbol: &str, k: usize) -> Vec<Trade> {
        self.trades.recent(symbol, k)
    }

    /// Retained trades at or after `since_ms`, oldest first.
    pub fn trades_since(&self, symbol: &str, since_ms: i64) -> Vec<Trade> {
        self.trades.since(symbol, since_ms)
    }

    pub fn last_price(&self, symbol: &str) -> Option<Px> {
        self.trades.last_price(symbol)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.read()
    }

    /// Whether book reads reflect a synced, gap-free stream right now.
    pub fn is_live(&self) -> bool {
        self.connection_state() == ConnectionState::Synced
    }

    /// Subscribe to change notifications. The payload is the hub version;
    /// subscribers wake on change and pull what they need.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_state: self.connection_state().to_string(),
            live: self.is_live(),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            flushed_records: self.flushed_records.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            spilled_batches: self.spilled_batches.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    // ── Publish surface (pipeline side) ─────────────────────────────────

    /// Publish a fresh immutable book copy for a symbol.
    pub fn publish_snapshot(&self, snapshot: OrderBookSnapshot) {
        self.snapshots
            .write()
            .insert(snapshot.symbol.clone(), snapshot);
        self.touch();
    }

    /// Drop the published book for a symbol (unsubscribe).
    pub fn retract_snapshot(&self, symbol: &str) {
        self.snapshots.write().remove(symbol);
        self.touch();
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.connection_state.write() = state;
        self.touch();
    }

    /// Bump the version and wake subscribers.
    pub fn touch(&self) {
        let v = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.changed_tx.send(v);
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    // ── Counters ────────────────────────────────────────────────────────
    // All monotonic; never reset while the process lives.

    pub fn set_backpressure(&self, engaged: bool) {
        self.backpressure.store(engaged, Ordering::Relaxed);
    }

    pub fn backpressure(&self) -> bool {
        self.backpressure.load(Ordering::Relaxed)
    }

    pub fn add_dropped_records(&self, n: u64) {
        if n > 0 {
            self.dropped_records.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn dropped_records(&self) -> u64 {
        self.dropped_records.load(Ordering::Relaxed)
    }

    pub fn add_flushed_records(&self, n: u64) {
        self.flushed_records.fetch_add(n, Ordering::Relaxed);
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flushed_records(&self) -> u64 {
        self.flushed_records.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    pub fn inc_spilled_batches(&self) {
        self.spilled_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spilled_batches(&self) -> u64 {
        self.spilled_batches.load(Ordering::Relaxed)
    }

    pub fn inc_resyncs(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    pub fn inc_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
