// =============================================================================
// Order Book Engine — authoritative per-symbol book reconstruction
// =============================================================================
//
// Books are rebuilt from one snapshot plus a contiguous run of deltas. A
// delta is accepted only when `first_update_id == last_update_id + 1`; on a
// gap the stale book is discarded and the symbol waits in Resyncing for a
// fresh snapshot, buffering a bounded number of in-flight deltas that are
// replayed if they still join up with the snapshot's id.
//
// Sides live in `BTreeMap<Px, Qty>` so at most one level can exist per price
// and snapshots come out sorted for free.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::types::{
    DepthDeltaEvent, DepthSnapshotEvent, OrderBookSnapshot, PriceLevel, Px, Qty,
};

/// Result of feeding one delta to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Contiguous; merged into the book and `last_update_id` advanced.
    Applied,
    /// `first_update_id <= last_update_id` — already applied, dropped.
    Stale,
    /// Symbol is resyncing; the delta was buffered for replay.
    Buffered,
    /// Continuity lost. The book was discarded and the caller must request a
    /// fresh snapshot. Returned exactly once per gap.
    GapResync,
}

/// Result of applying a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Book replaced; any buffered deltas that still fit were replayed.
    Synced { replayed: usize },
    /// Buffered deltas no longer join up with the snapshot id; the caller
    /// must request another snapshot.
    ResyncNeeded,
}

/// Mutable book state for one symbol. Owned by the engine; never escapes.
struct BookState {
    bids: BTreeMap<Px, Qty>,
    asks: BTreeMap<Px, Qty>,
    last_update_id: u64,
    resyncing: bool,
    /// Deltas held while awaiting a resync snapshot, oldest first.
    pending: VecDeque<DepthDeltaEvent>,
}

impl BookState {
    fn new_resyncing() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            resyncing: true,
            pending: VecDeque::new(),
        }
    }

    fn reset_from(&mut self, snap: &DepthSnapshotEvent) {
        self.bids.clear();
        self.asks.clear();
        for level in &snap.bids {
            if !level.qty.is_zero() {
                self.bids.insert(level.price, level.qty);
            }
        }
        for level in &snap.asks {
            if !level.qty.is_zero() {
                self.asks.insert(level.price, level.qty);
            }
        }
        self.last_update_id = snap.last_update_id;
    }

    /// Merge a contiguous delta. Zero quantity removes the level.
    fn merge(&mut self, delta: &DepthDeltaEvent) {
        for level in &delta.bids {
            if level.qty.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.qty);
            }
        }
        for level in &delta.asks {
            if level.qty.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.qty);
            }
        }
        self.last_update_id = delta.final_update_id;
    }

    fn discard(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
        self.resyncing = true;
    }

    fn to_snapshot(&self, symbol: &str) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            last_update_id: self.last_update_id,
            bids: self
                .bids
                .iter()
                .rev()
                .map(|(&price, &qty)| PriceLevel { price, qty })
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(&price, &qty)| PriceLevel { price, qty })
                .collect(),
        }
    }
}

/// Thread-safe engine holding every symbol's book. Writers go through the
/// dispatcher shards (one shard per symbol, so per-symbol ordering holds);
/// readers only ever receive cloned snapshots.
pub struct OrderBookEngine {
    books: RwLock<HashMap<String, BookState>>,
    resync_buffer_max: usize,
}

impl OrderBookEngine {
    pub fn new(resync_buffer_max: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            resync_buffer_max: resync_buffer_max.max(1),
        }
    }

    /// Replace a symbol's book wholesale and replay any buffered deltas that
    /// still continue the snapshot's id.
    pub fn apply_snapshot(&self, snap: &DepthSnapshotEvent) -> SnapshotOutcome {
        let mut books = self.books.write();
        let book = books
            .entry(snap.symbol.clone())
            .or_insert_with(BookState::new_resyncing);

        book.reset_from(snap);

        let mut replayed = 0;
        while let Some(delta) = book.pending.pop_front() {
            if delta.final_update_id <= book.last_update_id {
                // Fully covered by the snapshot.
                continue;
            }
            if delta.first_update_id == book.last_update_id + 1 {
                book.merge(&delta);
                replayed += 1;
            } else {
                // The buffered run no longer joins up with this snapshot.
                warn!(
                    symbol = %snap.symbol,
                    snapshot_id = snap.last_update_id,
                    delta_first = delta.first_update_id,
                    "buffered deltas discontinuous after snapshot — resyncing again"
                );
                book.pending.clear();
                book.discard();
                return SnapshotOutcome::ResyncNeeded;
            }
        }

        book.resyncing = false;
        debug!(
            symbol = %snap.symbol,
            last_update_id = book.last_update_id,
            replayed,
            "snapshot applied"
        );
        SnapshotOutcome::Synced { replayed }
    }

    /// Feed one incremental update.
    pub fn apply_delta(&self, delta: &DepthDeltaEvent) -> DeltaOutcome {
        let mut books = self.books.write();
        let book = books
            .entry(delta.symbol.clone())
            .or_insert_with(BookState::new_resyncing);

        if book.resyncing {
            self.buffer_pending(book, delta);
            return DeltaOutcome::Buffered;
        }

        if delta.final_update_id <= book.last_update_id {
            return DeltaOutcome::Stale;
        }

        if delta.first_update_id == book.last_update_id + 1 {
            book.merge(delta);
            return DeltaOutcome::Applied;
        }

        // Gap: discard the stale book and hold this delta for replay.
        let gap = MonitorError::SequenceGap {
            symbol: delta.symbol.clone(),
            expected: book.last_update_id + 1,
            got: delta.first_update_id,
        };
        warn!(error = %gap, "discarding book and requesting snapshot");
        book.discard();
        self.buffer_pending(book, delta);
        DeltaOutcome::GapResync
    }

    fn buffer_pending(&self, book: &mut BookState, delta: &DepthDeltaEvent) {
        if book.pending.len() >= self.resync_buffer_max {
            book.pending.pop_front();
            debug!(
                symbol = %delta.symbol,
                max = self.resync_buffer_max,
                "resync buffer full — evicted oldest buffered delta"
            );
        }
        book.pending.push_back(delta.clone());
    }

    /// Immutable copy of a symbol's book, or `None` while unknown/resyncing.
    pub fn snapshot(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        let books = self.books.read();
        books
            .get(symbol)
            .filter(|b| !b.resyncing)
            .map(|b| b.to_snapshot(symbol))
    }

    /// Mark every tracked symbol as resyncing (connection was lost; all books
    /// are stale until fresh snapshots arrive).
    pub fn begin_resync_all(&self) {
        let mut books = self.books.write();
        for (symbol, book) in books.iter_mut() {
            if !book.resyncing {
                debug!(symbol = %symbol, "book marked resyncing");
            }
            book.pending.clear();
            book.discard();
        }
    }

    /// Drop a symbol entirely (unsubscribe).
    pub fn remove(&self, symbol: &str) {
        self.books.write().remove(symbol);
    }

    #[cfg(test)]
    fn pending_len(&self, symbol: &str) -> usize {
        self.books
            .read()
            .get(symbol)
            .map_or(0, |b| b.pending.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriceLevel, Px, Qty};

    fn level(price: &str, qty: &str) -> PriceLevel {
        PriceLevel {
            price: Px::parse(price).unwrap(),
            qty: Qty::parse(qty).unwrap(),
        }
    }

    fn snapshot_event(symbol: &str, id: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthSnapshotEvent {
        DepthSnapshotEvent {
            symbol: symbol.into(),
            last_update_id: id,
            bids,
            asks,
            ts_ms: 0,
        }
    }

    fn delta_event(symbol: &str, first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthDeltaEvent {
        DepthDeltaEvent {
            symbol: symbol.into(),
            first_update_id: first,
            final_update_id: last,
            bids,
            asks,
            ts_ms: 0,
        }
    }

    fn seeded_engine(symbol: &str) -> OrderBookEngine {
        let engine = OrderBookEngine::new(16);
        let snap = snapshot_event(
            symbol,
            100,
            vec![level("100", "1"), level("99", "2")],
            vec![level("101", "1"), level("102", "3")],
        );
        assert_eq!(
            engine.apply_snapshot(&snap),
            SnapshotOutcome::Synced { replayed: 0 }
        );
        engine
    }

    #[test]
    fn contiguous_deltas_merge_and_advance() {
        let engine = seeded_engine("BTCUSDT");

        // id 101: new bid level + update an ask.
        let d1 = delta_event(
            "BTCUSDT",
            101,
            101,
            vec![level("100.5", "4")],
            vec![level("101", "0.5")],
        );
        assert_eq!(engine.apply_delta(&d1), DeltaOutcome::Applied);

        // id 102: remove a bid via zero qty.
        let d2 = delta_event("BTCUSDT", 102, 102, vec![level("99", "0")], vec![]);
        assert_eq!(engine.apply_delta(&d2), DeltaOutcome::Applied);

        let snap = engine.snapshot("BTCUSDT").unwrap();
        assert_eq!(snap.last_update_id, 102);
        // Bids descending: 100.5 then 100 (99 removed).
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[0], level("100.5", "4"));
        assert_eq!(snap.bids[1], level("100", "1"));
        // Ask at 101 updated in place — still one level per price.
        assert_eq!(snap.asks[0], level("101", "0.5"));
        assert_eq!(snap.asks[1], level("102", "3"));
    }

    #[test]
    fn sides_stay_sorted_with_one_level_per_price() {
        let engine = seeded_engine("BTCUSDT");
        let d = delta_event(
            "BTCUSDT",
            101,
            103,
            vec![level("98", "1"), level("100.25", "1"), level("100", "9")],
            vec![level("103", "1"), level("100.75", "2")],
        );
        assert_eq!(engine.apply_delta(&d), DeltaOutcome::Applied);

        let snap = engine.snapshot("BTCUSDT").unwrap();
        let bid_prices: Vec<_> = snap.bids.iter().map(|l| l.price).collect();
        let mut sorted = bid_prices.clone();
        sorted.sort();
        sorted.reverse();
        assert_eq!(bid_prices, sorted);

        let ask_prices: Vec<_> = snap.asks.iter().map(|l| l.price).collect();
        let mut sorted = ask_prices.clone();
        sorted.sort();
        assert_eq!(ask_prices, sorted);

        // Price 100 appears exactly once with the updated quantity.
        let at_100: Vec<_> = snap
            .bids
            .iter()
            .filter(|l| l.price == Px::parse("100").unwrap())
            .collect();
        assert_eq!(at_100.len(), 1);
        assert_eq!(at_100[0].qty, Qty::parse("9").unwrap());
    }

    #[test]
    fn stale_delta_dropped_silently() {
        let engine = seeded_engine("BTCUSDT");
        let before = engine.snapshot("BTCUSDT").unwrap();

        let stale = delta_event("BTCUSDT", 95, 100, vec![level("1", "1")], vec![]);
        assert_eq!(engine.apply_delta(&stale), DeltaOutcome::Stale);
        assert_eq!(engine.snapshot("BTCUSDT").unwrap(), before);
    }

    #[test]
    fn gap_triggers_exactly_one_resync() {
        let engine = seeded_engine("BTCUSDT");

        let gapped = delta_event("BTCUSDT", 105, 105, vec![level("100", "7")], vec![]);
        assert_eq!(engine.apply_delta(&gapped), DeltaOutcome::GapResync);

        // Book is discarded while resyncing.
        assert!(engine.snapshot("BTCUSDT").is_none());

        // Follow-up deltas buffer without signalling again.
        let next = delta_event("BTCUSDT", 106, 106, vec![], vec![level("102", "1")]);
        assert_eq!(engine.apply_delta(&next), DeltaOutcome::Buffered);
        assert_eq!(engine.pending_len("BTCUSDT"), 2);
    }

    #[test]
    fn resync_replays_buffered_deltas_that_still_fit() {
        let engine = seeded_engine("BTCUSDT");

        let gapped = delta_event("BTCUSDT", 105, 105, vec![level("100", "7")], vec![]);
        assert_eq!(engine.apply_delta(&gapped), DeltaOutcome::GapResync);
        let next = delta_event("BTCUSDT", 106, 106, vec![], vec![level("102", "9")]);
        assert_eq!(engine.apply_delta(&next), DeltaOutcome::Buffered);

        // Fresh snapshot at 104: buffered 105 and 106 continue it.
        let snap = snapshot_event("BTCUSDT", 104, vec![level("100", "2")], vec![level("102", "1")]);
        assert_eq!(
            engine.apply_snapshot(&snap),
            SnapshotOutcome::Synced { replayed: 2 }
        );

        let book = engine.snapshot("BTCUSDT").unwrap();
        assert_eq!(book.last_update_id, 106);
        assert_eq!(book.bids[0], level("100", "7"));
        assert_eq!(book.asks[0], level("102", "9"));
    }

    #[test]
    fn resync_with_stale_buffered_deltas_skips_them() {
        let engine = seeded_engine("BTCUSDT");
        assert_eq!(
            engine.apply_delta(&delta_event("BTCUSDT", 105, 105, vec![level("100", "7")], vec![])),
            DeltaOutcome::GapResync
        );

        // Snapshot already covers id 105; nothing to replay.
        let snap = snapshot_event("BTCUSDT", 110, vec![level("100", "5")], vec![level("101", "5")]);
        assert_eq!(
            engine.apply_snapshot(&snap),
            SnapshotOutcome::Synced { replayed: 0 }
        );
        assert_eq!(engine.snapshot("BTCUSDT").unwrap().last_update_id, 110);
    }

    #[test]
    fn resync_discontinuous_buffer_requests_again() {
        let engine = seeded_engine("BTCUSDT");
        assert_eq!(
            engine.apply_delta(&delta_event("BTCUSDT", 105, 105, vec![], vec![])),
            DeltaOutcome::GapResync
        );

        // Snapshot at 102 leaves a hole before the buffered 105.
        let snap = snapshot_event("BTCUSDT", 102, vec![level("100", "1")], vec![level("101", "1")]);
        assert_eq!(engine.apply_snapshot(&snap), SnapshotOutcome::ResyncNeeded);
        assert!(engine.snapshot("BTCUSDT").is_none());
        assert_eq!(engine.pending_len("BTCUSDT"), 0);
    }

    #[test]
    fn resync_buffer_is_bounded() {
        let engine = OrderBookEngine::new(4);
        let snap = snapshot_event("BTCUSDT", 10, vec![level("100", "1")], vec![level("101", "1")]);
        engine.apply_snapshot(&snap);
        engine.apply_delta(&delta_event("BTCUSDT", 20, 20, vec![], vec![]));

        for id in 21..30 {
            engine.apply_delta(&delta_event("BTCUSDT", id, id, vec![], vec![]));
        }
        assert_eq!(engine.pending_len("BTCUSDT"), 4);
    }

    #[test]
    fn deltas_before_first_snapshot_are_buffered() {
        let engine = OrderBookEngine::new(16);
        let d = delta_event("ETHUSDT", 7, 7, vec![level("2000", "1")], vec![]);
        assert_eq!(engine.apply_delta(&d), DeltaOutcome::Buffered);
        assert!(engine.snapshot("ETHUSDT").is_none());

        let snap = snapshot_event("ETHUSDT", 6, vec![], vec![level("2001", "1")]);
        assert_eq!(
            engine.apply_snapshot(&snap),
            SnapshotOutcome::Synced { replayed: 1 }
        );
        let book = engine.snapshot("ETHUSDT").unwrap();
        assert_eq!(book.last_update_id, 7);
        assert_eq!(book.bids[0], level("2000", "1"));
    }

    #[test]
    fn begin_resync_all_discards_every_book() {
        let engine = seeded_engine("BTCUSDT");
        engine.apply_snapshot(&snapshot_event("ETHUSDT", 50, vec![level("2000", "1")], vec![]));

        engine.begin_resync_all();
        assert!(engine.snapshot("BTCUSDT").is_none());
        assert!(engine.snapshot("ETHUSDT").is_none());
    }

    #[test]
    fn remove_discards_symbol() {
        let engine = seeded_engine("BTCUSDT");
        engine.remove("BTCUSDT");
        assert!(engine.snapshot("BTCUSDT").is_none());
    }

    // Reference recomputation: replay the same snapshot + deltas through an
    // independent sorted-vec book and compare level-for-level.
    #[test]
    fn replay_matches_reference_recomputation() {
        let symbol = "BTCUSDT";
        let snap = snapshot_event(
            symbol,
            1000,
            vec![level("100", "1"), level("99.5", "2"), level("99", "3")],
            vec![level("100.5", "1"), level("101", "2")],
        );
        let deltas: Vec<DepthDeltaEvent> = (0..50)
            .map(|i| {
                let id = 1001 + i;
                let px = format!("{}", 95 + (i * 7) % 12);
                let qty = format!("{}", (i * 3) % 5); // zero every 5th — removals included
                if i % 2 == 0 {
                    delta_event(symbol, id, id, vec![level(&px, &qty)], vec![])
                } else {
                    delta_event(symbol, id, id, vec![], vec![level(&px, &qty)])
                }
            })
            .collect();

        let engine = OrderBookEngine::new(16);
        engine.apply_snapshot(&snap);
        for d in &deltas {
            assert_eq!(engine.apply_delta(d), DeltaOutcome::Applied);
        }
        let got = engine.snapshot(symbol).unwrap();

        // Independent reference: plain maps, rebuilt from scratch.
        let mut ref_bids: std::collections::BTreeMap<Px, Qty> = snap
            .bids
            .iter()
            .map(|l| (l.price, l.qty))
            .collect();
        let mut ref_asks: std::collections::BTreeMap<Px, Qty> = snap
            .asks
            .iter()
            .map(|l| (l.price, l.qty))
            .collect();
        for d in &deltas {
            for l in &d.bids {
                if l.qty.is_zero() {
                    ref_bids.remove(&l.price);
                } else {
                    ref_bids.insert(l.price, l.qty);
                }
            }
            for l in &d.asks {
                if l.qty.is_zero() {
                    ref_asks.remove(&l.price);
                } else {
                    ref_asks.insert(l.price, l.qty);
                }
            }
        }

        let want_bids: Vec<PriceLevel> = ref_bids
            .iter()
            .rev()
            .map(|(&price, &qty)| PriceLevel { price, qty })
            .collect();
        let want_asks: Vec<PriceLevel> = ref_asks
            .iter()
            .map(|(&price, &qty)| PriceLevel { price, qty })
            .collect();

        assert_eq!(got.bids, want_bids);
        assert_eq!(got.asks, want_asks);
        assert_eq!(got.last_update_id, 1050);
    }
}
