// =============================================================================
// Trade History — bounded, ordered per-symbol trade buffer
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Px, Trade};

/// Per-symbol ring state.
struct SymbolHistory {
    trades: VecDeque<Trade>,
    /// Highest accepted trade id; appends must strictly exceed it.
    last_id: u64,
    accepted: u64,
    rejected: u64,
}

impl SymbolHistory {
    fn new(capacity: usize) -> Self {
        Self {
            trades: VecDeque::with_capacity(capacity),
            last_id: 0,
            accepted: 0,
            rejected: 0,
        }
    }
}

/// Accepted/rejected counters for one symbol's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Fixed-capacity ordered history of trades per symbol. Duplicate or
/// out-of-order trade ids are dropped, never reordered; at capacity the
/// oldest entry is evicted as the newest is inserted. Readers receive owned
/// copies that reflect the contents at call time.
pub struct TradeHistory {
    buffers: RwLock<HashMap<String, SymbolHistory>>,
    capacity: usize,
}

impl TradeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a trade. Returns `false` (and drops the trade) when its id is
    /// not strictly greater than the last accepted id for the symbol.
    pub fn append(&self, trade: Trade) -> bool {
        let mut map = self.buffers.write();
        let hist = map
            .entry(trade.symbol.clone())
            .or_insert_with(|| SymbolHistory::new(self.capacity));

        if hist.last_id != 0 && trade.trade_id <= hist.last_id {
            hist.rejected += 1;
            debug!(
                symbol = %trade.symbol,
                trade_id = trade.trade_id,
                last_id = hist.last_id,
                "out-of-order trade dropped"
            );
            return false;
        }

        hist.last_id = trade.trade_id;
        hist.accepted += 1;
        if hist.trades.len() == self.capacity {
            hist.trades.pop_front();
        }
        hist.trades.push_back(trade);
        true
    }

    /// The most recent `k` trades, oldest first.
    pub fn recent(&self, symbol: &str, k: usize) -> Vec<Trade> {
        let map = self.buffers.read();
        match map.get(symbol) {
            Some(hist) => {
                let start = hist.trades.len().saturating_sub(k);
                hist.trades.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// All retained trades with `ts_ms >= since_ms`, oldest first.
    pub fn since(&self, symbol: &str, since_ms: i64) -> Vec<Trade> {
        let map = self.buffers.read();
        match map.get(symbol) {
            Some(hist) => hist
                .trades
                .iter()
                .filter(|t| t.ts_ms >= since_ms)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Price of the most recent accepted trade, if any.
    pub fn last_price(&self, symbol: &str) -> Option<Px> {
        let map = self.buffers.read();
        map.get(symbol)
            .and_then(|hist| hist.trades.back().map(|t| t.price))
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.buffers.read().get(symbol).map_or(0, |h| h.trades.len())
    }

    pub fn stats(&self, symbol: &str) -> HistoryStats {
        let map = self.buffers.read();
        map.get(symbol).map_or(
            HistoryStats {
                accepted: 0,
                rejected: 0,
            },
            |h| HistoryStats {
                accepted: h.accepted,
                rejected: h.rejected,
            },
        )
    }

    /// Drop a symbol entirely (unsubscribe).
    pub fn remove(&self, symbol: &str) {
        self.buffers.write().remove(symbol);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Qty, TradeSide};

    fn trade(symbol: &str, id: u64, ts_ms: i64) -> Trade {
        Trade {
            trade_id: id,
            symbol: symbol.into(),
            price: Px::parse("100.5").unwrap(),
            qty: Qty::parse("0.25").unwrap(),
            side: if id % 2 == 0 {
                TradeSide::Buy
            } else {
                TradeSide::Sell
            },
            ts_ms,
        }
    }

    #[test]
    fn eviction_keeps_exactly_last_capacity_trades() {
        let hist = TradeHistory::new(1000);
        for id in 1..=1500u64 {
            assert!(hist.append(trade("BTCUSDT", id, id as i64)));
        }

        assert_eq!(hist.len("BTCUSDT"), 1000);
        let all = hist.recent("BTCUSDT", 2000);
        assert_eq!(all.len(), 1000);
        assert_eq!(all.first().unwrap().trade_id, 501);
        assert_eq!(all.last().unwrap().trade_id, 1500);
        // In id order throughout.
        assert!(all.windows(2).all(|w| w[0].trade_id < w[1].trade_id));
    }

    #[test]
    fn out_of_order_and_duplicate_ids_rejected() {
        let hist = TradeHistory::new(10);
        assert!(hist.append(trade("BTCUSDT", 5, 0)));
        assert!(!hist.append(trade("BTCUSDT", 5, 0))); // duplicate
        assert!(!hist.append(trade("BTCUSDT", 3, 0))); // regression
        assert!(hist.append(trade("BTCUSDT", 6, 0)));

        assert_eq!(hist.len("BTCUSDT"), 2);
        let stats = hist.stats("BTCUSDT");
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 2);
    }

    #[test]
    fn recent_returns_snapshot_not_live_view() {
        let hist = TradeHistory::new(10);
        for id in 1..=3u64 {
            hist.append(trade("BTCUSDT", id, id as i64));
        }
        let before = hist.recent("BTCUSDT", 10);
        hist.append(trade("BTCUSDT", 4, 4));

        // The earlier copy is unaffected by the later append.
        assert_eq!(before.len(), 3);
        assert_eq!(hist.recent("BTCUSDT", 10).len(), 4);
    }

    #[test]
    fn recent_limits_to_k_newest() {
        let hist = TradeHistory::new(100);
        for id in 1..=20u64 {
            hist.append(trade("BTCUSDT", id, id as i64));
        }
        let last5 = hist.recent("BTCUSDT", 5);
        let ids: Vec<u64> = last5.iter().map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![16, 17, 18, 19, 20]);
    }

    #[test]
    fn since_filters_by_timestamp() {
        let hist = TradeHistory::new(100);
        for id in 1..=10u64 {
            hist.append(trade("BTCUSDT", id, id as i64 * 1000));
        }
        let recent = hist.since("BTCUSDT", 7000);
        let ids: Vec<u64> = recent.iter().map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
    }

    #[test]
    fn symbols_are_independent() {
        let hist = TradeHistory::new(10);
        hist.append(trade("BTCUSDT", 100, 0));
        hist.append(trade("ETHUSDT", 1, 0));

        // ETH's low id is fine — ordering is per symbol.
        assert_eq!(hist.len("BTCUSDT"), 1);
        assert_eq!(hist.len("ETHUSDT"), 1);
        assert_eq!(hist.recent("SOLUSDT", 5), Vec::<Trade>::new());
    }

    #[test]
    fn last_price_tracks_newest_accepted() {
        let hist = TradeHistory::new(10);
        assert_eq!(hist.last_price("BTCUSDT"), None);
        hist.append(trade("BTCUSDT", 1, 0));
        assert_eq!(hist.last_price("BTCUSDT"), Px::parse("100.5"));
    }

    #[test]
    fn remove_discards_symbol() {
        let hist = TradeHistory::new(10);
        hist.append(trade("BTCUSDT", 1, 0));
        hist.remove("BTCUSDT");
        assert_eq!(hist.len("BTCUSDT"), 0);
    }
}
