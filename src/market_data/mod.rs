pub mod order_book;
pub mod trade_history;

// Re-export the engine types for convenient access (e.g. `use crate::market_data::OrderBookEngine`).
pub use order_book::{DeltaOutcome, OrderBookEngine, SnapshotOutcome};
pub use trade_history::{HistoryStats, TradeHistory};
