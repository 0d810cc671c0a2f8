// =============================================================================
// Coinwatch — real-time market data ingestion, reconstruction, persistence
// =============================================================================
//
// The pipeline: ConnectionManager (exchange WebSocket) → Dispatcher (sharded
// per-symbol routing) → OrderBookEngine / TradeHistory → PersistenceBatcher →
// append-only storage. View collaborators (console, GUI, visualisation)
// consume immutable snapshots and change notifications through the MarketHub;
// no rendering lives in this crate.
// =============================================================================

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod hub;
pub mod market_data;
pub mod persistence;
pub mod types;
