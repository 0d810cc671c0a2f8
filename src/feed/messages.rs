// =============================================================================
// Wire messages — decoding the exchange WebSocket protocol
// =============================================================================
//
// One canonical protocol shape: subscribe requests name `<symbol>@trade` /
// `<symbol>@depth` channels; the depth channel answers with a full snapshot
// (`lastUpdateId`) followed by incremental `depthUpdate` deltas. Numeric
// prices/quantities arrive as decimal strings and are parsed straight into
// fixed-point ticks.
// =============================================================================

use serde::Deserialize;
use serde_json::json;

use crate::error::MonitorError;
use crate::types::{
    DepthDeltaEvent, DepthSnapshotEvent, FeedEvent, PriceLevel, Px, Qty, Trade, TradeSide,
};

// ---------------------------------------------------------------------------
// Raw payloads
// ---------------------------------------------------------------------------

/// Incremental depth update frame.
///
/// Expected shape:
/// ```json
/// { "e": "depthUpdate", "E": 1700000000000, "s": "BTCUSDT",
///   "U": 101, "u": 103,
///   "b": [["37000.00", "1.5"]], "a": [["37001.00", "0"]] }
/// ```
#[derive(Debug, Deserialize)]
struct RawDepthDelta {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

/// Full depth snapshot frame.
///
/// Expected shape:
/// ```json
/// { "s": "BTCUSDT", "lastUpdateId": 100,
///   "bids": [["37000.00", "1.5"]], "asks": [["37001.00", "1.2"]] }
/// ```
#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Trade print frame.
///
/// Expected shape:
/// ```json
/// { "e": "trade", "s": "BTCUSDT", "t": 12345,
///   "p": "37000.00", "q": "0.123", "m": true, "T": 1700000000000 }
/// ```
#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
    #[serde(rename = "T")]
    trade_time: i64,
}

// ---------------------------------------------------------------------------
// Subscribe frames
// ---------------------------------------------------------------------------

/// Subscribe request covering the trade and depth channels of `symbols`.
pub fn subscribe_frame(symbols: &[String], id: u64) -> String {
    let params: Vec<String> = symbols
        .iter()
        .flat_map(|s| {
            let lower = s.to_lowercase();
            [format!("{lower}@trade"), format!("{lower}@depth")]
        })
        .collect();
    json!({ "method": "SUBSCRIBE", "params": params, "id": id }).to_string()
}

/// Re-subscribe one symbol's depth channel; the exchange answers with a fresh
/// snapshot. Used for resync.
pub fn depth_subscribe_frame(symbol: &str, id: u64) -> String {
    let lower = symbol.to_lowercase();
    json!({ "method": "SUBSCRIBE", "params": [format!("{lower}@depth")], "id": id }).to_string()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn parse_levels(raw: &[[String; 2]], what: &str) -> Result<Vec<PriceLevel>, MonitorError> {
    raw.iter()
        .map(|[price, qty]| {
            let price = Px::parse(price).ok_or_else(|| {
                MonitorError::Protocol(format!("bad {what} price: {price:?}"))
            })?;
            let qty = Qty::parse(qty).ok_or_else(|| {
                MonitorError::Protocol(format!("bad {what} quantity: {qty:?}"))
            })?;
            Ok(PriceLevel { price, qty })
        })
        .collect()
}

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for frames that are valid but not events (subscribe
/// acks); `Err(MonitorError::Protocol)` for anything malformed. `recv_ms`
/// stamps messages that carry no exchange timestamp.
pub fn decode(text: &str, recv_ms: i64) -> Result<Option<FeedEvent>, MonitorError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| MonitorError::Protocol(format!("invalid JSON frame: {e}")))?;

    // Snapshots are recognised by their `lastUpdateId` field.
    if root.get("lastUpdateId").is_some() {
        let raw: RawDepthSnapshot = serde_json::from_value(root)
            .map_err(|e| MonitorError::Protocol(format!("bad depth snapshot: {e}")))?;
        return Ok(Some(FeedEvent::DepthSnapshot(DepthSnapshotEvent {
            symbol: raw.symbol.to_uppercase(),
            last_update_id: raw.last_update_id,
            bids: parse_levels(&raw.bids, "snapshot bid")?,
            asks: parse_levels(&raw.asks, "snapshot ask")?,
            ts_ms: recv_ms,
        })));
    }

    // Subscribe acknowledgement: {"result": null, "id": n} — not an event.
    if root.get("result").is_some() && root.get("id").is_some() {
        return Ok(None);
    }

    let event_type = root
        .get("e")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| MonitorError::Protocol("frame has no event type".into()))?;

    match event_type.as_str() {
        "depthUpdate" => {
            let raw: RawDepthDelta = serde_json::from_value(root)
                .map_err(|e| MonitorError::Protocol(format!("bad depth update: {e}")))?;
            let ts_ms = if raw.event_time > 0 { raw.event_time } else { recv_ms };
            Ok(Some(FeedEvent::DepthDelta(DepthDeltaEvent {
                symbol: raw.symbol.to_uppercase(),
                first_update_id: raw.first_update_id,
                final_update_id: raw.final_update_id,
                bids: parse_levels(&raw.bids, "delta bid")?,
                asks: parse_levels(&raw.asks, "delta ask")?,
                ts_ms,
            })))
        }
        "trade" => {
            let raw: RawTrade = serde_json::from_value(root)
                .map_err(|e| MonitorError::Protocol(format!("bad trade: {e}")))?;
            let price = Px::parse(&raw.price)
                .ok_or_else(|| MonitorError::Protocol(format!("bad trade price: {:?}", raw.price)))?;
            let qty = Qty::parse(&raw.quantity).ok_or_else(|| {
                MonitorError::Protocol(format!("bad trade quantity: {:?}", raw.quantity))
            })?;
            // Buyer is maker => the taker sold.
            let side = if raw.is_buyer_maker {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            };
            Ok(Some(FeedEvent::Trade(Trade {
                trade_id: raw.trade_id,
                symbol: raw.symbol.to_uppercase(),
                price,
                qty,
                side,
                ts_ms: raw.trade_time,
            })))
        }
        other => Err(MonitorError::Protocol(format!(
            "unexpected event type: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
