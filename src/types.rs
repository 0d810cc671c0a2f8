// =============================================================================
// Shared types used across the Coinwatch market recorder
// =============================================================================
//
// Prices and quantities are fixed-point `i64` tick values (8 decimal places)
// so that book reconstruction and replay are exact — two books built from the
// same update stream compare equal tick-for-tick, with no float drift.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Number of decimal places carried by [`Px`] and [`Qty`].
pub const FIXED_DECIMALS: u32 = 8;

/// Tick scale: 1.0 == `FIXED_SCALE` ticks.
pub const FIXED_SCALE: i64 = 100_000_000;

/// Parse a decimal string (the wire format for prices/quantities) into ticks
/// without going through `f64`.
///
/// Digits beyond the supported precision must still be digits but are
/// truncated. Returns `None` on anything that is not a plain decimal number.
fn parse_fixed(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let mut parts = body.splitn(2, '.');
    let int_part = parts.next()?;
    let frac_part = parts.next().unwrap_or("");
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let int_val: i64 = if int_part.is_empty() {
        0
    } else {
        if !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        int_part.parse().ok()?
    };

    let mut frac_val: i64 = 0;
    let mut place = FIXED_SCALE / 10;
    for (i, c) in frac_part.chars().enumerate() {
        let d = c.to_digit(10)? as i64;
        if (i as u32) < FIXED_DECIMALS {
            frac_val += d * place;
            place /= 10;
        }
    }

    let ticks = int_val.checked_mul(FIXED_SCALE)?.checked_add(frac_val)?;
    Some(if neg { -ticks } else { ticks })
}

fn fmt_fixed(ticks: i64, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let abs = ticks.unsigned_abs();
    let int = abs / FIXED_SCALE as u64;
    let frac = abs % FIXED_SCALE as u64;
    if ticks < 0 {
        write!(f, "-")?;
    }
    if frac == 0 {
        write!(f, "{int}")
    } else {
        let digits = format!("{frac:08}");
        write!(f, "{}.{}", int, digits.trim_end_matches('0'))
    }
}

/// Price in fixed-point ticks (1 tick = 10⁻⁸).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(i64);

impl Px {
    pub const ZERO: Self = Self(0);

    /// Parse from the decimal string carried on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        parse_fixed(s).map(Self)
    }

    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    pub const fn as_ticks(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Px {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_fixed(self.0, f)
    }
}

/// Quantity in fixed-point units (1 unit = 10⁻⁸). Zero means "remove level"
/// in depth updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Qty(i64);

impl Qty {
    pub const ZERO: Self = Self(0);

    pub fn parse(s: &str) -> Option<Self> {
        parse_fixed(s).map(Self)
    }

    pub const fn from_units(units: i64) -> Self {
        Self(units)
    }

    pub const fn as_units(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Qty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_fixed(self.0, f)
    }
}

// ---------------------------------------------------------------------------
// Sides
// ---------------------------------------------------------------------------

/// Order-book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "Bid"),
            Self::Ask => write!(f, "Ask"),
        }
    }
}

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// One price level of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Px,
    pub qty: Qty,
}

/// Immutable point-in-time copy of one symbol's book, safe to hand to any
/// reader. Bids are ordered descending by price, asks ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Mid price in ticks, when both sides are present.
    pub fn mid(&self) -> Option<Px> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => {
                Some(Px::from_ticks((b.price.as_ticks() + a.price.as_ticks()) / 2))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// A single trade print. `trade_id` is strictly increasing per symbol stream;
/// anything else is dropped upstream, never reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: u64,
    pub symbol: String,
    pub price: Px,
    pub qty: Qty,
    pub side: TradeSide,
    pub ts_ms: i64,
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of the managed exchange connection. Exactly one instance per
/// connection; transitions drive the reconnect/resync logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Synced,
    Resyncing,
    Degraded,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Synced => write!(f, "Synced"),
            Self::Resyncing => write!(f, "Resyncing"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoded feed events
// ---------------------------------------------------------------------------

/// Incremental depth update. Valid only when `first_update_id` continues the
/// book's last applied id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthDeltaEvent {
    pub symbol: String,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub ts_ms: i64,
}

/// Full depth snapshot that replaces book state wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshotEvent {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub ts_ms: i64,
}

/// A decoded inbound event, routed by the dispatcher.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Trade(Trade),
    DepthDelta(DepthDeltaEvent),
    DepthSnapshot(DepthSnapshotEvent),
    StateChanged(ConnectionState),
}

impl FeedEvent {
    /// Symbol this event belongs to, when it is per-symbol.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Trade(t) => Some(&t.symbol),
            Self::DepthDelta(d) => Some(&d.symbol),
            Self::DepthSnapshot(s) => Some(&s.symbol),
            Self::StateChanged(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence records
// ---------------------------------------------------------------------------

/// One row of the order-book-events table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDeltaRecord {
    pub symbol: String,
    pub update_id: u64,
    pub side: Side,
    pub price: Px,
    pub qty: Qty,
    pub ts_ms: i64,
}

/// A full book snapshot queued for persistence. Expanded into one
/// order-book-events row per level at write time. Never dropped by the
/// backpressure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshotRecord {
    pub symbol: String,
    pub update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub ts_ms: i64,
}

/// A record queued for persistence. Ownership moves into the batcher queue on
/// enqueue and the record is destroyed once durably flushed or dropped by the
/// backpressure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchRecord {
    Trade(Trade),
    BookDelta(BookDeltaRecord),
    BookSnapshot(BookSnapshotRecord),
}

impl BatchRecord {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade(t) => &t.symbol,
            Self::BookDelta(d) => &d.symbol,
            Self::BookSnapshot(s) => &s.symbol,
        }
    }

    /// Only trade records may be shed under backpressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Trade(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
