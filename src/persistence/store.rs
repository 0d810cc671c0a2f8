// =============================================================================
// Batch Storage — append-only JSONL tables + spill fallback log
// =============================================================================
//
// Two tables under the data directory, one JSON row per line:
//   trades.jsonl       (trade_id, symbol, price, qty, side, ts_ms)
//   book_events.jsonl  (symbol, update_id, side, price, qty, event_type, ts_ms)
//
// A batch is staged entirely in memory and lands with one buffered write +
// flush + sync per table, so a batch is the durability unit. Failed writers
// are discarded and reopened on the next attempt. Batches that exhaust their
// retries go to spill.jsonl for manual or async recovery.
// =============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::types::{BatchRecord, Px, Qty, Side, TradeSide};

const TRADES_TABLE: &str = "trades.jsonl";
const BOOK_EVENTS_TABLE: &str = "book_events.jsonl";
const SPILL_LOG: &str = "spill.jsonl";

/// Durable destination for record batches. Object-safe so tests can inject a
/// failing implementation.
#[async_trait]
pub trait BatchStorage: Send {
    /// Write a whole batch. Either every record lands or the call errors and
    /// the caller retries/spills the same batch.
    async fn append(&mut self, batch: &[BatchRecord]) -> Result<(), MonitorError>;

    /// Last-resort sink for a batch whose retries are exhausted.
    async fn spill(&mut self, batch: &[BatchRecord]) -> Result<(), MonitorError>;
}

// ---------------------------------------------------------------------------
// Table rows
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TradeRow<'a> {
    trade_id: u64,
    symbol: &'a str,
    price: Px,
    qty: Qty,
    side: TradeSide,
    ts_ms: i64,
}

#[derive(Serialize)]
struct BookEventRow<'a> {
    symbol: &'a str,
    update_id: u64,
    side: Side,
    price: Px,
    qty: Qty,
    event_type: &'static str,
    ts_ms: i64,
}

// ---------------------------------------------------------------------------
// JSONL implementation
// ---------------------------------------------------------------------------

pub struct JsonlStore {
    data_dir: PathBuf,
    trades: Option<File>,
    book_events: Option<File>,
    spill_log: Option<File>,
}

async fn open_append(path: &Path) -> Result<File, MonitorError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| MonitorError::Persistence(format!("open {}: {e}", path.display())))
}

impl JsonlStore {
    /// Create the data directory and open both tables.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, MonitorError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| {
                MonitorError::Persistence(format!("create {}: {e}", data_dir.display()))
            })?;

        let trades = open_append(&data_dir.join(TRADES_TABLE)).await?;
        let book_events = open_append(&data_dir.join(BOOK_EVENTS_TABLE)).await?;

        info!(dir = %data_dir.display(), "storage opened");
        Ok(Self {
            data_dir,
            trades: Some(trades),
            book_events: Some(book_events),
            spill_log: None,
        })
    }

    /// Serialise a batch into per-table line buffers.
    fn stage(batch: &[BatchRecord]) -> Result<(Vec<u8>, Vec<u8>), MonitorError> {
        let mut trade_lines: Vec<u8> = Vec::new();
        let mut book_lines: Vec<u8> = Vec::new();

        for record in batch {
            match record {
                BatchRecord::Trade(t) => {
                    push_json_line(
                        &mut trade_lines,
                        &TradeRow {
                            trade_id: t.trade_id,
                            symbol: &t.symbol,
                            price: t.price,
                            qty: t.qty,
                            side: t.side,
                            ts_ms: t.ts_ms,
                        },
                    )?;
                }
                BatchRecord::BookDelta(d) => {
                    push_json_line(
                        &mut book_lines,
                        &BookEventRow {
                            symbol: &d.symbol,
                            update_id: d.update_id,
                            side: d.side,
                            price: d.price,
                            qty: d.qty,
                            event_type: "delta",
                            ts_ms: d.ts_ms,
                        },
                    )?;
                }
                BatchRecord::BookSnapshot(s) => {
                    // One row per level, both sides.
                    for (side, levels) in [(Side::Bid, &s.bids), (Side::Ask, &s.asks)] {
                        for level in levels {
                            push_json_line(
                                &mut book_lines,
                                &BookEventRow {
                                    symbol: &s.symbol,
                                    update_id: s.update_id,
                                    side,
                                    price: level.price,
                                    qty: level.qty,
                                    event_type: "snapshot",
                                    ts_ms: s.ts_ms,
                                },
                            )?;
                        }
                    }
                }
            }
        }

        Ok((trade_lines, book_lines))
    }

    async fn write_table(file: &mut File, bytes: &[u8]) -> Result<(), MonitorError> {
        if bytes.is_empty() {
            return Ok(());
        }
        file.write_all(bytes)
            .await
            .map_err(|e| MonitorError::Persistence(format!("write: {e}")))?;
        file.flush()
            .await
            .map_err(|e| MonitorError::Persistence(format!("flush: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| MonitorError::Persistence(format!("sync: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl BatchStorage for JsonlStore {
    async fn append(&mut self, batch: &[BatchRecord]) -> Result<(), MonitorError> {
        let (trade_lines, book_lines) = Self::stage(batch)?;

        // Reopen any writer a previous failure discarded.
        if self.trades.is_none() {
            self.trades = Some(open_append(&self.data_dir.join(TRADES_TABLE)).await?);
        }
        if self.book_events.is_none() {
            self.book_events = Some(open_append(&self.data_dir.join(BOOK_EVENTS_TABLE)).await?);
        }

        let trades = self.trades.as_mut().expect("opened above");
        if let Err(e) = Self::write_table(trades, &trade_lines).await {
            warn!(error = %e, "trades table write failed — discarding writer");
            self.trades = None;
            return Err(e);
        }

        let book_events = self.book_events.as_mut().expect("opened above");
        if let Err(e) = Self::write_table(book_events, &book_lines).await {
            warn!(error = %e, "book-events table write failed — discarding writer");
            self.book_events = None;
            return Err(e);
        }

        debug!(records = batch.len(), "batch appended");
        Ok(())
    }

    async fn spill(&mut self, batch: &[BatchRecord]) -> Result<(), MonitorError> {
        if self.spill_log.is_none() {
            self.spill_log = Some(open_append(&self.data_dir.join(SPILL_LOG)).await?);
        }

        let mut lines: Vec<u8> = Vec::new();
        for record in batch {
            serde_json::to_writer(&mut lines, record)
                .map_err(|e| MonitorError::Persistence(format!("serialise spill: {e}")))?;
            lines.push(b'\n');
        }

        let file = self.spill_log.as_mut().expect("opened above");
        if let Err(e) = Self::write_table(file, &lines).await {
            self.spill_log = None;
            return Err(e);
        }

        warn!(records = batch.len(), "batch spilled to fallback log");
        Ok(())
    }
}

fn push_json_line<T: Serialize>(buf: &mut Vec<u8>, row: &T) -> Result<(), MonitorError> {
    serde_json::to_writer(&mut *buf, row)
        .map_err(|e| MonitorError::Persistence(format!("serialise row: {e}")))?;
    buf.push(b'\n');
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
