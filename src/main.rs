// =============================================================================
// Coinwatch — Main Entry Point
// =============================================================================
//
// Wires the pipeline together: connection manager → dispatcher → order book /
// trade history → persistence batcher → storage. Views attach through the
// MarketHub; this binary contains no rendering.
//
// Shutdown is cooperative: Ctrl+C (or a fatal connection error) stops the
// feed, the dispatcher drains in-flight events, and the batcher performs a
// final flush before the process exits.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use coinwatch::config::Config;
use coinwatch::dispatcher::Dispatcher;
use coinwatch::feed::ConnectionManager;
use coinwatch::hub::MarketHub;
use coinwatch::market_data::{OrderBookEngine, TradeHistory};
use coinwatch::persistence::{JsonlStore, PersistenceBatcher, RecordQueue};

/// Capacity of the decoded-event channel between feed and dispatcher.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("coinwatch market recorder starting");

    let mut config = Config::load("coinwatch.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    info!(
        endpoint = %config.endpoint,
        symbols = ?config.symbols,
        data_dir = %config.data_dir,
        "configured"
    );

    // ── 2. Shared state ──────────────────────────────────────────────────
    let trades = Arc::new(TradeHistory::new(config.trade_history_capacity));
    let hub = Arc::new(MarketHub::new(trades.clone()));
    let books = Arc::new(OrderBookEngine::new(config.resync_buffer_max));
    let queue = Arc::new(RecordQueue::new(
        config.queue_capacity,
        config.queue_high_water,
    ));

    // ── 3. Persistence worker ────────────────────────────────────────────
    let store = JsonlStore::open(config.data_dir.clone())
        .await
        .context("failed to open storage")?;
    let batcher = PersistenceBatcher::new(
        queue.clone(),
        Box::new(store),
        hub.clone(),
        config.batch_size,
        config.flush_interval_ms,
        config.flush_retry_limit,
        config.flush_retry_base_ms,
    );
    let batcher_handle = tokio::spawn(batcher.run());

    // ── 4. Dispatcher ────────────────────────────────────────────────────
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (resync_tx, resync_rx) = mpsc::channel(64);
    let dispatcher = Dispatcher::new(
        config.clone(),
        hub.clone(),
        books,
        trades,
        queue,
        resync_tx,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(event_rx));

    // ── 5. Connection manager ────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connection = ConnectionManager::new(
        config.clone(),
        hub.clone(),
        event_tx,
        resync_rx,
        shutdown_rx,
    );
    let mut connection_handle = tokio::spawn(connection.run());

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Supervisor ────────────────────────────────────────────────────
    let mut connection_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
        }
        res = &mut connection_handle => {
            connection_done = true;
            match res {
                Ok(Err(e)) => error!(error = %e, "connection failed fatally — shutting down"),
                Ok(Ok(())) => warn!("connection manager exited"),
                Err(e) => error!(error = %e, "connection task panicked"),
            }
        }
    }

    // ── 7. Cooperative shutdown ──────────────────────────────────────────
    // Stop the feed, drain in-flight events with a bounded timeout, then let
    // the batcher force its final flush. Nothing is considered durable until
    // that flush succeeds or is spilled.
    let _ = shutdown_tx.send(true);
    let drain = Duration::from_millis(config.drain_timeout_ms);

    if !connection_done && timeout(drain, &mut connection_handle).await.is_err() {
        warn!("connection did not stop within the drain timeout — aborting it");
        connection_handle.abort();
    }
    if timeout(drain, dispatcher_handle).await.is_err() {
        warn!("dispatcher did not drain within the timeout");
    }
    if timeout(drain, batcher_handle).await.is_err() {
        warn!("persistence batcher did not finish its final flush in time");
    }

    let stats = hub.stats();
    info!(
        flushed_records = stats.flushed_records,
        flushes = stats.flush_count,
        dropped_records = stats.dropped_records,
        spilled_batches = stats.spilled_batches,
        resyncs = stats.resyncs,
        decode_errors = stats.decode_errors,
        "coinwatch shut down complete"
    );
    Ok(())
}
