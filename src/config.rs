// =============================================================================
// Configuration — immutable settings supplied at startup
// =============================================================================
//
// Loaded once from a JSON file with env-var overrides for the endpoint and
// symbol list, validated once, then passed by reference into each component's
// constructor. Unlike a hot-reloadable config there is no interior mutability
// here: every field is fixed for the lifetime of the process.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_endpoint() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
    ]
}

fn default_trade_history_capacity() -> usize {
    1000
}

fn default_shard_count() -> usize {
    4
}

fn default_batch_size() -> usize {
    200
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    16_384
}

fn default_queue_high_water() -> usize {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    250
}

fn default_backoff_reset_secs() -> u64 {
    60
}

fn default_resync_buffer_max() -> usize {
    256
}

fn default_flush_retry_limit() -> u32 {
    3
}

fn default_flush_retry_base_ms() -> u64 {
    200
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

// =============================================================================
// Config
// =============================================================================

/// Immutable runtime configuration for the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Exchange connection -------------------------------------------------

    /// WebSocket endpoint of the exchange feed.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Symbols to subscribe (trade + depth channels each).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Reconnect backoff ---------------------------------------------------

    /// Base reconnect delay. Doubles per failed attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on the reconnect delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Uniform jitter added on top of the computed delay.
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,

    /// A connection that stays up this long resets the attempt counter.
    #[serde(default = "default_backoff_reset_secs")]
    pub backoff_reset_secs: u64,

    // --- Book reconstruction -------------------------------------------------

    /// Deltas buffered per symbol while awaiting a resync snapshot. Overflow
    /// evicts the oldest buffered delta.
    #[serde(default = "default_resync_buffer_max")]
    pub resync_buffer_max: usize,

    /// Worker shards for per-symbol event processing.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    // --- Trade history -------------------------------------------------------

    /// Retained trades per symbol.
    #[serde(default = "default_trade_history_capacity")]
    pub trade_history_capacity: usize,

    // --- Persistence ---------------------------------------------------------

    /// Records per flushed batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// A partial batch flushes after this long regardless of size.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Hard admission bound for droppable records in the persistence queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Depth above which the backpressure drop policy engages.
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,

    /// Attempts per batch before it is spilled to the fallback log.
    #[serde(default = "default_flush_retry_limit")]
    pub flush_retry_limit: u32,

    /// Base delay between flush retries. Doubles per attempt.
    #[serde(default = "default_flush_retry_base_ms")]
    pub flush_retry_base_ms: u64,

    /// Directory holding the trades / book-events tables and the spill log.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // --- Shutdown ------------------------------------------------------------

    /// Bound on draining in-flight events at shutdown.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            symbols: default_symbols(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            backoff_reset_secs: default_backoff_reset_secs(),
            resync_buffer_max: default_resync_buffer_max(),
            shard_count: default_shard_count(),
            trade_history_capacity: default_trade_history_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            queue_capacity: default_queue_capacity(),
            queue_high_water: default_queue_high_water(),
            flush_retry_limit: default_flush_retry_limit(),
            flush_retry_base_ms: default_flush_retry_base_ms(),
            data_dir: default_data_dir(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            endpoint = %config.endpoint,
            symbols = ?config.symbols,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply `COINWATCH_ENDPOINT` / `COINWATCH_SYMBOLS` env overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("COINWATCH_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.endpoint = endpoint.trim().to_string();
            }
        }
        if let Ok(syms) = std::env::var("COINWATCH_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
    }

    /// Validate once at startup; components may then assume these hold.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("config: symbol list is empty");
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            bail!("config: endpoint must be a ws:// or wss:// URL");
        }
        if self.trade_history_capacity == 0 {
            bail!("config: trade_history_capacity must be > 0");
        }
        if self.batch_size == 0 {
            bail!("config: batch_size must be > 0");
        }
        if self.shard_count == 0 {
            bail!("config: shard_count must be > 0");
        }
        if self.queue_high_water > self.queue_capacity {
            bail!(
                "config: queue_high_water ({}) exceeds queue_capacity ({})",
                self.queue_high_water,
                self.queue_capacity
            );
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            bail!("config: backoff_max_ms must be >= backoff_base_ms > 0");
        }
        Ok(())
    }
}
