// =============================================================================
// Error taxonomy for the ingestion pipeline
// =============================================================================
//
// Recovery is local by default: transient network errors feed the reconnect
// backoff, protocol errors are logged and skipped, sequence gaps trigger a
// resync, persistence errors retry then spill. Only `Fatal` and exhausted
// persistence retries reach the supervisor.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Transient network failure. Retried with capped exponential backoff.
    #[error("network error: {0}")]
    Network(String),

    /// Authentication or protocol-version rejection. Not retried; surfaced
    /// to the supervisor.
    #[error("fatal connection error: {0}")]
    Fatal(String),

    /// Malformed or unexpected message. Logged and skipped; the stream
    /// continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Update-id continuity lost for a symbol. Triggers a resync, not an
    /// outage.
    #[error("sequence gap on {symbol}: expected {expected}, got {got}")]
    SequenceGap {
        symbol: String,
        expected: u64,
        got: u64,
    },

    /// Storage write failure. Retried per batch up to a limit, then the
    /// batch is spilled to the fallback log.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Record queue over capacity. Engages the drop policy; never a fault.
    #[error("record queue full")]
    QueueFull,
}

impl MonitorError {
    /// Whether the connection supervisor should stop retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
