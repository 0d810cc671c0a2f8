// =============================================================================
// Connection Manager — exchange WebSocket session lifecycle
// =============================================================================
//
// Owns one logical exchange connection: handshake, channel subscription,
// frame decoding, reconnect with capped exponential backoff + jitter, and
// resync re-subscription. Decoded events flow into the dispatcher channel;
// state transitions travel the same channel so they stay ordered with the
// data they gate.
//
// Runs until the shutdown signal fires or a fatal (non-retryable) connection
// error surfaces to the supervisor.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::MonitorError;
use crate::feed::messages;
use crate::hub::MarketHub;
use crate::types::{ConnectionState, FeedEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect delay for the given failed-attempt count (1-based), before
/// jitter. Doubles per attempt and saturates at `max_ms`.
fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

/// Classify connection errors that retrying cannot fix.
fn fatal_reason(err: &tungstenite::Error) -> Option<String> {
    match err {
        tungstenite::Error::Http(resp) if resp.status() == 401 || resp.status() == 403 => {
            Some(format!("authentication rejected (HTTP {})", resp.status()))
        }
        tungstenite::Error::Url(e) => Some(format!("bad endpoint URL: {e}")),
        _ => None,
    }
}

/// How a session ended, seen from the reconnect loop.
enum SessionEnd {
    /// Socket dropped / errored; reconnect.
    Lost,
    /// Shutdown signal observed or the dispatcher went away; stop.
    Stopped,
}

async fn send_state(events: &mpsc::Sender<FeedEvent>, state: ConnectionState) {
    debug!(state = %state, "connection state");
    let _ = events.send(FeedEvent::StateChanged(state)).await;
}

/// Decode and forward one text frame. Returns `false` when the dispatcher is
/// gone and the manager should stop.
async fn handle_text(
    events: &mpsc::Sender<FeedEvent>,
    hub: &MarketHub,
    text: &str,
    unsynced: &mut HashSet<String>,
) -> bool {
    match messages::decode(text, Utc::now().timestamp_millis()) {
        Ok(Some(event)) => {
            let snapshot_symbol = match &event {
                FeedEvent::DepthSnapshot(s) => Some(s.symbol.clone()),
                _ => None,
            };

            if events.send(event).await.is_err() {
                return false;
            }

            if let Some(symbol) = snapshot_symbol {
                if unsynced.remove(&symbol) && unsynced.is_empty() {
                    send_state(events, ConnectionState::Synced).await;
                    info!("all subscribed symbols synced");
                }
            }
            true
        }
        Ok(None) => {
            debug!("subscribe ack");
            true
        }
        Err(e) => {
            // Malformed frame: log, count, continue.
            warn!(error = %e, "skipping malformed frame");
            hub.inc_decode_errors();
            true
        }
    }
}

pub struct ConnectionManager {
    config: Arc<Config>,
    hub: Arc<MarketHub>,
    events: mpsc::Sender<FeedEvent>,
    resync_rx: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
    request_id: u64,
    sessions: u64,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<Config>,
        hub: Arc<MarketHub>,
        events: mpsc::Sender<FeedEvent>,
        resync_rx: mpsc::Receiver<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            hub,
            events,
            resync_rx,
            shutdown,
            request_id: 0,
            sessions: 0,
        }
    }

    /// Drive the reconnect loop until shutdown or a fatal error.
    pub async fn run(mut self) -> Result<(), MonitorError> {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            send_state(&self.events, ConnectionState::Connecting).await;
            info!(endpoint = %self.config.endpoint, "connecting to exchange feed");

            match connect_async(self.config.endpoint.as_str()).await {
                Ok((ws, _resp)) => {
                    let connected_at = Instant::now();
                    self.sessions += 1;

                    match self.run_session(ws).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost => {}
                    }

                    // A connection that held for a while earns a fresh
                    // backoff schedule.
                    if connected_at.elapsed()
                        >= Duration::from_secs(self.config.backoff_reset_secs)
                    {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    if let Some(reason) = fatal_reason(&e) {
                        error!(error = %reason, "fatal connection error — giving up");
                        send_state(&self.events, ConnectionState::Degraded).await;
                        return Err(MonitorError::Fatal(reason));
                    }
                    let err = MonitorError::Network(e.to_string());
                    warn!(error = %err, "connect failed");
                }
            }

            send_state(&self.events, ConnectionState::Disconnected).await;

            attempt = attempt.saturating_add(1);
            let delay = backoff_delay_ms(
                attempt,
                self.config.backoff_base_ms,
                self.config.backoff_max_ms,
            );
            let jitter = rand::thread_rng().gen_range(0..=self.config.backoff_jitter_ms);
            debug!(attempt, delay_ms = delay + jitter, "reconnect backoff");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay + jitter)) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        send_state(&self.events, ConnectionState::Disconnected).await;
        info!("connection manager stopped");
        Ok(())
    }

    /// Run one connected session: subscribe, then pump frames and resync
    /// requests until the socket drops or shutdown fires.
    async fn run_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        // Locals so the select! arms below don't re-borrow `self` whole.
        let events = self.events.clone();
        let hub = self.hub.clone();

        // After a reconnect every book is stale until its snapshot arrives.
        let initial = if self.sessions > 1 {
            ConnectionState::Resyncing
        } else {
            ConnectionState::Subscribing
        };
        send_state(&events, initial).await;

        self.request_id += 1;
        let frame = messages::subscribe_frame(&self.config.symbols, self.request_id);
        if let Err(e) = write.send(Message::Text(frame)).await {
            warn!(error = %e, "failed to send subscribe request");
            return SessionEnd::Lost;
        }
        info!(symbols = ?self.config.symbols, "subscribed to trade + depth channels");

        // Symbols still awaiting their first snapshot this session.
        let mut unsynced: HashSet<String> = self.config.symbols.iter().cloned().collect();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    info!("shutdown — closing exchange connection");
                    return SessionEnd::Stopped;
                }

                req = self.resync_rx.recv() => {
                    match req {
                        Some(symbol) => {
                            self.request_id += 1;
                            unsynced.insert(symbol.clone());
                            send_state(&events, ConnectionState::Resyncing).await;
                            info!(symbol = %symbol, "resync requested — re-subscribing depth");
                            let frame = messages::depth_subscribe_frame(&symbol, self.request_id);
                            if let Err(e) = write.send(Message::Text(frame)).await {
                                warn!(error = %e, "failed to send resync subscribe");
                                return SessionEnd::Lost;
                            }
                        }
                        None => return SessionEnd::Stopped,
                    }
                }

                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_text(&events, &hub, &text, &mut unsynced).await {
                            return SessionEnd::Stopped;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!(error = %e, "failed to answer ping");
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("close frame from exchange");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {
                        // Pong / binary frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "websocket read error");
                        return SessionEnd::Lost;
                    }
                    None => {
                        warn!("websocket stream ended");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
