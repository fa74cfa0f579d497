// =============================================================================
// Push server — WebSocket endpoint with per-subscriber window routing
// =============================================================================
//
// Each connection builds its opportunity set (active signals first, topped
// up with recently active symbols from the quote board), registers one store
// handler per window, and streams framed JSON updates. The handler only
// serialises and try_sends into the connection's bounded outbox; a single
// writer task owns the socket, so writes are serialised per connection and
// carry a write timeout. Every disconnect path deregisters every handler the
// connection registered — anything less leaks subscriptions.
//
// The quote board is fed by the orchestrator's direct hot path and records
// which exchanges quoted a symbol last; it seeds the opportunity set for
// subscribers when few signals are active.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::orchestrator::HotPathSink;
use crate::rolling_window::window::{LOWER_BAND_Q, UPPER_BAND_Q};
use crate::rolling_window::{quantile::SortedSpreads, HandlerId, RollingWindowStore};
use crate::runtime_config::PushConfig;
use crate::signals::SignalDetector;
use crate::types::{ExchangeId, Tick, WindowKey, WindowSample, WindowUpdate};

/// Frames queued per connection before a slow consumer starts losing
/// updates.
const OUTBOX_CAPACITY: usize = 256;
/// Symbols tracked on the quote board.
const MAX_BOARD_SYMBOLS: usize = 10_000;

struct SymbolQuotes {
    by_exchange: HashMap<ExchangeId, DateTime<Utc>>,
    last_update: DateTime<Utc>,
}

struct ConnectionHandle {
    outbox: mpsc::Sender<String>,
    registrations: Vec<(WindowKey, HandlerId)>,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushStats {
    pub connections: usize,
    pub frames_sent: u64,
    pub frames_dropped_slow: u64,
    pub connections_swept: u64,
}

pub struct PushServer {
    store: Arc<RollingWindowStore>,
    detector: Arc<SignalDetector>,
    cfg: PushConfig,

    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,
    board: RwLock<HashMap<String, SymbolQuotes>>,

    frames_sent: AtomicU64,
    frames_dropped_slow: AtomicU64,
    connections_swept: AtomicU64,
}

impl PushServer {
    pub fn new(
        store: Arc<RollingWindowStore>,
        detector: Arc<SignalDetector>,
        cfg: PushConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            detector,
            cfg,
            connections: RwLock::new(HashMap::new()),
            board: RwLock::new(HashMap::new()),
            frames_sent: AtomicU64::new(0),
            frames_dropped_slow: AtomicU64::new(0),
            connections_swept: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Opportunity set
    // =========================================================================

    /// Windows this subscriber should watch: one per active signal, topped
    /// up with pairwise windows of the most recently quoted symbols, capped
    /// at the dashboard limit.
    pub fn opportunity_windows(&self) -> Vec<WindowKey> {
        let limit = self.cfg.dashboard_symbols_limit.max(1);
        let mut keys: Vec<WindowKey> = Vec::new();
        let mut seen: HashSet<WindowKey> = HashSet::new();

        for active in self.detector.active_signals() {
            let key = WindowKey::canonical(
                active.signal.cheap_exchange,
                active.signal.rich_exchange,
                active.signal.symbol.clone(),
            );
            if seen.insert(key.clone()) {
                keys.push(key);
            }
            if keys.len() >= limit {
                return keys;
            }
        }

        let board = self.board.read();
        let mut symbols: Vec<(&String, &SymbolQuotes)> = board.iter().collect();
        symbols.sort_by(|a, b| b.1.last_update.cmp(&a.1.last_update));

        'outer: for (symbol, quotes) in symbols {
            let mut exchanges: Vec<ExchangeId> =
                quotes.by_exchange.keys().copied().collect();
            exchanges.sort_by_key(|ex| ex.as_str());
            for i in 0..exchanges.len() {
                for j in (i + 1)..exchanges.len() {
                    let key =
                        WindowKey::canonical(exchanges[i], exchanges[j], symbol.clone());
                    if seen.insert(key.clone()) {
                        keys.push(key);
                    }
                    if keys.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }
        keys
    }

    // =========================================================================
    // Connection registry
    // =========================================================================

    /// Register store handlers for every window in the opportunity set and
    /// record the connection. The handler serialises the update and
    /// try_sends it; a full outbox drops the frame (slow consumer), a
    /// closed one is cleaned up by the sweep or the connection task itself.
    pub fn attach_connection(
        self: &Arc<Self>,
        id: Uuid,
        keys: &[WindowKey],
        outbox: mpsc::Sender<String>,
    ) {
        let mut registrations = Vec::with_capacity(keys.len());
        for key in keys {
            let tx = outbox.clone();
            let server = self.clone();
            let handler_id = self.store.subscribe(
                key,
                Arc::new(move |update: &WindowUpdate| {
                    let frame = frame_update(update);
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            server.frames_dropped_slow.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }),
            );
            registrations.push((key.clone(), handler_id));
        }

        self.connections.write().insert(
            id,
            ConnectionHandle {
                outbox,
                registrations,
                connected_at: Utc::now(),
            },
        );
        info!(connection = %id, windows = keys.len(), "push subscriber attached");
    }

    /// Deregister every handler the connection registered and drop it from
    /// the registry. Idempotent: both the connection task and the sweep may
    /// call it.
    pub fn remove_connection(&self, id: &Uuid) {
        let handle = self.connections.write().remove(id);
        if let Some(handle) = handle {
            for (key, handler_id) in &handle.registrations {
                self.store.unsubscribe(key, *handler_id);
            }
            info!(
                connection = %id,
                windows = handle.registrations.len(),
                uptime_s = (Utc::now() - handle.connected_at).num_seconds(),
                "push subscriber detached"
            );
        }
    }

    /// Drop connections whose transport is gone. Normally the connection
    /// task cleans up after itself; the sweep catches aborted tasks.
    pub fn sweep_dead_connections(&self) -> usize {
        let dead: Vec<Uuid> = self
            .connections
            .read()
            .iter()
            .filter(|(_, h)| h.outbox.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.remove_connection(id);
        }
        self.connections_swept
            .fetch_add(dead.len() as u64, Ordering::Relaxed);
        dead.len()
    }

    pub fn spawn_sweep_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let every =
            std::time::Duration::from_secs(server.cfg.dead_connection_sweep_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let swept = server.sweep_dead_connections();
                        if swept > 0 {
                            info!(swept, "dead push connections removed");
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> PushStats {
        PushStats {
            connections: self.connections.read().len(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped_slow: self.frames_dropped_slow.load(Ordering::Relaxed),
            connections_swept: self.connections_swept.load(Ordering::Relaxed),
        }
    }
}

// The orchestrator's direct hot path lands here: the board remembers which
// exchanges quoted a symbol and when, nothing heavier.
impl HotPathSink for PushServer {
    fn deliver(&self, tick: &Tick) {
        if !tick.is_spread() {
            return;
        }
        let mut board = self.board.write();
        if !board.contains_key(&tick.symbol) && board.len() >= MAX_BOARD_SYMBOLS {
            let lru = board
                .iter()
                .min_by_key(|(_, v)| v.last_update)
                .map(|(k, _)| k.clone());
            if let Some(symbol) = lru {
                board.remove(&symbol);
            }
        }
        let entry = board
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolQuotes {
                by_exchange: HashMap::new(),
                last_update: tick.ts,
            });
        entry.last_update = tick.ts;
        entry.by_exchange.insert(tick.exchange, tick.ts);
    }
}

// =============================================================================
// Framing
// =============================================================================

fn ts_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1e6
}

/// One update frame: single-element arrays carrying the fresh sample and
/// the rolling bands at append time.
pub fn frame_update(update: &WindowUpdate) -> String {
    serde_json::json!({
        "symbol": update.key.symbol,
        "exchange1": update.key.exchange_a.to_string(),
        "exchange2": update.key.exchange_b.to_string(),
        "timestamps": [ts_seconds(update.sample.ts)],
        "spreads": [update.sample.spread],
        "upperBand": [update.upper_band],
        "lowerBand": [update.lower_band],
    })
    .to_string()
}

/// Initial snapshot frame: the full window contents at connect time, with
/// the current bands replicated across the arrays. Also served by the REST
/// window endpoint, hence the JSON value return.
pub fn frame_snapshot(key: &WindowKey, samples: &[WindowSample]) -> serde_json::Value {
    let mut sorted = SortedSpreads::new();
    for sample in samples {
        sorted.insert(sample.spread);
    }
    let upper = sorted.quantile(UPPER_BAND_Q);
    let lower = sorted.quantile(LOWER_BAND_Q);

    serde_json::json!({
        "symbol": key.symbol,
        "exchange1": key.exchange_a.to_string(),
        "exchange2": key.exchange_b.to_string(),
        "timestamps": samples.iter().map(|s| ts_seconds(s.ts)).collect::<Vec<_>>(),
        "spreads": samples.iter().map(|s| s.spread).collect::<Vec<_>>(),
        "upperBand": vec![upper; samples.len()],
        "lowerBand": vec![lower; samples.len()],
    })
}

// =============================================================================
// Axum handler
// =============================================================================

/// Upgrade handler for `GET /api/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("push connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state.push.clone()))
}

/// Manages one subscriber for its whole lifetime. The select loop forwards
/// outbox frames to the socket (with the write timeout) and answers pings;
/// every exit path funnels into `remove_connection`.
async fn handle_connection(socket: WebSocket, server: Arc<PushServer>) {
    use futures_util::{SinkExt, StreamExt};

    let id = Uuid::new_v4();
    let keys = server.opportunity_windows();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);

    // Initial snapshots are queued ahead of live updates.
    for key in &keys {
        let samples = server.store.get_window(key);
        if !samples.is_empty() {
            let _ = outbox_tx.try_send(frame_snapshot(key, &samples).to_string());
        }
    }

    server.attach_connection(id, &keys, outbox_tx);

    let write_timeout = std::time::Duration::from_millis(server.cfg.write_timeout_ms.max(1));
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = outbox_rx.recv() => match frame {
                Some(frame) => {
                    match tokio::time::timeout(write_timeout, sender.send(Message::Text(frame))).await {
                        Ok(Ok(())) => {
                            server.frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            debug!(connection = %id, error = %e, "push write failed, disconnecting");
                            break;
                        }
                        Err(_) => {
                            warn!(connection = %id, "push write timed out, disconnecting");
                            break;
                        }
                    }
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!(connection = %id, "push connection closed by peer");
                    break;
                }
                Some(Ok(_)) => {} // client text/binary/pong: nothing required
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "push receive error, disconnecting");
                    break;
                }
                None => break,
            }
        }
    }

    server.remove_connection(&id);
}
