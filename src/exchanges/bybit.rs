// =============================================================================
// Bybit adapter — v5 public spot WebSocket + REST ticker snapshot
// =============================================================================
//
// Streams:
//   tickers.<SYMBOL>      top-of-book (bid1/ask1) snapshots
//   publicTrade.<SYMBOL>  public trades (batched arrays)
//
// Bybit expects an application-level `{"op":"ping"}` every ~20 s; the read
// loop interleaves one. Subscription rejections are fatal (the symbol set
// came from the venue's own ticker snapshot, so a rejection means protocol
// drift, not a typo).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::exchanges::{
    json_decimal, ms_to_utc, AdapterError, AdapterStatus, Backoff, ExchangeAdapter, TickCallback,
};
use crate::logging::RateLimitedLog;
use crate::types::{ExchangeId, Side, Tick, TickKind, TickerInfo};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const REST_TICKERS_URL: &str = "https://api.bybit.com/v5/market/tickers?category=spot";
/// Bybit caps `args` per subscribe request.
const SUBSCRIBE_BATCH: usize = 10;
const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);

pub struct BybitAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    status: RwLock<AdapterStatus>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    http: reqwest::Client,
    parse_warn: RateLimitedLog,
}

impl Inner {
    fn set_status(&self, status: AdapterStatus) {
        *self.status.write() = status;
    }
}

impl BybitAdapter {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                status: RwLock::new(AdapterStatus::NotStarted),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                http: reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(10))
                    .build()
                    .unwrap_or_default(),
                parse_warn: RateLimitedLog::per_second(),
            }),
        }
    }
}

impl Default for BybitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    async fn start(&self) -> Result<(), AdapterError> {
        self.inner.set_status(AdapterStatus::Connecting);
        info!(exchange = %self.id(), "adapter started");
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if *self.inner.status.read() != AdapterStatus::Failed {
            self.inner.set_status(AdapterStatus::Stopped);
        }
        info!(exchange = %self.id(), "adapter stopped");
    }

    async fn get_tickers(&self) -> Result<Vec<TickerInfo>, AdapterError> {
        let resp = self
            .inner
            .http
            .get(REST_TICKERS_URL)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(format!("ticker snapshot request: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("ticker snapshot body: {e}")))?;

        if !status.is_success() {
            return Err(AdapterError::Transient(format!(
                "ticker snapshot returned {status}"
            )));
        }
        if body["retCode"].as_i64().unwrap_or(-1) != 0 {
            return Err(AdapterError::Fatal(format!(
                "ticker snapshot rejected: {}",
                body["retMsg"].as_str().unwrap_or("unknown")
            )));
        }

        let list = body["result"]["list"]
            .as_array()
            .ok_or_else(|| AdapterError::Protocol("ticker snapshot missing result.list".into()))?;

        let mut tickers = Vec::with_capacity(list.len());
        for row in list {
            let Some(symbol) = row["symbol"].as_str() else {
                continue;
            };
            match json_decimal(&row["turnover24h"], "turnover24h") {
                Ok(volume) => tickers.push(TickerInfo {
                    symbol: symbol.to_string(),
                    quote_volume_24h: volume,
                }),
                Err(e) => {
                    warn!(exchange = "bybit", symbol, error = %e, "skipping ticker row");
                }
            }
        }
        Ok(tickers)
    }

    async fn subscribe_spreads(
        &self,
        symbols: Vec<String>,
        on_tick: TickCallback,
    ) -> Result<(), AdapterError> {
        let topics: Vec<String> = symbols.iter().map(|s| format!("tickers.{s}")).collect();
        self.spawn_stream(topics, on_tick);
        Ok(())
    }

    async fn subscribe_trades(
        &self,
        symbols: Vec<String>,
        on_tick: TickCallback,
    ) -> Result<(), AdapterError> {
        let topics: Vec<String> = symbols.iter().map(|s| format!("publicTrade.{s}")).collect();
        self.spawn_stream(topics, on_tick);
        Ok(())
    }

    fn status(&self) -> AdapterStatus {
        *self.inner.status.read()
    }
}

impl BybitAdapter {
    fn spawn_stream(&self, topics: Vec<String>, on_tick: TickCallback) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            stream_supervisor(inner, topics, on_tick).await;
        });
        self.inner.tasks.lock().push(handle);
    }
}

/// Reconnect loop: one connection per topic set, exponential backoff, the
/// identical topic list resubscribed on every attempt.
async fn stream_supervisor(inner: Arc<Inner>, topics: Vec<String>, on_tick: TickCallback) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut backoff = Backoff::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_stream(&inner, &topics, &on_tick, &mut shutdown, &mut backoff).await {
            Ok(()) => break,
            Err(AdapterError::Fatal(msg)) => {
                error!(exchange = "bybit", error = %msg, "fatal stream error, adapter failed");
                inner.set_status(AdapterStatus::Failed);
                return;
            }
            Err(e) => {
                inner.set_status(AdapterStatus::Reconnecting);
                let delay = backoff.next_delay();
                warn!(
                    exchange = "bybit",
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "stream dropped, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
}

/// One connection lifetime: connect, subscribe, read until error or shutdown.
async fn run_stream(
    inner: &Arc<Inner>,
    topics: &[String],
    on_tick: &TickCallback,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<(), AdapterError> {
    let (ws, _resp) = connect_async(WS_URL)
        .await
        .map_err(|e| AdapterError::Transient(format!("connect: {e}")))?;
    let (mut write, mut read) = ws.split();

    for chunk in topics.chunks(SUBSCRIBE_BATCH) {
        let op = serde_json::json!({ "op": "subscribe", "args": chunk });
        write
            .send(Message::Text(op.to_string().into()))
            .await
            .map_err(|e| AdapterError::Transient(format!("subscribe send: {e}")))?;
    }

    inner.set_status(AdapterStatus::Subscribed);
    backoff.reset();
    info!(exchange = "bybit", topics = topics.len(), "stream subscribed");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = ping.tick() => {
                write
                    .send(Message::Text(r#"{"op":"ping"}"#.to_string().into()))
                    .await
                    .map_err(|e| AdapterError::Transient(format!("ping send: {e}")))?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_message(inner, &text, on_tick)?;
                }
                Some(Ok(_)) => {} // ping/pong/binary frames
                Some(Err(e)) => {
                    return Err(AdapterError::Transient(format!("read: {e}")));
                }
                None => {
                    return Err(AdapterError::Transient("stream ended".into()));
                }
            }
        }
    }
}

/// Dispatch one text frame. Protocol violations are dropped with a
/// rate-limited warning; a rejected subscription is fatal.
fn handle_message(
    inner: &Arc<Inner>,
    text: &str,
    on_tick: &TickCallback,
) -> Result<(), AdapterError> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            if let Some(suppressed) = inner.parse_warn.allow() {
                warn!(exchange = "bybit", error = %e, suppressed, "unparseable frame dropped");
            }
            return Ok(());
        }
    };

    // Control frames: subscribe acks and pong replies.
    if let Some(op) = root["op"].as_str() {
        if op == "subscribe" && !root["success"].as_bool().unwrap_or(true) {
            return Err(AdapterError::Fatal(format!(
                "subscription rejected: {}",
                root["ret_msg"].as_str().unwrap_or("unknown")
            )));
        }
        return Ok(());
    }

    let Some(topic) = root["topic"].as_str() else {
        return Ok(());
    };

    let result = if topic.starts_with("tickers.") {
        parse_ticker_frame(&root).map(|t| vec![t])
    } else if topic.starts_with("publicTrade.") {
        parse_trade_frame(&root)
    } else {
        return Ok(());
    };

    match result {
        Ok(ticks) => {
            for tick in ticks {
                on_tick(tick);
            }
        }
        Err(e) => {
            if let Some(suppressed) = inner.parse_warn.allow() {
                warn!(exchange = "bybit", error = %e, suppressed, "malformed frame dropped");
            }
        }
    }
    Ok(())
}

/// `tickers.<SYMBOL>` frame → spread tick.
fn parse_ticker_frame(root: &serde_json::Value) -> Result<Tick, AdapterError> {
    let data = &root["data"];
    let symbol = data["symbol"]
        .as_str()
        .ok_or_else(|| AdapterError::Protocol("ticker frame missing data.symbol".into()))?;

    let best_bid = json_decimal(&data["bid1Price"], "bid1Price")?;
    let best_ask = json_decimal(&data["ask1Price"], "ask1Price")?;
    let bid_qty = json_decimal(&data["bid1Size"], "bid1Size")?;
    let ask_qty = json_decimal(&data["ask1Size"], "ask1Size")?;
    let ts = root["ts"].as_i64().map(ms_to_utc).unwrap_or_else(chrono::Utc::now);

    Ok(Tick {
        exchange: ExchangeId::Bybit,
        symbol: symbol.to_string(),
        ts,
        kind: TickKind::Spread {
            best_bid,
            best_ask,
            spread_pct: 0.0,
            bid_qty,
            ask_qty,
        },
    })
}

/// `publicTrade.<SYMBOL>` frame → one tick per trade in the batch.
fn parse_trade_frame(root: &serde_json::Value) -> Result<Vec<Tick>, AdapterError> {
    let rows = root["data"]
        .as_array()
        .ok_or_else(|| AdapterError::Protocol("trade frame missing data array".into()))?;

    let mut ticks = Vec::with_capacity(rows.len());
    for row in rows {
        let symbol = row["s"]
            .as_str()
            .ok_or_else(|| AdapterError::Protocol("trade row missing s".into()))?;
        let price = json_decimal(&row["p"], "p")?;
        let qty = json_decimal(&row["v"], "v")?;
        let side = match row["S"].as_str() {
            Some("Buy") => Side::Buy,
            Some("Sell") => Side::Sell,
            other => {
                return Err(AdapterError::Protocol(format!(
                    "trade row has unknown side {other:?}"
                )))
            }
        };
        let ts = row["T"].as_i64().map(ms_to_utc).unwrap_or_else(chrono::Utc::now);

        ticks.push(Tick {
            exchange: ExchangeId::Bybit,
            symbol: symbol.to_string(),
            ts,
            kind: TickKind::Trade { price, qty, side },
        });
    }
    Ok(ticks)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_ticker_frame_ok() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{
                "topic": "tickers.BTCUSDT",
                "ts": 1700000000123,
                "type": "snapshot",
                "data": {
                    "symbol": "BTCUSDT",
                    "bid1Price": "50000.10",
                    "bid1Size": "1.5",
                    "ask1Price": "50001.20",
                    "ask1Size": "0.8"
                }
            }"#,
        )
        .unwrap();

        let tick = parse_ticker_frame(&root).expect("should parse");
        assert_eq!(tick.exchange, ExchangeId::Bybit);
        assert_eq!(tick.symbol, "BTCUSDT");
        match tick.kind {
            TickKind::Spread {
                best_bid,
                best_ask,
                bid_qty,
                ask_qty,
                ..
            } => {
                assert_eq!(best_bid, dec!(50000.10));
                assert_eq!(best_ask, dec!(50001.20));
                assert_eq!(bid_qty, dec!(1.5));
                assert_eq!(ask_qty, dec!(0.8));
            }
            _ => panic!("expected spread tick"),
        }
        assert_eq!(tick.ts.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn parse_ticker_frame_missing_bid_is_protocol_error() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{"topic":"tickers.BTCUSDT","data":{"symbol":"BTCUSDT","ask1Price":"1"}}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_ticker_frame(&root),
            Err(AdapterError::Protocol(_))
        ));
    }

    #[test]
    fn parse_trade_frame_batch() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{
                "topic": "publicTrade.BTCUSDT",
                "data": [
                    { "T": 1700000000000, "s": "BTCUSDT", "S": "Buy", "v": "0.01", "p": "50000" },
                    { "T": 1700000000050, "s": "BTCUSDT", "S": "Sell", "v": "0.02", "p": "49999" }
                ]
            }"#,
        )
        .unwrap();

        let ticks = parse_trade_frame(&root).expect("should parse");
        assert_eq!(ticks.len(), 2);
        match &ticks[0].kind {
            TickKind::Trade { price, qty, side } => {
                assert_eq!(*price, dec!(50000));
                assert_eq!(*qty, dec!(0.01));
                assert_eq!(*side, Side::Buy);
            }
            _ => panic!("expected trade tick"),
        }
        match &ticks[1].kind {
            TickKind::Trade { side, .. } => assert_eq!(*side, Side::Sell),
            _ => panic!("expected trade tick"),
        }
    }

    #[test]
    fn parse_trade_frame_unknown_side_rejected() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{"topic":"publicTrade.X","data":[{"s":"X","S":"Hold","v":"1","p":"1"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_trade_frame(&root),
            Err(AdapterError::Protocol(_))
        ));
    }

    #[test]
    fn new_adapter_is_not_started() {
        let adapter = BybitAdapter::new();
        assert_eq!(adapter.status(), AdapterStatus::NotStarted);
        assert_eq!(adapter.id(), ExchangeId::Bybit);
    }
}
