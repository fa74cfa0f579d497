// =============================================================================
// Gate.io adapter — v4 public spot WebSocket + REST ticker snapshot
// =============================================================================
//
// Channels:
//   spot.book_ticker  top-of-book updates
//   spot.trades       public trades
//
// Gate.io pings at the transport layer (tungstenite answers those
// automatically) and acknowledges each channel subscription with an event
// frame; an ack carrying an error is fatal.
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

const WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
const REST_TICKERS_URL: &str = "https://api.gateio.ws/api/v4/spot/tickers";

pub struct GateIoAdapter {
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

impl GateIoAdapter {
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

impl Default for GateIoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for GateIoAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::GateIo
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
        if !status.is_success() {
            return Err(AdapterError::Transient(format!(
                "ticker snapshot returned {status}"
            )));
        }

        let rows: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("ticker snapshot body: {e}")))?;

        let mut tickers = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(symbol) = row["currency_pair"].as_str() else {
                continue;
            };
            match json_decimal(&row["quote_volume"], "quote_volume") {
                Ok(volume) => tickers.push(TickerInfo {
                    symbol: symbol.to_string(),
                    quote_volume_24h: volume,
                }),
                Err(e) => {
                    warn!(exchange = "gateio", symbol, error = %e, "skipping ticker row");
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
        self.spawn_stream("spot.book_ticker", symbols, on_tick);
        Ok(())
    }

    async fn subscribe_trades(
        &self,
        symbols: Vec<String>,
        on_tick: TickCallback,
    ) -> Result<(), AdapterError> {
        self.spawn_stream("spot.trades", symbols, on_tick);
        Ok(())
    }

    fn status(&self) -> AdapterStatus {
        *self.inner.status.read()
    }
}

impl GateIoAdapter {
    fn spawn_stream(&self, channel: &'static str, symbols: Vec<String>, on_tick: TickCallback) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            stream_supervisor(inner, channel, symbols, on_tick).await;
        });
        self.inner.tasks.lock().push(handle);
    }
}

async fn stream_supervisor(
    inner: Arc<Inner>,
    channel: &'static str,
    symbols: Vec<String>,
    on_tick: TickCallback,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut backoff = Backoff::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_stream(&inner, channel, &symbols, &on_tick, &mut shutdown, &mut backoff).await {
            Ok(()) => break,
            Err(AdapterError::Fatal(msg)) => {
                error!(exchange = "gateio", error = %msg, "fatal stream error, adapter failed");
                inner.set_status(AdapterStatus::Failed);
                return;
            }
            Err(e) => {
                inner.set_status(AdapterStatus::Reconnecting);
                let delay = backoff.next_delay();
                warn!(
                    exchange = "gateio",
                    channel,
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

async fn run_stream(
    inner: &Arc<Inner>,
    channel: &'static str,
    symbols: &[String],
    on_tick: &TickCallback,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<(), AdapterError> {
    let (ws, _resp) = connect_async(WS_URL)
        .await
        .map_err(|e| AdapterError::Transient(format!("connect: {e}")))?;
    let (mut write, mut read) = ws.split();

    let sub = subscribe_frame(channel, symbols, chrono::Utc::now().timestamp());
    write
        .send(Message::Text(sub.into()))
        .await
        .map_err(|e| AdapterError::Transient(format!("subscribe send: {e}")))?;

    inner.set_status(AdapterStatus::Subscribed);
    backoff.reset();
    info!(exchange = "gateio", channel, symbols = symbols.len(), "stream subscribed");

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_message(inner, channel, &text, on_tick)?;
                }
                Some(Ok(_)) => {} // transport ping/pong handled by tungstenite
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

/// Build the channel subscription frame.
fn subscribe_frame(channel: &str, symbols: &[String], time: i64) -> String {
    serde_json::json!({
        "time": time,
        "channel": channel,
        "event": "subscribe",
        "payload": symbols,
    })
    .to_string()
}

fn handle_message(
    inner: &Arc<Inner>,
    channel: &'static str,
    text: &str,
    on_tick: &TickCallback,
) -> Result<(), AdapterError> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            if let Some(suppressed) = inner.parse_warn.allow() {
                warn!(exchange = "gateio", error = %e, suppressed, "unparseable frame dropped");
            }
            return Ok(());
        }
    };

    match root["event"].as_str() {
        Some("subscribe") => {
            if !root["error"].is_null() {
                return Err(AdapterError::Fatal(format!(
                    "subscription rejected: {}",
                    root["error"]
                )));
            }
            return Ok(());
        }
        Some("update") => {}
        _ => return Ok(()),
    }

    let result = match channel {
        "spot.book_ticker" => parse_book_ticker(&root["result"]),
        "spot.trades" => parse_trade(&root["result"]),
        _ => return Ok(()),
    };

    match result {
        Ok(tick) => on_tick(tick),
        Err(e) => {
            if let Some(suppressed) = inner.parse_warn.allow() {
                warn!(exchange = "gateio", channel, error = %e, suppressed, "malformed frame dropped");
            }
        }
    }
    Ok(())
}

/// `spot.book_ticker` update → spread tick.
fn parse_book_ticker(result: &serde_json::Value) -> Result<Tick, AdapterError> {
    let symbol = result["s"]
        .as_str()
        .ok_or_else(|| AdapterError::Protocol("book_ticker missing s".into()))?;

    let best_bid = json_decimal(&result["b"], "b")?;
    let best_ask = json_decimal(&result["a"], "a")?;
    let bid_qty = json_decimal(&result["B"], "B")?;
    let ask_qty = json_decimal(&result["A"], "A")?;
    let ts = result["t"].as_i64().map(ms_to_utc).unwrap_or_else(chrono::Utc::now);

    Ok(Tick {
        exchange: ExchangeId::GateIo,
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

/// `spot.trades` update → trade tick. `create_time_ms` arrives as a string
/// with fractional milliseconds.
fn parse_trade(result: &serde_json::Value) -> Result<Tick, AdapterError> {
    let symbol = result["currency_pair"]
        .as_str()
        .ok_or_else(|| AdapterError::Protocol("trade missing currency_pair".into()))?;

    let price = json_decimal(&result["price"], "price")?;
    let qty = json_decimal(&result["amount"], "amount")?;
    let side = match result["side"].as_str() {
        Some("buy") => Side::Buy,
        Some("sell") => Side::Sell,
        other => {
            return Err(AdapterError::Protocol(format!(
                "trade has unknown side {other:?}"
            )))
        }
    };

    let ts = result["create_time_ms"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|ms| ms_to_utc(ms as i64))
        .unwrap_or_else(chrono::Utc::now);

    Ok(Tick {
        exchange: ExchangeId::GateIo,
        symbol: symbol.to_string(),
        ts,
        kind: TickKind::Trade { price, qty, side },
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn subscribe_frame_shape() {
        let frame = subscribe_frame(
            "spot.book_ticker",
            &["BTC_USDT".to_string(), "ETH_USDT".to_string()],
            1_700_000_000,
        );
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["channel"], "spot.book_ticker");
        assert_eq!(parsed["event"], "subscribe");
        assert_eq!(parsed["payload"][0], "BTC_USDT");
        assert_eq!(parsed["payload"][1], "ETH_USDT");
        assert_eq!(parsed["time"], 1_700_000_000);
    }

    #[test]
    fn parse_book_ticker_ok() {
        let result: serde_json::Value = serde_json::from_str(
            r#"{
                "t": 1700000000456,
                "u": 123,
                "s": "BTC_USDT",
                "b": "50175.3",
                "B": "0.5",
                "a": "50176.4",
                "A": "1.25"
            }"#,
        )
        .unwrap();

        let tick = parse_book_ticker(&result).expect("should parse");
        assert_eq!(tick.exchange, ExchangeId::GateIo);
        assert_eq!(tick.symbol, "BTC_USDT");
        match tick.kind {
            TickKind::Spread {
                best_bid, best_ask, ..
            } => {
                assert_eq!(best_bid, dec!(50175.3));
                assert_eq!(best_ask, dec!(50176.4));
            }
            _ => panic!("expected spread tick"),
        }
        assert_eq!(tick.ts.timestamp_millis(), 1_700_000_000_456);
    }

    #[test]
    fn parse_book_ticker_missing_ask_rejected() {
        let result: serde_json::Value =
            serde_json::from_str(r#"{"s":"BTC_USDT","b":"1","B":"1","A":"1"}"#).unwrap();
        assert!(matches!(
            parse_book_ticker(&result),
            Err(AdapterError::Protocol(_))
        ));
    }

    #[test]
    fn parse_trade_ok() {
        let result: serde_json::Value = serde_json::from_str(
            r#"{
                "id": 309143071,
                "create_time_ms": "1700000000123.456",
                "side": "sell",
                "currency_pair": "BTC_USDT",
                "amount": "0.007",
                "price": "50170.0"
            }"#,
        )
        .unwrap();

        let tick = parse_trade(&result).expect("should parse");
        match tick.kind {
            TickKind::Trade { price, qty, side } => {
                assert_eq!(price, dec!(50170.0));
                assert_eq!(qty, dec!(0.007));
                assert_eq!(side, Side::Sell);
            }
            _ => panic!("expected trade tick"),
        }
        assert_eq!(tick.ts.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn new_adapter_is_not_started() {
        let adapter = GateIoAdapter::new();
        assert_eq!(adapter.status(), AdapterStatus::NotStarted);
        assert_eq!(adapter.id(), ExchangeId::GateIo);
    }
}
