// =============================================================================
// Binance adapter — combined public streams + REST ticker snapshot
// =============================================================================
//
// Subscriptions ride the URL of a combined stream
// (`/stream?streams=btcusdt@bookTicker/btcusdt@aggTrade/...`), so a
// reconnect re-subscribes by construction. Binance pings at the transport
// layer; tungstenite answers automatically.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
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

const WS_BASE: &str = "wss://stream.binance.com:9443/stream?streams=";
const REST_TICKERS_URL: &str = "https://api.binance.com/api/v3/ticker/24hr";

pub struct BinanceAdapter {
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

impl BinanceAdapter {
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

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
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
            let Some(symbol) = row["symbol"].as_str() else {
                continue;
            };
            match json_decimal(&row["quoteVolume"], "quoteVolume") {
                Ok(volume) => tickers.push(TickerInfo {
                    symbol: symbol.to_string(),
                    quote_volume_24h: volume,
                }),
                Err(e) => {
                    warn!(exchange = "binance", symbol, error = %e, "skipping ticker row");
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
        let url = combined_stream_url(&symbols, "bookTicker");
        self.spawn_stream(url, on_tick);
        Ok(())
    }

    async fn subscribe_trades(
        &self,
        symbols: Vec<String>,
        on_tick: TickCallback,
    ) -> Result<(), AdapterError> {
        let url = combined_stream_url(&symbols, "aggTrade");
        self.spawn_stream(url, on_tick);
        Ok(())
    }

    fn status(&self) -> AdapterStatus {
        *self.inner.status.read()
    }
}

impl BinanceAdapter {
    fn spawn_stream(&self, url: String, on_tick: TickCallback) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            stream_supervisor(inner, url, on_tick).await;
        });
        self.inner.tasks.lock().push(handle);
    }
}

/// Build the combined-stream URL for one stream kind across all symbols.
fn combined_stream_url(symbols: &[String], stream: &str) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@{stream}", s.to_lowercase()))
        .collect();
    format!("{WS_BASE}{}", streams.join("/"))
}

async fn stream_supervisor(inner: Arc<Inner>, url: String, on_tick: TickCallback) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut backoff = Backoff::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_stream(&inner, &url, &on_tick, &mut shutdown, &mut backoff).await {
            Ok(()) => break,
            Err(AdapterError::Fatal(msg)) => {
                error!(exchange = "binance", error = %msg, "fatal stream error, adapter failed");
                inner.set_status(AdapterStatus::Failed);
                return;
            }
            Err(e) => {
                inner.set_status(AdapterStatus::Reconnecting);
                let delay = backoff.next_delay();
                warn!(
                    exchange = "binance",
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
    url: &str,
    on_tick: &TickCallback,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<(), AdapterError> {
    let (ws, _resp) = connect_async(url)
        .await
        .map_err(|e| AdapterError::Transient(format!("connect: {e}")))?;
    let (_write, mut read) = ws.split();

    inner.set_status(AdapterStatus::Subscribed);
    backoff.reset();
    info!(exchange = "binance", "stream subscribed");

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match parse_combined_frame(&text) {
                        Ok(Some(tick)) => on_tick(tick),
                        Ok(None) => {}
                        Err(e) => {
                            if let Some(suppressed) = inner.parse_warn.allow() {
                                warn!(exchange = "binance", error = %e, suppressed, "malformed frame dropped");
                            }
                        }
                    }
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

/// Parse one combined-stream envelope. Returns `Ok(None)` for frames that
/// carry no tick (stream confirmations and the like).
fn parse_combined_frame(text: &str) -> Result<Option<Tick>, AdapterError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| AdapterError::Protocol(format!("frame not JSON: {e}")))?;

    let Some(stream) = root["stream"].as_str() else {
        return Ok(None);
    };
    let data = &root["data"];

    if stream.ends_with("@bookTicker") {
        parse_book_ticker(data).map(Some)
    } else if stream.ends_with("@aggTrade") {
        parse_agg_trade(data).map(Some)
    } else {
        Ok(None)
    }
}

/// `<symbol>@bookTicker` payload → spread tick. The payload carries no
/// exchange timestamp; the receive time is stamped here.
fn parse_book_ticker(data: &serde_json::Value) -> Result<Tick, AdapterError> {
    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| AdapterError::Protocol("bookTicker missing s".into()))?;

    let best_bid = json_decimal(&data["b"], "b")?;
    let best_ask = json_decimal(&data["a"], "a")?;
    let bid_qty = json_decimal(&data["B"], "B")?;
    let ask_qty = json_decimal(&data["A"], "A")?;

    Ok(Tick {
        exchange: ExchangeId::Binance,
        symbol: symbol.to_string(),
        ts: chrono::Utc::now(),
        kind: TickKind::Spread {
            best_bid,
            best_ask,
            spread_pct: 0.0,
            bid_qty,
            ask_qty,
        },
    })
}

/// `<symbol>@aggTrade` payload → trade tick. `m` == true means the buyer was
/// the maker, i.e. the aggressor sold.
fn parse_agg_trade(data: &serde_json::Value) -> Result<Tick, AdapterError> {
    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| AdapterError::Protocol("aggTrade missing s".into()))?;

    let price = json_decimal(&data["p"], "p")?;
    let qty = json_decimal(&data["q"], "q")?;
    let is_buyer_maker = data["m"]
        .as_bool()
        .ok_or_else(|| AdapterError::Protocol("aggTrade missing m".into()))?;
    let side = if is_buyer_maker { Side::Sell } else { Side::Buy };
    let ts = data["T"].as_i64().map(ms_to_utc).unwrap_or_else(chrono::Utc::now);

    Ok(Tick {
        exchange: ExchangeId::Binance,
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
    fn combined_url_lowercases_and_joins() {
        let url = combined_stream_url(
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            "bookTicker",
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@bookTicker/ethusdt@bookTicker"
        );
    }

    #[test]
    fn parse_book_ticker_frame() {
        let frame = r#"{
            "stream": "btcusdt@bookTicker",
            "data": {
                "u": 400900217,
                "s": "BTCUSDT",
                "b": "50000.00000000",
                "B": "31.21000000",
                "a": "50000.01000000",
                "A": "40.66000000"
            }
        }"#;
        let tick = parse_combined_frame(frame).unwrap().expect("tick expected");
        assert_eq!(tick.exchange, ExchangeId::Binance);
        assert_eq!(tick.symbol, "BTCUSDT");
        match tick.kind {
            TickKind::Spread {
                best_bid, best_ask, ..
            } => {
                assert_eq!(best_bid, dec!(50000.00000000));
                assert_eq!(best_ask, dec!(50000.01000000));
            }
            _ => panic!("expected spread tick"),
        }
    }

    #[test]
    fn parse_agg_trade_frame_maps_maker_flag() {
        let frame = r#"{
            "stream": "btcusdt@aggTrade",
            "data": {
                "e": "aggTrade",
                "s": "BTCUSDT",
                "p": "50000.5",
                "q": "0.250",
                "T": 1700000000777,
                "m": true
            }
        }"#;
        let tick = parse_combined_frame(frame).unwrap().expect("tick expected");
        match tick.kind {
            TickKind::Trade { price, qty, side } => {
                assert_eq!(price, dec!(50000.5));
                assert_eq!(qty, dec!(0.250));
                // Buyer-is-maker means the taker sold.
                assert_eq!(side, Side::Sell);
            }
            _ => panic!("expected trade tick"),
        }
        assert_eq!(tick.ts.timestamp_millis(), 1_700_000_000_777);
    }

    #[test]
    fn unknown_stream_suffix_is_skipped() {
        let frame = r#"{"stream":"btcusdt@depth","data":{}}"#;
        assert_eq!(parse_combined_frame(frame).unwrap(), None);
    }

    #[test]
    fn non_json_frame_is_protocol_error() {
        assert!(matches!(
            parse_combined_frame("not json"),
            Err(AdapterError::Protocol(_))
        ));
    }

    #[test]
    fn new_adapter_is_not_started() {
        let adapter = BinanceAdapter::new();
        assert_eq!(adapter.status(), AdapterStatus::NotStarted);
        assert_eq!(adapter.id(), ExchangeId::Binance);
    }
}
