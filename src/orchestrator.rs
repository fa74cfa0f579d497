// =============================================================================
// Orchestrator — fan-in from adapters, normalize, fan-out to four sinks
// =============================================================================
//
// Per tick, in order: normalize the symbol (drop on failure), compute the
// spread percentage, then deliver to (1) the push server's direct hot path,
// (2) the archive channel, (3) the window channel, (4) the deviation
// calculator → signal detector, synchronously.
//
// The archive and window channels are two independent bounded drop-oldest
// channels; each drainer owns its receiver outright. Adapter bring-up
// failures are contained per adapter: the health monitor records Failed and
// the remaining adapters keep running.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive::ArchiveWriter;
use crate::deviation::DeviationCalculator;
use crate::exchanges::{filter, ExchangeAdapter, TickCallback};
use crate::health::HealthMonitor;
use crate::logging::RateLimitedLog;
use crate::market_data::channel::{TickReceiver, TickSender};
use crate::market_data::normalize::normalize_symbol;
use crate::market_data::spread::spread_pct;
use crate::rolling_window::RollingWindowStore;
use crate::runtime_config::ExchangeConfig;
use crate::signals::{SignalDetector, SignalTransition};
use crate::types::{Tick, TickKind};

/// Direct hot-path delivery ahead of the channel writes. Implementations
/// must not block; errors stay inside the sink.
pub trait HotPathSink: Send + Sync {
    fn deliver(&self, tick: &Tick);
}

/// No-op sink for setups without a push server (tests, batch tools).
pub struct NullHotPath;

impl HotPathSink for NullHotPath {
    fn deliver(&self, _tick: &Tick) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub name: &'static str,
    pub sent: u64,
    pub dropped: u64,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub ticks_processed: u64,
    pub normalize_drops: u64,
    pub invalid_book_drops: u64,
    pub archive_channel: ChannelStats,
    pub window_channel: ChannelStats,
}

pub struct Orchestrator {
    archive_tx: TickSender,
    window_tx: TickSender,
    push: Arc<dyn HotPathSink>,
    deviation: Arc<DeviationCalculator>,
    detector: Arc<SignalDetector>,
    health: Arc<HealthMonitor>,

    ticks_processed: AtomicU64,
    normalize_drops: AtomicU64,
    invalid_book_drops: AtomicU64,
    norm_warn: RateLimitedLog,
}

impl Orchestrator {
    pub fn new(
        archive_tx: TickSender,
        window_tx: TickSender,
        push: Arc<dyn HotPathSink>,
        deviation: Arc<DeviationCalculator>,
        detector: Arc<SignalDetector>,
        health: Arc<HealthMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            archive_tx,
            window_tx,
            push,
            deviation,
            detector,
            health,
            ticks_processed: AtomicU64::new(0),
            normalize_drops: AtomicU64::new(0),
            invalid_book_drops: AtomicU64::new(0),
            norm_warn: RateLimitedLog::per_second(),
        })
    }

    /// The callback handed to every adapter subscription.
    pub fn tick_callback(self: &Arc<Self>) -> TickCallback {
        let orchestrator = self.clone();
        Arc::new(move |raw| orchestrator.handle_tick(raw))
    }

    /// The hot path. Runs on the adapter's stream task; everything heavier
    /// than a map update or channel push is deferred to the drainers.
    pub fn handle_tick(&self, raw: Tick) {
        self.health.touch(raw.exchange);

        let Some(symbol) = normalize_symbol(&raw.symbol) else {
            let dropped = self.normalize_drops.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(suppressed) = self.norm_warn.allow() {
                warn!(
                    exchange = %raw.exchange,
                    symbol = %raw.symbol,
                    dropped_total = dropped,
                    suppressed,
                    "tick dropped, symbol not normalizable"
                );
            }
            return;
        };

        let kind = match raw.kind {
            TickKind::Spread {
                best_bid,
                best_ask,
                bid_qty,
                ask_qty,
                ..
            } => {
                let Some(pct) = spread_pct(best_bid, best_ask) else {
                    self.invalid_book_drops.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                TickKind::Spread {
                    best_bid,
                    best_ask,
                    spread_pct: pct,
                    bid_qty,
                    ask_qty,
                }
            }
            trade @ TickKind::Trade { .. } => trade,
        };

        let tick = Tick {
            exchange: raw.exchange,
            symbol,
            ts: raw.ts,
            kind,
        };
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);

        // Delivery order is part of the contract: push first, then the two
        // independent channels, then the synchronous deviation pass.
        self.push.deliver(&tick);
        self.archive_tx.send(tick.clone());
        self.window_tx.send(tick.clone());

        for outcome in self.deviation.ingest(&tick) {
            if let Some(transition) = self.detector.observe(&outcome.reading) {
                match transition {
                    SignalTransition::Entry(signal) => {
                        info!(
                            symbol = %signal.symbol,
                            direction = %signal.direction,
                            cheap = %signal.cheap_exchange,
                            rich = %signal.rich_exchange,
                            deviation_pct = signal.deviation_pct,
                            "entry signal"
                        );
                    }
                    SignalTransition::Exit { signal, reason } => {
                        info!(
                            symbol = %signal.symbol,
                            reason = ?reason,
                            "exit signal"
                        );
                    }
                }
            }
        }
    }

    /// Close both channel writer sides; drainers finish the queued backlog
    /// and end.
    pub fn close_channels(&self) {
        self.archive_tx.close();
        self.window_tx.close();
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            normalize_drops: self.normalize_drops.load(Ordering::Relaxed),
            invalid_book_drops: self.invalid_book_drops.load(Ordering::Relaxed),
            archive_channel: ChannelStats {
                name: self.archive_tx.name(),
                sent: self.archive_tx.sent(),
                dropped: self.archive_tx.dropped(),
                queued: self.archive_tx.len(),
            },
            window_channel: ChannelStats {
                name: self.window_tx.name(),
                sent: self.window_tx.sent(),
                dropped: self.window_tx.dropped(),
                queued: self.window_tx.len(),
            },
        }
    }
}

// =============================================================================
// Adapter bring-up
// =============================================================================

/// Transient ticker-snapshot failures retried before an adapter is declared
/// failed at startup.
const TICKER_SNAPSHOT_RETRIES: u32 = 3;

/// REST ticker snapshot with retry: transient faults back off and retry up
/// to the limit, fatal and protocol faults surface immediately.
async fn fetch_tickers_with_retry(
    adapter: &Arc<dyn ExchangeAdapter>,
) -> Result<Vec<crate::types::TickerInfo>, crate::exchanges::AdapterError> {
    let mut backoff = crate::exchanges::Backoff::default();
    loop {
        match adapter.get_tickers().await {
            Ok(tickers) => return Ok(tickers),
            Err(crate::exchanges::AdapterError::Transient(msg))
                if backoff.attempt() < TICKER_SNAPSHOT_RETRIES =>
            {
                let delay = backoff.next_delay();
                warn!(
                    exchange = %adapter.id(),
                    error = %msg,
                    delay_ms = delay.as_millis() as u64,
                    "ticker snapshot failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Start one adapter: snapshot its tickers, select symbols, subscribe the
/// configured streams. Every failure path is contained to this adapter;
/// returns whether the adapter came up.
pub async fn start_adapter(
    orchestrator: &Arc<Orchestrator>,
    adapter: Arc<dyn ExchangeAdapter>,
    cfg: &ExchangeConfig,
) -> bool {
    let exchange = adapter.id();
    orchestrator.health.register(exchange);

    let outcome = async {
        adapter.start().await?;
        let tickers = fetch_tickers_with_retry(&adapter).await?;
        let symbols = filter::select_symbols(&tickers, &cfg.volume_filter);
        if symbols.is_empty() {
            warn!(exchange = %exchange, "volume filter selected no symbols");
            return Ok::<usize, crate::exchanges::AdapterError>(0);
        }
        if cfg.subscribe.spreads {
            adapter
                .subscribe_spreads(symbols.clone(), orchestrator.tick_callback())
                .await?;
        }
        if cfg.subscribe.trades {
            adapter
                .subscribe_trades(symbols.clone(), orchestrator.tick_callback())
                .await?;
        }
        Ok(symbols.len())
    }
    .await;

    match outcome {
        Ok(count) => {
            info!(exchange = %exchange, symbols = count, "adapter subscribed");
            true
        }
        Err(e) => {
            error!(exchange = %exchange, error = %e, "adapter failed to start, isolating");
            orchestrator.health.mark_failed(exchange);
            false
        }
    }
}

// =============================================================================
// Sink drainers
// =============================================================================

/// Single consumer of the window channel.
pub fn spawn_window_drainer(
    mut rx: TickReceiver,
    store: Arc<RollingWindowStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tick) = rx.recv().await {
            store.ingest(&tick);
        }
        info!("window drainer finished");
    })
}

/// Single consumer of the archive channel.
pub fn spawn_archive_drainer(
    mut rx: TickReceiver,
    writer: Arc<ArchiveWriter>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tick) = rx.recv().await {
            writer.write(tick);
            writer.flush_pending().await;
        }
        info!("archive drainer finished");
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::channel::tick_channel;
    use crate::runtime_config::{DeviationConfig, LatestTicksConfig, RollingWindowConfig, SignalsConfig};
    use crate::types::{ExchangeId, SignalDirection};
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    struct RecordingHotPath {
        ticks: Mutex<Vec<Tick>>,
    }

    impl RecordingHotPath {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ticks: Mutex::new(Vec::new()),
            })
        }
    }

    impl HotPathSink for RecordingHotPath {
        fn deliver(&self, tick: &Tick) {
            self.ticks.lock().push(tick.clone());
        }
    }

    struct Rig {
        orchestrator: Arc<Orchestrator>,
        archive_rx: TickReceiver,
        window_rx: TickReceiver,
        detector: Arc<SignalDetector>,
        hot_path: Arc<RecordingHotPath>,
    }

    fn rig() -> Rig {
        let (archive_tx, archive_rx) = tick_channel("archive", 1024);
        let (window_tx, window_rx) = tick_channel("window", 1024);
        let hot_path = RecordingHotPath::new();
        let deviation = Arc::new(DeviationCalculator::new(&DeviationConfig::default(), 1000));
        let detector = Arc::new(SignalDetector::new(&SignalsConfig::default()));
        let health = Arc::new(HealthMonitor::new(120));
        let orchestrator = Orchestrator::new(
            archive_tx,
            window_tx,
            hot_path.clone(),
            deviation,
            detector.clone(),
            health,
        );
        Rig {
            orchestrator,
            archive_rx,
            window_rx,
            detector,
            hot_path,
        }
    }

    fn raw_spread(exchange: ExchangeId, raw_symbol: &str, ts: DateTime<Utc>, bid: i64, ask: i64) -> Tick {
        Tick {
            exchange,
            symbol: raw_symbol.to_string(),
            ts,
            kind: TickKind::Spread {
                best_bid: Decimal::new(bid, 0),
                best_ask: Decimal::new(ask, 0),
                spread_pct: 0.0,
                bid_qty: Decimal::ONE,
                ask_qty: Decimal::ONE,
            },
        }
    }

    #[tokio::test]
    async fn normalizes_and_computes_spread() {
        let mut r = rig();
        r.orchestrator.handle_tick(raw_spread(
            ExchangeId::Bybit,
            "BTC/USDT",
            Utc::now(),
            50_000,
            50_001,
        ));

        let tick = r.window_rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "BTC_USDT");
        match tick.kind {
            TickKind::Spread { spread_pct, .. } => {
                assert!((spread_pct - (1.0 / 50_001.0 * 100.0)).abs() < 1e-9);
            }
            _ => panic!("expected spread tick"),
        }
    }

    #[tokio::test]
    async fn unnormalizable_symbol_is_dropped_and_counted() {
        let r = rig();
        r.orchestrator.handle_tick(raw_spread(
            ExchangeId::Bybit,
            "BTCEUR",
            Utc::now(),
            50_000,
            50_001,
        ));

        let stats = r.orchestrator.stats();
        assert_eq!(stats.normalize_drops, 1);
        assert_eq!(stats.ticks_processed, 0);
        assert!(r.hot_path.ticks.lock().is_empty());
    }

    #[tokio::test]
    async fn fans_out_to_both_channels_independently() {
        let mut r = rig();
        for i in 0..10 {
            r.orchestrator.handle_tick(raw_spread(
                ExchangeId::Bybit,
                "BTCUSDT",
                Utc::now(),
                50_000 + i,
                50_001 + i,
            ));
        }
        r.orchestrator.close_channels();

        let mut archive_count = 0;
        while r.archive_rx.recv().await.is_some() {
            archive_count += 1;
        }
        let mut window_count = 0;
        while r.window_rx.recv().await.is_some() {
            window_count += 1;
        }
        // Each sink sees the full stream, not a split of it.
        assert_eq!(archive_count, 10);
        assert_eq!(window_count, 10);
        assert_eq!(r.hot_path.ticks.lock().len(), 10);

        let stats = r.orchestrator.stats();
        assert_eq!(stats.archive_channel.sent, 10);
        assert_eq!(stats.window_channel.sent, 10);
    }

    #[tokio::test]
    async fn hot_path_delivery_precedes_channels() {
        let r = rig();
        r.orchestrator.handle_tick(raw_spread(
            ExchangeId::Bybit,
            "BTCUSDT",
            Utc::now(),
            50_000,
            50_001,
        ));
        // The hot path saw the normalized tick even before any drainer ran.
        let seen = r.hot_path.ticks.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].symbol, "BTC_USDT");
    }

    #[tokio::test]
    async fn two_exchange_pipeline_raises_entry_signal() {
        // The two-exchange happy path through orchestrator → deviation →
        // detector: BYB 50000/50001 at T0, GAT 50180/50181 at T0+100ms
        // (0.36% rich, clear of the 0.35 entry threshold).
        let r = rig();
        let t0 = Utc::now();
        r.orchestrator.handle_tick(raw_spread(ExchangeId::Bybit, "BTC/USDT", t0, 50_000, 50_001));
        r.orchestrator.handle_tick(raw_spread(
            ExchangeId::GateIo,
            "BTC_USDT",
            t0 + chrono::Duration::milliseconds(100),
            50_180,
            50_181,
        ));

        let active = r.detector.active_signals();
        assert_eq!(active.len(), 1);
        let signal = &active[0].signal;
        assert_eq!(signal.symbol, "BTC_USDT");
        assert_eq!(signal.direction, SignalDirection::Down);
        assert_eq!(signal.cheap_exchange, ExchangeId::Bybit);
        assert_eq!(signal.rich_exchange, ExchangeId::GateIo);
        assert!((signal.deviation_pct.abs() - 0.36).abs() < 0.01);
    }

    #[tokio::test]
    async fn exit_signal_clears_active_set() {
        // S2: after convergence both venues quote bid=50100.
        let r = rig();
        let t0 = Utc::now();
        r.orchestrator.handle_tick(raw_spread(ExchangeId::Bybit, "BTCUSDT", t0, 50_000, 50_001));
        r.orchestrator.handle_tick(raw_spread(
            ExchangeId::GateIo,
            "BTCUSDT",
            t0 + chrono::Duration::milliseconds(100),
            50_180,
            50_181,
        ));
        assert_eq!(r.detector.active_signals().len(), 1);

        let t1 = t0 + chrono::Duration::seconds(30);
        r.orchestrator.handle_tick(raw_spread(ExchangeId::Bybit, "BTCUSDT", t1, 50_100, 50_101));
        r.orchestrator.handle_tick(raw_spread(
            ExchangeId::GateIo,
            "BTCUSDT",
            t1 + chrono::Duration::milliseconds(50),
            50_100,
            50_101,
        ));

        assert!(r.detector.active_signals().is_empty());
    }

    // ── Adapter bring-up isolation ──────────────────────────────────────

    struct MockAdapter {
        transient_failures: std::sync::atomic::AtomicU32,
        fatal: bool,
        subscribed: std::sync::atomic::AtomicBool,
    }

    impl MockAdapter {
        fn flaky(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                transient_failures: std::sync::atomic::AtomicU32::new(failures),
                fatal: false,
                subscribed: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                transient_failures: std::sync::atomic::AtomicU32::new(0),
                fatal: true,
                subscribed: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl ExchangeAdapter for MockAdapter {
        fn id(&self) -> ExchangeId {
            ExchangeId::Bybit
        }

        async fn start(&self) -> Result<(), crate::exchanges::AdapterError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn get_tickers(
            &self,
        ) -> Result<Vec<crate::types::TickerInfo>, crate::exchanges::AdapterError> {
            if self.fatal {
                return Err(crate::exchanges::AdapterError::Fatal("bad key".into()));
            }
            let remaining = self.transient_failures.load(Ordering::Relaxed);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::Relaxed);
                return Err(crate::exchanges::AdapterError::Transient(
                    "connection reset".into(),
                ));
            }
            Ok(vec![crate::types::TickerInfo {
                symbol: "BTCUSDT".into(),
                quote_volume_24h: Decimal::new(50_000_000, 0),
            }])
        }

        async fn subscribe_spreads(
            &self,
            _symbols: Vec<String>,
            _on_tick: crate::exchanges::TickCallback,
        ) -> Result<(), crate::exchanges::AdapterError> {
            self.subscribed.store(true, Ordering::Relaxed);
            Ok(())
        }

        async fn subscribe_trades(
            &self,
            _symbols: Vec<String>,
            _on_tick: crate::exchanges::TickCallback,
        ) -> Result<(), crate::exchanges::AdapterError> {
            Ok(())
        }

        fn status(&self) -> crate::exchanges::AdapterStatus {
            crate::exchanges::AdapterStatus::Subscribed
        }
    }

    fn bybit_cfg() -> crate::runtime_config::ExchangeConfig {
        crate::runtime_config::ExchangeConfig {
            name: "bybit".into(),
            volume_filter: crate::runtime_config::VolumeFilterConfig {
                min_usd_volume: 0.0,
                max_usd_volume: f64::MAX,
                quote_assets: vec!["USDT".into()],
            },
            subscribe: crate::runtime_config::SubscribeConfig::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_ticker_snapshot_failures_are_retried() {
        let r = rig();
        let adapter = MockAdapter::flaky(2);
        let started = start_adapter(&r.orchestrator, adapter.clone(), &bybit_cfg()).await;
        assert!(started);
        assert!(adapter.subscribed.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_failures_fail_the_adapter() {
        let r = rig();
        let adapter = MockAdapter::flaky(10);
        let started = start_adapter(&r.orchestrator, adapter, &bybit_cfg()).await;
        assert!(!started);
    }

    #[tokio::test]
    async fn fatal_startup_error_isolates_adapter() {
        let r = rig();
        let adapter = MockAdapter::broken();
        let started = start_adapter(&r.orchestrator, adapter, &bybit_cfg()).await;
        assert!(!started);
        // Isolation is visible through the health monitor, the process
        // itself keeps running.
        assert_eq!(
            r.orchestrator.health.state_of(ExchangeId::Bybit),
            crate::health::ExchangeState::Failed
        );
    }

    #[tokio::test]
    async fn drainers_process_full_backlog_then_finish() {
        // The shutdown shape: inject, close, drain everything within budget.
        let r = rig();
        let store = Arc::new(RollingWindowStore::new(
            &RollingWindowConfig::default(),
            &LatestTicksConfig::default(),
        ));
        let t0 = Utc::now();
        for i in 0..100 {
            let ts = t0 + chrono::Duration::milliseconds(i);
            r.orchestrator.handle_tick(raw_spread(ExchangeId::Bybit, "BTCUSDT", ts, 50_000, 50_001));
            r.orchestrator.handle_tick(raw_spread(ExchangeId::GateIo, "BTCUSDT", ts, 50_010, 50_011));
        }
        r.orchestrator.close_channels();

        let window_task = spawn_window_drainer(r.window_rx, store.clone());
        tokio::time::timeout(std::time::Duration::from_secs(5), window_task)
            .await
            .expect("drainer must finish within the shutdown budget")
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.samples_appended as usize + stats.samples_out_of_order as usize, 200 - 1);
        assert_eq!(r.orchestrator.stats().window_channel.queued, 0);
    }
}
