// =============================================================================
// QuoteMesh — Main Entry Point
// =============================================================================
//
// Wires the ingest-and-distribution pipeline: exchange adapters fan ticks
// into the orchestrator, which feeds the push server, the archive channel,
// the window channel, and the deviation/signal engine. Shutdown drains the
// channels and flushes the archive inside a five-second budget.
//
// Exit codes: 0 clean shutdown, 1 unrecoverable startup error, 2 shutdown
// budget exceeded.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod archive;
mod deviation;
mod exchanges;
mod health;
mod logging;
mod market_data;
mod orchestrator;
mod rolling_window;
mod runtime_config;
mod signals;
mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::PushServer;
use crate::app_state::AppState;
use crate::archive::{ArchiveWriter, CsvPartitionSink};
use crate::deviation::DeviationCalculator;
use crate::exchanges::binance::BinanceAdapter;
use crate::exchanges::bybit::BybitAdapter;
use crate::exchanges::gateio::GateIoAdapter;
use crate::exchanges::{AdapterStatus, ExchangeAdapter};
use crate::health::HealthMonitor;
use crate::market_data::channel::tick_channel;
use crate::orchestrator::{
    spawn_archive_drainer, spawn_window_drainer, start_adapter, Orchestrator,
};
use crate::rolling_window::RollingWindowStore;
use crate::runtime_config::RuntimeConfig;
use crate::signals::SignalDetector;
use crate::types::ExchangeId;

const CONFIG_PATH: &str = "quotemesh.json";
/// Total budget for the ordered shutdown sequence.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("QuoteMesh starting up");

    let mut config = if std::path::Path::new(CONFIG_PATH).exists() {
        match RuntimeConfig::load(CONFIG_PATH) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid runtime config");
                return 1;
            }
        }
    } else {
        warn!(path = CONFIG_PATH, "config file not found, using defaults");
        RuntimeConfig::default()
    };
    config.apply_env_overrides();
    if let Err(e) = config.validate() {
        error!(error = %e, "runtime config failed validation");
        return 1;
    }

    // ── 2. Build the pipeline ────────────────────────────────────────────
    let health = Arc::new(HealthMonitor::new(config.latest_ticks.stale_seconds));
    let store = Arc::new(RollingWindowStore::new(
        &config.rolling_window,
        &config.latest_ticks,
    ));
    let deviation = Arc::new(DeviationCalculator::new(
        &config.deviation,
        config.latest_ticks.max_entries,
    ));
    let detector = Arc::new(SignalDetector::new(&config.signals));
    let archive = Arc::new(ArchiveWriter::new(
        &config.archive,
        Arc::new(CsvPartitionSink),
    ));
    let push = PushServer::new(store.clone(), detector.clone(), config.push.clone());

    // Two independent bounded channels: one per sink, one consumer each.
    let (archive_tx, archive_rx) = tick_channel("archive", config.channels.capacity);
    let (window_tx, window_rx) = tick_channel("window", config.channels.capacity);

    let orchestrator = Orchestrator::new(
        archive_tx,
        window_tx,
        push.clone(),
        deviation.clone(),
        detector.clone(),
        health.clone(),
    );

    // ── 3. Drainers & maintenance tasks ──────────────────────────────────
    let (shutdown_tx, _) = watch::channel(false);
    let window_drainer = spawn_window_drainer(window_rx, store.clone());
    let archive_drainer = spawn_archive_drainer(archive_rx, archive.clone());
    let cleanup_task = store.spawn_cleanup_task(shutdown_tx.subscribe());
    let sweep_task = push.spawn_sweep_task(shutdown_tx.subscribe());

    // ── 4. Adapters ──────────────────────────────────────────────────────
    let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::new();
    let mut started = 0usize;
    for exchange_cfg in &config.exchanges {
        let Some(id) = exchange_cfg.exchange_id() else {
            continue; // validate() already rejected unknown names
        };
        let adapter: Arc<dyn ExchangeAdapter> = match id {
            ExchangeId::Bybit => Arc::new(BybitAdapter::new()),
            ExchangeId::GateIo => Arc::new(GateIoAdapter::new()),
            ExchangeId::Binance => Arc::new(BinanceAdapter::new()),
        };
        if start_adapter(&orchestrator, adapter.clone(), exchange_cfg).await {
            started += 1;
        }
        adapters.push(adapter);
    }
    if started == 0 {
        error!("no exchange adapters started");
        return 1;
    }
    info!(started, total = adapters.len(), "exchange adapters running");

    // ── 5. API server ────────────────────────────────────────────────────
    let state = AppState::new(
        config,
        health.clone(),
        store,
        deviation,
        detector,
        archive.clone(),
        orchestrator.clone(),
        push,
    );

    let bind_addr = state.config.bind_addr.clone();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind API server");
            return 1;
        }
    };
    info!(addr = %bind_addr, "API server listening");
    let app = api::rest::router(state.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Wait for the shutdown signal ──────────────────────────────────
    let _ = tokio::signal::ctrl_c().await;
    warn!("shutdown signal received, stopping gracefully");

    // ── 7. Ordered shutdown ──────────────────────────────────────────────
    state.set_stopping();
    let deadline = Instant::now() + SHUTDOWN_BUDGET;
    let mut on_budget = true;

    // (i) Stop accepting new ticks.
    for adapter in &adapters {
        adapter.stop().await;
        if adapter.status() != AdapterStatus::Failed {
            health.mark_stopped(adapter.id());
        }
    }

    // (ii)/(iii) Close both channel writers; drainers finish the backlog.
    orchestrator.close_channels();

    // (iv) Wait for the drainers inside the budget.
    let drain = async {
        let _ = window_drainer.await;
        let _ = archive_drainer.await;
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if tokio::time::timeout(remaining, drain).await.is_err() {
        warn!("sink drainers did not finish inside the shutdown budget");
        on_budget = false;
    }

    // (v) Final archive flush.
    let flush_budget =
        Duration::from_secs(state.config.archive.shutdown_flush_timeout_seconds.max(1));
    match tokio::time::timeout(flush_budget, archive.flush_all()).await {
        Ok(written) => info!(records = written, "final archive flush complete"),
        Err(_) => {
            warn!("final archive flush exceeded its budget, partition data may be lost");
            on_budget = false;
        }
    }

    // (vi) Dispose maintenance tasks and the API server.
    let _ = shutdown_tx.send(true);
    cleanup_task.abort();
    sweep_task.abort();
    server_task.abort();

    if on_budget {
        info!("QuoteMesh shut down complete.");
        0
    } else {
        warn!("QuoteMesh shut down past budget");
        2
    }
}
