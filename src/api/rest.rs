// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public endpoints:
//   GET /health              — process + subsystem health (ground truth for
//                              partial outages)
//   GET /api/signals/active  — open entry signals with ages
//   GET /api/stats           — pipeline counters for dashboards and tests
//   GET /api/ws              — the push WebSocket (handled in api::ws)
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::ws::frame_snapshot;
use crate::app_state::AppState;
use crate::market_data::normalize::normalize_symbol;
use crate::orchestrator::ChannelStats;
use crate::signals::ActiveSignal;
use crate::types::{ExchangeId, WindowKey};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/signals/active", get(active_signals))
        .route("/api/stats", get(stats))
        .route("/api/window", get(window_snapshot))
        .route("/api/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct MemoryInfo {
    working_set_mb: u64,
}

#[derive(Serialize)]
struct RollingWindowInfo {
    active_windows: usize,
    total_samples: usize,
    evicted_windows: u64,
}

#[derive(Serialize)]
struct ChannelsInfo {
    archive: ChannelStats,
    window: ChannelStats,
}

#[derive(Serialize)]
struct ServicesInfo {
    rolling_window: RollingWindowInfo,
    channels: ChannelsInfo,
    exchanges: HashMap<&'static str, String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    memory: MemoryInfo,
    services: ServicesInfo,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_stats = state.store.stats();
    let orch_stats = state.orchestrator.stats();
    let exchanges = state
        .health
        .snapshot()
        .into_iter()
        .map(|(ex, st)| (ex.as_str(), st.to_string()))
        .collect();

    Json(HealthResponse {
        status: state.status_str(),
        uptime_seconds: state.uptime_seconds(),
        memory: MemoryInfo {
            working_set_mb: AppState::working_set_mb(),
        },
        services: ServicesInfo {
            rolling_window: RollingWindowInfo {
                active_windows: store_stats.active_windows,
                total_samples: store_stats.total_samples,
                evicted_windows: store_stats.evicted_windows,
            },
            channels: ChannelsInfo {
                archive: orch_stats.archive_channel,
                window: orch_stats.window_channel,
            },
            exchanges,
        },
    })
}

// =============================================================================
// Active signals
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActiveSignalDto {
    symbol: String,
    deviation: f64,
    direction: String,
    cheap_exchange: String,
    expensive_exchange: String,
    /// Entry time, UNIX milliseconds.
    timestamp: i64,
    age_ms: i64,
}

fn signal_dto(active: &ActiveSignal) -> ActiveSignalDto {
    ActiveSignalDto {
        symbol: active.signal.symbol.clone(),
        deviation: active.signal.deviation_pct,
        direction: active.signal.direction.to_string(),
        cheap_exchange: active.signal.cheap_exchange.to_string(),
        expensive_exchange: active.signal.rich_exchange.to_string(),
        timestamp: active.signal.issued_at.timestamp_millis(),
        age_ms: active.age_ms,
    }
}

async fn active_signals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let signals: Vec<ActiveSignalDto> = state
        .detector
        .active_signals()
        .iter()
        .map(signal_dto)
        .collect();
    let count = signals.len();
    Json(serde_json::json!({ "signals": signals, "count": count }))
}

// =============================================================================
// Window snapshot (pull-side view of one rolling window)
// =============================================================================

#[derive(Deserialize)]
struct WindowQuery {
    symbol: String,
    exchange1: String,
    exchange2: String,
}

/// Resolve query parameters to a canonical window key. Accepts any symbol
/// spelling the normalizer accepts and any exchange-name alias.
fn parse_window_query(query: &WindowQuery) -> Option<WindowKey> {
    let ex1 = ExchangeId::parse(&query.exchange1)?;
    let ex2 = ExchangeId::parse(&query.exchange2)?;
    if ex1 == ex2 {
        return None;
    }
    let symbol = normalize_symbol(&query.symbol)?;
    Some(WindowKey::canonical(ex1, ex2, symbol))
}

async fn window_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let Some(key) = parse_window_query(&query) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "unknown exchange or symbol" })),
        )
            .into_response();
    };

    let samples = state.store.get_window(&key);
    if samples.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no window for that key" })),
        )
            .into_response();
    }
    Json(frame_snapshot(&key, &samples)).into_response()
}

// =============================================================================
// Pipeline stats
// =============================================================================

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "orchestrator": state.orchestrator.stats(),
        "rolling_window": state.store.stats(),
        "deviation": state.deviation.stats(),
        "signals": state.detector.stats(),
        "archive": state.archive.stats(),
        "push": state.push.stats(),
    }))
}
