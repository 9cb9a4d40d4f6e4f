// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only state endpoints plus operator commands. Public: /health.
// Everything else requires a valid Bearer token via the `AuthBearer`
// extractor. Operator commands flow through the same position-manager and
// gate paths as autonomous actions.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::api::ApiContext;
use crate::types::TradingMode;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared context.
pub fn router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Read-only (authenticated) ───────────────────────────────
        .route("/status", get(status))
        .route("/positions", get(positions))
        .route("/orders", get(orders))
        .route("/opportunities", get(opportunities))
        .route("/decisions", get(decisions))
        .route("/trades", get(trades))
        // ── Operator commands (authenticated) ───────────────────────
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/flatten", post(flatten))
        .route("/close/:symbol", post(close_symbol))
        // ── WebSocket stream ────────────────────────────────────────
        .route("/stream", get(crate::api::ws::stream_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: ctx.state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Read-only endpoints
// =============================================================================

async fn status(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    let regime = ctx.state.regime.current();
    let metrics = ctx.state.trading.metrics();
    Json(serde_json::json!({
        "trading_enabled": ctx.state.trading_enabled(),
        "trading_mode": ctx.state.config.read().trading_mode.to_string(),
        "regime": regime,
        "metrics": metrics,
        "watchlist": ctx.state.scanner.watchlist(),
        "uptime_secs": ctx.state.start_time.elapsed().as_secs(),
    }))
}

async fn positions(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.trading.positions())
}

async fn orders(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.trading.orders())
}

async fn opportunities(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "opportunities": ctx.state.scanner.opportunities(),
        "last_refresh": ctx.state.scanner.last_refresh(),
    }))
}

async fn decisions(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.gate.recent_decisions())
}

async fn trades(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.trading.trade_records(200))
}

// =============================================================================
// Operator commands
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn pause(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.state.set_trading_mode(TradingMode::Paused);
    info!("trading PAUSED via API");
    ctx.state.events.log("warn", "trading paused by operator");

    Json(ControlResponse {
        trading_mode: "Paused".to_string(),
        message: "New entries paused; open positions still managed".to_string(),
    })
}

async fn resume(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    if ctx.state.trading.circuit_breaker_triggered() {
        warn!("resume requested while the circuit breaker is latched");
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "circuit breaker is latched; it resets on the next trading day",
            })),
        )
            .into_response();
    }

    ctx.state.set_trading_mode(TradingMode::Live);
    info!("trading RESUMED via API");
    ctx.state.events.log("info", "trading resumed by operator");

    Json(ControlResponse {
        trading_mode: "Live".to_string(),
        message: "Trading resumed".to_string(),
    })
    .into_response()
}

async fn flatten(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    warn!("FLATTEN ALL requested via API");
    ctx.state.events.log("warn", "flatten-all requested by operator");
    ctx.manager.flatten_all("operator_flatten").await;

    Json(serde_json::json!({
        "message": "flatten submitted",
        "open_positions": ctx.state.trading.open_position_count(),
    }))
}

async fn close_symbol(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    info!(symbol = %symbol, "close requested via API");

    match ctx.manager.close_symbol(&symbol, "operator_close").await {
        Ok(()) => Json(serde_json::json!({
            "message": format!("{symbol} close submitted"),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
