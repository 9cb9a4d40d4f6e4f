// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// The engine starts in Paused mode for safety. An operator must explicitly
// resume trading via `POST /resume` after checking the dashboard.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod config;
mod engine;
mod events;
mod execution;
mod indicators;
mod market_data;
mod market_time;
mod persistence;
mod position_manager;
mod protection;
mod regime;
mod risk;
mod scanner;
mod strategy;
mod trend_filter;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::app_state::AppState;
use crate::broker::BrokerClient;
use crate::config::RuntimeConfig;
use crate::engine::TradingEngine;
use crate::execution::OrderExecutor;
use crate::persistence::PersistenceGateway;
use crate::position_manager::PositionManager;
use crate::risk::RiskGate;
use crate::types::TradingMode;

const CONFIG_PATH: &str = "meridian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Intraday Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: never auto-resume after a restart.
    config.trading_mode = TradingMode::Paused;

    // Invalid configuration refuses to start rather than trading with
    // weakened protection.
    config.validate()?;

    // Watchlist override from the environment.
    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        config.watchlist_symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(
        watchlist = ?config.watchlist_symbols,
        dynamic = config.use_dynamic_watchlist,
        max_positions = config.max_positions,
        "configuration ready (starting PAUSED)"
    );

    // ── 2. Broker client (fatal without credentials) ─────────────────────
    let client = Arc::new(BrokerClient::from_env()?);

    // ── 3. Shared state & subsystems ─────────────────────────────────────
    let state = Arc::new(AppState::new(config));
    let gate = Arc::new(RiskGate::new());
    let manager = Arc::new(PositionManager::new(
        client.clone(),
        state.clone(),
        gate.clone(),
    ));
    let executor = Arc::new(OrderExecutor::new(client.clone(), state.clone()));

    // ── 4. Persistence (non-fatal when absent) ───────────────────────────
    let persistence = match persistence::connect_from_env().await {
        Ok(pool) => {
            if let Err(e) = persistence::migrate(&pool).await {
                warn!(error = %e, "schema migration failed — running without persistence");
                PersistenceGateway::start(None)
            } else {
                info!("persistence connected");
                PersistenceGateway::start(Some(pool))
            }
        }
        Err(e) => {
            warn!(error = %e, "no database configured — running without persistence");
            PersistenceGateway::start(None)
        }
    };

    // Snapshot the active parameters so post-mortems know what was live.
    persistence.record_parameters(serde_json::to_value(&*state.config.read())?);

    // ── 5. API server ────────────────────────────────────────────────────
    let api_ctx = ApiContext {
        state: state.clone(),
        manager: manager.clone(),
        gate: gate.clone(),
    };
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let bind_addr_log = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_ctx);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });
    info!(addr = %bind_addr_log, "API server spawned");

    // ── 6. Engine ────────────────────────────────────────────────────────
    let engine = Arc::new(TradingEngine::new(
        state.clone(),
        client,
        gate,
        manager,
        executor,
        persistence,
    ));
    engine.start().await?;

    info!("all subsystems running — press ctrl-c to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    engine.shutdown();
    // Let in-flight iterations finish their broker round-trips.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian shut down complete");
    Ok(())
}
