// =============================================================================
// Trading Engine — lifecycle owner and loop scheduler
// =============================================================================
//
// On start: hydrate TradingState from the broker (positions + open orders)
// and persistence (partial-profit flags so a restart does not double-dip),
// then run three cooperative loops:
//
//   scanner loop   (long cadence)     regime, watchlist, daily bars
//   signal loop    (short cadence)    features -> strategy -> gate -> executor
//   position loop  (shortest cadence) reconcile, audit, ladders, EOD
//
// Loops are independent and cancel-safe: a failed iteration is logged and
// the next tick runs. Only circuit-breaker-worthy conditions (inside the
// position manager) flip global state. Shutdown is a watch signal; each loop
// finishes its in-flight iteration before exiting.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broker::BrokerClient;
use crate::events::EngineEvent;
use crate::execution::{ExecutionOutcome, OrderExecutor};
use crate::market_data::{BarKey, FeatureEngine, Timeframe};
use crate::persistence::PersistenceGateway;
use crate::position_manager::PositionManager;
use crate::risk::{GateInput, RiskGate};
use crate::scanner::{score_symbol, universe, Opportunity};
use crate::strategy::CrossoverStrategy;
use crate::trend_filter;

/// Index symbol driving the regime classification.
const REGIME_INDEX: &str = "SPY";
/// Symbols fetched per multi-symbol bar request.
const BAR_FETCH_CHUNK: usize = 50;
/// Minute bars requested per refresh.
const MINUTE_BAR_LIMIT: u32 = 120;
/// Daily bars requested per refresh.
const DAILY_BAR_LIMIT: u32 = 60;

pub struct TradingEngine {
    state: Arc<AppState>,
    client: Arc<BrokerClient>,
    gate: Arc<RiskGate>,
    manager: Arc<PositionManager>,
    executor: Arc<OrderExecutor>,
    persistence: PersistenceGateway,
    shutdown_tx: watch::Sender<bool>,
    /// Trade records already pushed to persistence.
    persisted_trades: std::sync::atomic::AtomicU32,
    /// Symbols whose positions were persisted on the previous sync.
    persisted_symbols: parking_lot::Mutex<std::collections::HashSet<String>>,
}

impl TradingEngine {
    pub fn new(
        state: Arc<AppState>,
        client: Arc<BrokerClient>,
        gate: Arc<RiskGate>,
        manager: Arc<PositionManager>,
        executor: Arc<OrderExecutor>,
        persistence: PersistenceGateway,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state,
            client,
            gate,
            manager,
            executor,
            persistence,
            shutdown_tx,
            persisted_trades: std::sync::atomic::AtomicU32::new(0),
            persisted_symbols: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Hydrate state and spawn the three loops. Returns once the loops are
    /// running; they stop when [`shutdown`] is called.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.hydrate().await?;

        let engine = self.clone();
        tokio::spawn(async move { engine.scanner_loop().await });

        let engine = self.clone();
        tokio::spawn(async move { engine.signal_loop().await });

        let engine = self.clone();
        tokio::spawn(async move { engine.position_loop().await });

        info!("trading engine started — scanner, signal, and position loops running");
        Ok(())
    }

    /// Signal every loop to stop after its current iteration.
    pub fn shutdown(&self) {
        info!("engine shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Pull existing truth from the broker and persistence before trading.
    async fn hydrate(&self) -> anyhow::Result<()> {
        info!("hydrating state from broker");
        self.manager.reconcile().await?;

        // Partial-profit flags survive restarts via the positions table.
        match crate::persistence::connect_from_env().await {
            Ok(pool) => match crate::persistence::load_partial_flags(&pool).await {
                Ok(flags) if !flags.is_empty() => {
                    info!(symbols = flags.len(), "hydrated partial-profit flags");
                    self.manager.hydrate_partials(flags);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "partial-flag hydration failed"),
            },
            Err(e) => {
                debug!(error = %e, "no persistence for hydration — starting clean");
            }
        }

        let open = self.state.trading.open_position_count();
        let orders = self.state.trading.orders().len();
        info!(positions = open, orders, "hydration complete");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scanner loop
    // -------------------------------------------------------------------------

    /// Long-cadence loop: regime refresh, daily bars, dynamic watchlist.
    async fn scanner_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx();
        let secs = self.state.config.read().scan_interval_secs;
        let mut ticker = interval(Duration::from_secs(secs.max(1)));

        info!(interval_secs = secs, "scanner loop starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!(error = %e, "scan iteration failed");
                        self.state.scanner.mark_failed();
                    }
                }
                _ = shutdown.changed() => {
                    info!("scanner loop stopped");
                    return;
                }
            }
        }
    }

    async fn scan_once(&self) -> anyhow::Result<()> {
        let config = self.state.config.read().clone();

        // ── 1. Regime: index + basket daily bars ────────────────────────
        let mut basket_symbols: Vec<String> = universe::INDICES
            .iter()
            .chain(universe::MEGA_CAP_TECH.iter())
            .map(|s| s.to_string())
            .collect();
        if !basket_symbols.contains(&REGIME_INDEX.to_string()) {
            basket_symbols.push(REGIME_INDEX.to_string());
        }

        let daily = self
            .client
            .get_bars(&basket_symbols, Timeframe::Day, None, None, DAILY_BAR_LIMIT)
            .await?;

        for (symbol, bars) in &daily {
            self.state
                .bars
                .replace(BarKey::daily(symbol), bars.clone());
        }

        if let Some(index_daily) = daily.get(REGIME_INDEX) {
            let basket: Vec<_> = daily
                .iter()
                .filter(|(s, _)| s.as_str() != REGIME_INDEX)
                .map(|(_, bars)| bars.clone())
                .collect();
            if self
                .state
                .regime
                .update_from_bars(index_daily, &basket)
                .is_none()
            {
                debug!("regime inputs not ready (short index history)");
            }
        }

        // ── 2. Watchlist refresh ────────────────────────────────────────
        let now = Utc::now();
        if config.use_dynamic_watchlist && self.state.scanner.should_refresh(now) {
            self.refresh_watchlist(&config).await?;
        } else if !config.use_dynamic_watchlist {
            // Static list: keep the scanner serving the configured symbols.
            let static_opps: Vec<Opportunity> = Vec::new();
            if self.state.scanner.last_refresh().is_none() {
                self.state.scanner.ingest(static_opps, now);
            }
        }

        // ── 3. Daily bars for current watchlist members ────────────────
        let watchlist = self.current_watchlist(&config);
        if !watchlist.is_empty() {
            let daily = self
                .client
                .get_bars(&watchlist, Timeframe::Day, None, None, DAILY_BAR_LIMIT)
                .await?;
            for (symbol, bars) in daily {
                self.state.bars.replace(BarKey::daily(&symbol), bars);
            }
        }

        self.state.increment_version();
        Ok(())
    }

    /// Score the full universe and emit the top names as the watchlist.
    async fn refresh_watchlist(&self, config: &crate::config::RuntimeConfig) -> anyhow::Result<()> {
        let candidates = universe::full();
        let regime_label = self.state.regime.current().regime.to_string();
        let mut scored: Vec<Opportunity> = Vec::new();

        for chunk in candidates.chunks(BAR_FETCH_CHUNK) {
            let chunk_vec: Vec<String> = chunk.to_vec();
            let minute = match self
                .client
                .get_bars(&chunk_vec, Timeframe::Minute, None, None, MINUTE_BAR_LIMIT)
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(error = %e, "scan chunk failed — skipping");
                    continue;
                }
            };

            for (symbol, bars) in minute {
                if bars.len() < FeatureEngine::min_bars() {
                    continue;
                }
                self.state
                    .bars
                    .replace(BarKey::minute(&symbol), bars.clone());

                let Some(features) = FeatureEngine::compute(
                    &symbol,
                    &bars,
                    config.ema_short,
                    config.ema_long,
                    &regime_label,
                    &config.confidence_weights,
                ) else {
                    continue;
                };

                let daily_aligned = trend_filter::daily_aligned_for_long(&self.state.bars, &symbol)
                    .unwrap_or(false);

                if let Some(opportunity) = score_symbol(&features, &bars, daily_aligned) {
                    scored.push(opportunity);
                }
            }
        }

        info!(scored = scored.len(), "universe scan complete");
        self.state.scanner.ingest(scored, Utc::now());
        Ok(())
    }

    fn current_watchlist(&self, config: &crate::config::RuntimeConfig) -> Vec<String> {
        if config.use_dynamic_watchlist {
            let dynamic = self.state.scanner.watchlist();
            if !dynamic.is_empty() {
                return dynamic;
            }
        }
        config.watchlist_symbols.clone()
    }

    // -------------------------------------------------------------------------
    // Signal loop
    // -------------------------------------------------------------------------

    /// Short-cadence loop: fresh features for the watchlist, strategy, gate,
    /// executor.
    async fn signal_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx();
        let secs = self.state.config.read().signal_interval_secs;
        let mut ticker = interval(Duration::from_secs(secs.max(1)));

        info!(interval_secs = secs, "signal loop starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.signal_once().await {
                        warn!(error = %e, "signal iteration failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("signal loop stopped");
                    return;
                }
            }
        }
    }

    async fn signal_once(&self) -> anyhow::Result<()> {
        let config = self.state.config.read().clone();

        let clock = self.client.get_clock().await?;
        if !clock.is_open {
            debug!("market closed — skipping signal pass");
            return Ok(());
        }

        let watchlist = self.current_watchlist(&config);
        if watchlist.is_empty() {
            return Ok(());
        }

        // One multi-symbol request refreshes every watchlist member's bars.
        let minute = self
            .client
            .get_bars(&watchlist, Timeframe::Minute, None, None, MINUTE_BAR_LIMIT)
            .await?;

        let regime = self.state.regime.current();
        let regime_label = regime.regime.to_string();

        for symbol in &watchlist {
            let Some(bars) = minute.get(symbol) else {
                continue;
            };

            // Per-symbol pipeline is serialized against the position loop.
            let lock = self.state.symbol_locks.for_symbol(symbol);
            let _guard = lock.lock().await;

            self.state
                .bars
                .replace(BarKey::minute(symbol), bars.clone());

            let Some(features) = FeatureEngine::compute(
                symbol,
                bars,
                config.ema_short,
                config.ema_long,
                &regime_label,
                &config.confidence_weights,
            ) else {
                continue;
            };

            self.state.trading.update_features(features.clone());
            self.persistence.record_features(&features);

            let daily_trend = trend_filter::analyze(&self.state.bars, symbol);

            let signal = match CrossoverStrategy::evaluate(&features, daily_trend.as_ref(), &config)
            {
                Ok(signal) => signal,
                Err(rejection) => {
                    debug!(symbol = %symbol, reason = %rejection, "no signal");
                    continue;
                }
            };

            self.state.events.publish(EngineEvent::Signal {
                symbol: symbol.clone(),
                side: signal.side.to_string(),
                confidence: signal.confidence,
                payload: serde_json::to_value(&signal).unwrap_or_default(),
            });

            // Shadow-mode prediction log: the signal and its feature vector,
            // no trading authority.
            self.persistence.record_prediction(
                symbol,
                features.ts,
                serde_json::to_value(&features).unwrap_or_default(),
                signal.side.as_str(),
                signal.confidence / 100.0,
            );

            let metrics = self.state.trading.metrics();
            let account_bp = metrics.buying_power;

            let input = GateInput {
                signal: &signal,
                now: Utc::now(),
                market_open: clock.is_open,
                equity: metrics.equity,
                available_buying_power: account_bp,
                open_positions: metrics.open_positions,
                has_position_for_symbol: self.state.trading.has_position(symbol),
                trading_enabled: self.state.trading_enabled(),
                regime: &regime,
                adx: features.adx,
                volume_ratio: features.volume_ratio,
            };

            let verdict = self.gate.evaluate(&config, &input);
            if !verdict.approved {
                continue;
            }

            match self.executor.execute(&signal, verdict.qty, false).await {
                ExecutionOutcome::Bracketed {
                    filled_qty,
                    filled_avg_price,
                    ..
                } => {
                    self.manager.register_entry(
                        symbol,
                        signal.side,
                        filled_qty,
                        filled_avg_price,
                        signal.initial_stop,
                        signal.take_profit,
                        signal.atr,
                    );
                    self.persistence.record_position_flags(
                        symbol,
                        filled_qty,
                        filled_avg_price,
                        Some(signal.initial_stop),
                        Some(signal.take_profit),
                        Vec::new(),
                    );
                }
                ExecutionOutcome::Rejected { reason } => {
                    warn!(symbol = %symbol, reason = %reason, "entry rejected by broker");
                    self.gate.flag_rejected_this_bar(symbol, Utc::now());
                }
                ExecutionOutcome::Failed { error } => {
                    warn!(symbol = %symbol, error = %error, "entry failed");
                    self.state.push_error(format!("entry {symbol}: {error}"));
                }
                ExecutionOutcome::TimedOut => {
                    info!(symbol = %symbol, "entry timed out without a fill");
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Position loop
    // -------------------------------------------------------------------------

    /// Shortest-cadence loop: reconcile, protect, trail, harvest, flatten.
    async fn position_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx();
        let secs = self.state.config.read().position_interval_secs;
        let mut ticker = interval(Duration::from_secs(secs.max(1)));

        info!(interval_secs = secs, "position loop starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.manager.run_cycle().await;
                    self.sync_persistence();
                }
                _ = shutdown.changed() => {
                    info!("position loop stopped");
                    return;
                }
            }
        }
    }

    /// Push new trade records and current position flags to the gateway.
    fn sync_persistence(&self) {
        use std::sync::atomic::Ordering;

        let metrics = self.state.trading.metrics();
        let already = self.persisted_trades.load(Ordering::Relaxed);
        if metrics.total_trades > already {
            let new_count = (metrics.total_trades - already) as usize;
            for record in self.state.trading.trade_records(new_count) {
                self.persistence.record_trade(&record);
            }
            self.persisted_trades
                .store(metrics.total_trades, Ordering::Relaxed);
        }

        let positions = self.state.trading.positions();
        let current: std::collections::HashSet<String> =
            positions.iter().map(|p| p.symbol.clone()).collect();

        for pos in &positions {
            self.persistence.record_position_flags(
                &pos.symbol,
                pos.qty,
                pos.avg_entry_price,
                pos.stop_loss,
                pos.take_profit,
                pos.partials_taken.clone(),
            );
        }

        // Rows for closed positions are deleted so a restart does not
        // hydrate stale partial flags.
        let mut persisted = self.persisted_symbols.lock();
        for gone in persisted.difference(&current) {
            self.persistence.remove_position(gone);
        }
        *persisted = current;
    }
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine").finish_non_exhaustive()
    }
}
