// =============================================================================
// Central Application State — Meridian Trading Engine
// =============================================================================
//
// The single source of truth for the entire engine. `TradingState` owns the
// position/order/features/metrics maps; nothing else holds mutable trading
// data. `AppState` ties the shared subsystems together and builds the
// snapshot served to the dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for all mutable shared collections.
//   - Arc wrappers for subsystem engines with their own interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::events::EventBus;
use crate::market_data::{BarStore, Features};
use crate::market_time;
use crate::regime::{RegimeSensor, RegimeState};
use crate::scanner::OpportunityScanner;
use crate::types::{Side, TradingMode};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of closed trade records kept in memory.
const MAX_TRADE_RECORDS: usize = 500;
/// Bars retained per cached series.
const BAR_RETENTION: usize = 600;

// =============================================================================
// Entities
// =============================================================================

/// One open position. Created on first fill, mutated by the position
/// manager, destroyed on flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub side: Side,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub market_value: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub entry_time: DateTime<Utc>,
    /// Quantity at entry, before any partial exits.
    pub original_qty: f64,
    /// Ladder rungs already taken ("2R", "3R", "4R"). Persisted so a restart
    /// does not double-take a rung.
    pub partials_taken: Vec<String>,
    pub trailing_active: bool,
}

impl Position {
    /// Initial per-share risk, when the protective stop is known.
    pub fn initial_risk_per_share(&self) -> Option<f64> {
        let stop = self.stop_loss?;
        let risk = (self.avg_entry_price - stop).abs();
        if risk > 0.0 {
            Some(risk)
        } else {
            None
        }
    }

    /// Current profit in R units (negative when under water).
    pub fn r_multiple(&self) -> Option<f64> {
        let risk = self.initial_risk_per_share()?;
        let profit = self.side.direction() * (self.current_price - self.avg_entry_price);
        Some(profit / risk)
    }
}

/// One order as the engine tracks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: String,
    pub status: String,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Parent order id tying bracket siblings into one logical trade.
    pub linkage: Option<String>,
}

/// Account-level aggregates, refreshed each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub day_pnl: f64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub wins: u32,
    pub losses: u32,
    pub total_trades: u32,
    pub open_positions: u32,
    pub max_positions: u32,
    pub circuit_breaker_triggered: bool,
}

impl Metrics {
    fn new(max_positions: u32) -> Self {
        Self {
            equity: 0.0,
            cash: 0.0,
            buying_power: 0.0,
            day_pnl: 0.0,
            total_pnl: 0.0,
            win_rate: 0.0,
            profit_factor: 0.0,
            wins: 0,
            losses: 0,
            total_trades: 0,
            open_positions: 0,
            max_positions,
            circuit_breaker_triggered: false,
        }
    }
}

/// A completed trade (full exit or an individual partial).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub reason: String,
    pub client_order_id: String,
    pub r_multiple: Option<f64>,
}

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

// =============================================================================
// Per-symbol serialization
// =============================================================================

/// Registry of per-symbol async mutexes. Within one symbol the pipeline
/// (feature update, signal evaluation, order submission, protection audit)
/// is serialized by holding that symbol's lock; cross-symbol work
/// interleaves freely.
pub struct SymbolLocks {
    locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SymbolLocks {
    fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// The mutex for `symbol`, created on first use.
    pub fn for_symbol(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.locks.read().get(symbol) {
            return lock.clone();
        }
        let mut locks = self.locks.write();
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// =============================================================================
// TradingState
// =============================================================================

/// Guarded maps of positions, orders, features, and metrics. All mutation
/// flows through these methods; components never hold the raw maps.
pub struct TradingState {
    positions: RwLock<HashMap<String, Position>>,
    orders: RwLock<HashMap<String, Order>>,
    features: RwLock<HashMap<String, Features>>,
    metrics: RwLock<Metrics>,
    trades: RwLock<Vec<TradeRecord>>,
    /// Eastern trading date the day counters belong to.
    day_date: RwLock<String>,
    /// Realized PnL accumulated today via confirmed exits only.
    day_realized: RwLock<f64>,
}

impl TradingState {
    fn new(max_positions: u32) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            features: RwLock::new(HashMap::new()),
            metrics: RwLock::new(Metrics::new(max_positions)),
            trades: RwLock::new(Vec::new()),
            day_date: RwLock::new(market_time::trading_date(Utc::now())),
            day_realized: RwLock::new(0.0),
        }
    }

    // ── Positions ───────────────────────────────────────────────────────

    pub fn upsert_position(&self, position: Position) {
        let mut positions = self.positions.write();
        positions.insert(position.symbol.clone(), position);
        self.metrics.write().open_positions = positions.len() as u32;
    }

    pub fn remove_position(&self, symbol: &str) -> Option<Position> {
        let mut positions = self.positions.write();
        let removed = positions.remove(symbol);
        self.metrics.write().open_positions = positions.len() as u32;
        removed
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.read().len()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    /// Apply a closure to one position under the write lock.
    pub fn with_position_mut<F, R>(&self, symbol: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Position) -> R,
    {
        let mut positions = self.positions.write();
        positions.get_mut(symbol).map(f)
    }

    // ── Orders ──────────────────────────────────────────────────────────

    pub fn upsert_order(&self, order: Order) {
        self.orders.write().insert(order.order_id.clone(), order);
    }

    pub fn remove_order(&self, order_id: &str) -> Option<Order> {
        self.orders.write().remove(order_id)
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.read().values().cloned().collect()
    }

    /// Replace the full working-order map from a broker reconcile pass.
    pub fn replace_orders(&self, orders: Vec<Order>) {
        let mut map = self.orders.write();
        map.clear();
        for order in orders {
            map.insert(order.order_id.clone(), order);
        }
    }

    // ── Features ────────────────────────────────────────────────────────

    pub fn update_features(&self, features: Features) {
        self.features
            .write()
            .insert(features.symbol.clone(), features);
    }

    pub fn features(&self, symbol: &str) -> Option<Features> {
        self.features.read().get(symbol).cloned()
    }

    pub fn all_features(&self) -> Vec<Features> {
        self.features.read().values().cloned().collect()
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    pub fn metrics(&self) -> Metrics {
        self.metrics.read().clone()
    }

    pub fn update_account(&self, equity: f64, cash: f64, buying_power: f64) {
        let mut m = self.metrics.write();
        m.equity = equity;
        m.cash = cash;
        m.buying_power = buying_power;
    }

    pub fn set_max_positions(&self, max_positions: u32) {
        self.metrics.write().max_positions = max_positions;
    }

    /// Latch the circuit breaker. Existing positions keep being managed;
    /// the risk gate refuses new entries while the latch is set.
    pub fn trip_circuit_breaker(&self) {
        let mut m = self.metrics.write();
        if !m.circuit_breaker_triggered {
            warn!("CIRCUIT BREAKER TRIPPED — new entries disabled");
        }
        m.circuit_breaker_triggered = true;
    }

    pub fn reset_circuit_breaker(&self) {
        self.metrics.write().circuit_breaker_triggered = false;
        info!("circuit breaker reset");
    }

    pub fn circuit_breaker_triggered(&self) -> bool {
        self.metrics.read().circuit_breaker_triggered
    }

    // ── Daily realized PnL ──────────────────────────────────────────────

    /// Record a confirmed exit: rolls the daily counter on an Eastern date
    /// change, updates win/loss aggregates, and appends the trade record.
    pub fn record_trade(&self, record: TradeRecord) {
        self.maybe_roll_day(record.exit_time);

        {
            let mut realized = self.day_realized.write();
            *realized += record.pnl;
        }

        let day_pnl = *self.day_realized.read();

        {
            let mut m = self.metrics.write();
            m.day_pnl = day_pnl;
            m.total_pnl += record.pnl;
            m.total_trades += 1;
            if record.pnl >= 0.0 {
                m.wins += 1;
            } else {
                m.losses += 1;
            }
            if m.total_trades > 0 {
                m.win_rate = m.wins as f64 / m.total_trades as f64;
            }
            m.profit_factor = profit_factor(&self.trades.read(), record.pnl);
        }

        let mut trades = self.trades.write();
        trades.push(record);
        while trades.len() > MAX_TRADE_RECORDS {
            trades.remove(0);
        }
    }

    pub fn day_realized_pnl(&self, now: DateTime<Utc>) -> f64 {
        self.maybe_roll_day(now);
        *self.day_realized.read()
    }

    pub fn trade_records(&self, count: usize) -> Vec<TradeRecord> {
        let trades = self.trades.read();
        trades.iter().rev().take(count).cloned().collect()
    }

    fn maybe_roll_day(&self, now: DateTime<Utc>) {
        let today = market_time::trading_date(now);
        {
            let date = self.day_date.read();
            if *date == today {
                return;
            }
        }
        let mut date = self.day_date.write();
        if *date != today {
            info!(old = %date, new = %today, "trading date rolled — resetting daily PnL");
            *date = today;
            *self.day_realized.write() = 0.0;
            self.metrics.write().day_pnl = 0.0;
        }
    }
}

/// Gross-profit over gross-loss across retained records plus the incoming
/// pnl (the record is appended right after this runs).
fn profit_factor(trades: &[TradeRecord], incoming_pnl: f64) -> f64 {
    let mut gross_profit: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).sum();
    let mut gross_loss: f64 = trades
        .iter()
        .map(|t| t.pnl)
        .filter(|p| *p < 0.0)
        .map(f64::abs)
        .sum();
    if incoming_pnl > 0.0 {
        gross_profit += incoming_pnl;
    } else {
        gross_loss += incoming_pnl.abs();
    }

    if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared application state: configuration, trading state, and the
/// long-lived subsystem handles. Wrapped in `Arc` at startup.
pub struct AppState {
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation; the WS feed uses it to detect changes.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<RuntimeConfig>>,
    pub trading: TradingState,
    pub bars: Arc<BarStore>,
    pub regime: Arc<RegimeSensor>,
    pub scanner: Arc<OpportunityScanner>,
    pub events: EventBus,
    pub symbol_locks: SymbolLocks,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        let max_positions = config.max_positions;
        let scanner = OpportunityScanner::new(config.scanner_refresh_secs, config.scanner_max_symbols);

        Self {
            state_version: AtomicU64::new(1),
            config: Arc::new(RwLock::new(config)),
            trading: TradingState::new(max_positions),
            bars: Arc::new(BarStore::new(BAR_RETENTION)),
            regime: Arc::new(RegimeSensor::new()),
            scanner: Arc::new(scanner),
            events: EventBus::new(),
            symbol_locks: SymbolLocks::new(),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Trading mode ────────────────────────────────────────────────────

    /// Whether the gate may approve new entries right now.
    pub fn trading_enabled(&self) -> bool {
        let mode = self.config.read().trading_mode;
        mode == TradingMode::Live && !self.trading.circuit_breaker_triggered()
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        self.config.write().trading_mode = mode;
        self.increment_version();
        info!(mode = %mode, "trading mode changed");
    }

    /// Emergency halt: latch the breaker and flip the mode.
    pub fn disable_trading(&self) {
        self.trading.trip_circuit_breaker();
        self.config.write().trading_mode = TradingMode::Halted;
        self.increment_version();
    }

    // ── Error Logging ───────────────────────────────────────────────────

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Complete serialisable snapshot for `GET /status` verbose mode and
    /// the WS `snapshot` frame.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.config.read();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            trading_enabled: config.trading_mode == TradingMode::Live
                && !self.trading.circuit_breaker_triggered(),
            trading_mode: config.trading_mode.to_string(),
            regime: self.regime.current(),
            metrics: self.trading.metrics(),
            positions: self.trading.positions(),
            orders: self.trading.orders(),
            watchlist: self.scanner.watchlist(),
            recent_errors: self.recent_errors.read().clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("version", &self.current_state_version())
            .field("open_positions", &self.trading.open_position_count())
            .finish()
    }
}

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub trading_enabled: bool,
    pub trading_mode: String,
    pub regime: RegimeState,
    pub metrics: Metrics,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub watchlist: Vec<String>,
    pub recent_errors: Vec<ErrorRecord>,
    pub uptime_secs: u64,
}
