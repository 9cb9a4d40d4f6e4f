// =============================================================================
// Position Manager — reconcile, protect, trail, harvest, flatten
// =============================================================================
//
// Runs on the shortest loop cadence. Each cycle:
//
//   1. Reconcile: diff broker positions/orders/account against TradingState
//      (the broker is the truth; the engine never assumes its own book).
//   2. Protection audit: every open position must have a working stop. A
//      position naked beyond the grace window gets its stale children
//      cancelled and a fresh stop submitted. A take-profit holding the
//      shares is cancelled first, the stop placed, the take-profit
//      re-placed. Three consecutive audit failures trip the circuit breaker.
//   3. Ladder management: trailing stops and partial profits via
//      `ProtectionState`, trailing capped to the N most profitable names.
//   4. Circuit breaker: daily realized loss beyond the cap disables new
//      entries (existing positions keep being managed).
//   5. EOD flatten at the configured Eastern time; remnant positions below
//      the notional floor are closed during sweeps.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::app_state::{AppState, Order, Position, TradeRecord};
use crate::broker::{BrokerClient, BrokerPosition, OrderRequest};
use crate::events::{EngineEvent, PositionAction};
use crate::execution::{client_order_id, OrderIntent};
use crate::market_time;
use crate::protection::{protective_stop, ProtectionAction, ProtectionState};
use crate::risk::RiskGate;
use crate::types::{OrderType, Side};

/// Consecutive protection-audit failures that trip the circuit breaker.
const AUDIT_FAILURE_LIMIT: u32 = 3;

pub struct PositionManager {
    client: Arc<BrokerClient>,
    state: Arc<AppState>,
    gate: Arc<RiskGate>,
    /// Per-symbol ladder/trailing state.
    protection: RwLock<HashMap<String, ProtectionState>>,
    /// When each symbol was first observed without a working stop.
    naked_since: RwLock<HashMap<String, Instant>>,
    audit_failures: AtomicU32,
}

impl PositionManager {
    pub fn new(client: Arc<BrokerClient>, state: Arc<AppState>, gate: Arc<RiskGate>) -> Self {
        Self {
            client,
            state,
            gate,
            protection: RwLock::new(HashMap::new()),
            naked_since: RwLock::new(HashMap::new()),
            audit_failures: AtomicU32::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// One full management cycle. Every stage is independent; a failure in
    /// one is logged and the next still runs.
    pub async fn run_cycle(&self) {
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "reconcile failed");
            self.state.push_error(format!("reconcile: {e}"));
        }

        match self.audit_protection().await {
            Ok(()) => {
                self.audit_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.audit_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(error = %e, failures, "protection audit failed");
                self.state.push_error(format!("protection audit: {e}"));
                if failures >= AUDIT_FAILURE_LIMIT {
                    error!("protection audit failed {failures} times — tripping circuit breaker");
                    self.state.disable_trading();
                }
            }
        }

        self.manage_ladders().await;
        self.check_circuit_breaker();
        self.maybe_eod_flatten().await;
        self.cleanup_remnants().await;
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Pull account, positions, and open orders from the broker and fold
    /// them into TradingState, emitting opened/closed/pnl events.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let account = self.client.get_account().await?;
        self.state.trading.update_account(
            account.equity,
            account.cash,
            account.available_buying_power(),
        );

        let broker_positions = self.client.list_positions().await?;
        let open_orders = self.client.list_orders(Some("open")).await?;

        // Mirror working orders.
        let orders: Vec<Order> = open_orders
            .iter()
            .filter(|o| o.is_working())
            .map(|o| Order {
                order_id: o.id.clone(),
                client_order_id: o.client_order_id.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                qty: o.qty,
                order_type: o.order_type.clone(),
                status: o.status.clone(),
                filled_qty: o.filled_qty,
                filled_avg_price: o.filled_avg_price,
                limit_price: o.limit_price,
                stop_price: o.stop_price,
                submitted_at: o.submitted_at,
                linkage: None,
            })
            .collect();
        self.state.trading.replace_orders(orders);

        let broker_by_symbol: HashMap<&str, &BrokerPosition> = broker_positions
            .iter()
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        // New and updated positions.
        for bp in &broker_positions {
            match self.state.trading.position(&bp.symbol) {
                None => self.adopt_position(bp),
                Some(_) => {
                    self.state.trading.with_position_mut(&bp.symbol, |pos| {
                        pos.qty = bp.qty;
                        pos.avg_entry_price = bp.avg_entry_price;
                        pos.current_price = bp.current_price;
                        pos.market_value = bp.market_value;
                        pos.unrealized_pnl = bp.unrealized_pl;
                        pos.unrealized_pnl_pct = bp.unrealized_plpc * 100.0;
                    });
                    if let Some(pos) = self.state.trading.position(&bp.symbol) {
                        self.state.events.publish(EngineEvent::Position {
                            action: PositionAction::PnlUpdate,
                            symbol: bp.symbol.clone(),
                            payload: serde_json::to_value(&pos).unwrap_or_default(),
                        });
                    }
                }
            }
        }

        // Positions the broker no longer has are closed.
        let tracked = self.state.trading.positions();
        for pos in tracked {
            if !broker_by_symbol.contains_key(pos.symbol.as_str()) {
                self.finalize_close(&pos, pos.current_price, "closed_at_broker");
            }
        }

        self.state.events.publish(EngineEvent::Metrics {
            payload: serde_json::to_value(self.state.trading.metrics()).unwrap_or_default(),
        });
        self.state.increment_version();
        Ok(())
    }

    /// A position appeared at the broker that the engine was not tracking
    /// (fresh fill, or pre-existing on restart). Adopt it and build its
    /// ladder state from whatever protection is already working.
    fn adopt_position(&self, bp: &BrokerPosition) {
        let orders = self.state.trading.orders();
        let stop_price =
            find_working_stop(&orders, &bp.symbol, bp.side).and_then(|o| o.stop_price);

        let atr = self
            .state
            .trading
            .features(&bp.symbol)
            .and_then(|f| f.atr)
            .unwrap_or(0.0);
        let config = self.state.config.read().clone();

        let effective_stop = stop_price
            .unwrap_or_else(|| protective_stop(bp.side, bp.avg_entry_price, atr, &config));

        let position = Position {
            symbol: bp.symbol.clone(),
            qty: bp.qty,
            side: bp.side,
            avg_entry_price: bp.avg_entry_price,
            current_price: bp.current_price,
            unrealized_pnl: bp.unrealized_pl,
            unrealized_pnl_pct: bp.unrealized_plpc * 100.0,
            market_value: bp.market_value,
            stop_loss: Some(effective_stop),
            take_profit: None,
            entry_time: Utc::now(),
            original_qty: bp.qty,
            partials_taken: Vec::new(),
            trailing_active: false,
        };

        info!(
            symbol = %bp.symbol,
            qty = bp.qty,
            side = %bp.side,
            entry = bp.avg_entry_price,
            stop = effective_stop,
            "position adopted from broker"
        );

        self.protection.write().insert(
            bp.symbol.clone(),
            ProtectionState::new(bp.side, bp.avg_entry_price, effective_stop, atr),
        );

        self.state.events.publish(EngineEvent::Position {
            action: PositionAction::Opened,
            symbol: bp.symbol.clone(),
            payload: serde_json::to_value(&position).unwrap_or_default(),
        });
        self.state.trading.upsert_position(position);
    }

    /// Register a position the executor just opened, seeding the ladder
    /// state from the signal's own levels.
    pub fn register_entry(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        fill_price: f64,
        initial_stop: f64,
        take_profit: f64,
        atr: f64,
    ) {
        let position = Position {
            symbol: symbol.to_string(),
            qty,
            side,
            avg_entry_price: fill_price,
            current_price: fill_price,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            market_value: qty * fill_price,
            stop_loss: Some(initial_stop),
            take_profit: Some(take_profit),
            entry_time: Utc::now(),
            original_qty: qty,
            partials_taken: Vec::new(),
            trailing_active: false,
        };

        self.protection.write().insert(
            symbol.to_string(),
            ProtectionState::new(side, fill_price, initial_stop, atr),
        );

        self.state.events.publish(EngineEvent::Position {
            action: PositionAction::Opened,
            symbol: symbol.to_string(),
            payload: serde_json::to_value(&position).unwrap_or_default(),
        });
        self.state.trading.upsert_position(position);
        self.state.increment_version();
    }

    /// Re-hydrate partial-profit flags persisted before a restart.
    pub fn hydrate_partials(&self, flags: HashMap<String, Vec<String>>) {
        let mut protection = self.protection.write();
        for (symbol, taken) in flags {
            self.state.trading.with_position_mut(&symbol, |pos| {
                pos.partials_taken = taken.clone();
            });
            if let Some(ps) = protection.get_mut(&symbol) {
                for rung in taken {
                    ps.mark_partial_taken(&rung);
                }
            }
        }
    }

    /// Book the close of a position: trade record, cooldown accounting,
    /// ladder cleanup, events.
    fn finalize_close(&self, pos: &Position, exit_price: f64, reason: &str) {
        let direction = pos.side.direction();
        let pnl = direction * (exit_price - pos.avg_entry_price) * pos.qty;
        let pnl_pct = if pos.avg_entry_price > 0.0 {
            direction * (exit_price - pos.avg_entry_price) / pos.avg_entry_price * 100.0
        } else {
            0.0
        };
        let now = Utc::now();

        let r_multiple = self
            .protection
            .read()
            .get(&pos.symbol)
            .map(|ps| ps.r_at(exit_price));

        let record = TradeRecord {
            symbol: pos.symbol.clone(),
            side: pos.side,
            qty: pos.qty,
            entry_price: pos.avg_entry_price,
            exit_price,
            entry_time: pos.entry_time,
            exit_time: now,
            pnl,
            pnl_pct,
            reason: reason.to_string(),
            client_order_id: client_order_id(&pos.symbol, OrderIntent::Flatten, now),
            r_multiple,
        };

        info!(
            symbol = %pos.symbol,
            qty = pos.qty,
            exit_price,
            pnl = format!("{pnl:.2}"),
            r = ?r_multiple,
            reason,
            "position closed"
        );

        let config = self.state.config.read().clone();
        self.gate.record_exit(&config, &pos.symbol, pnl, now);
        self.state.trading.record_trade(record);
        self.state.trading.remove_position(&pos.symbol);
        self.protection.write().remove(&pos.symbol);
        self.naked_since.write().remove(&pos.symbol);

        self.state.events.publish(EngineEvent::Position {
            action: PositionAction::Closed,
            symbol: pos.symbol.clone(),
            payload: serde_json::json!({
                "symbol": pos.symbol,
                "exit_price": exit_price,
                "pnl": pnl,
                "reason": reason,
            }),
        });
        self.state.increment_version();
    }

    // -------------------------------------------------------------------------
    // Protection audit
    // -------------------------------------------------------------------------

    /// Ensure every open position has a working stop. Rebuild protection
    /// for anything naked beyond the grace window.
    pub async fn audit_protection(&self) -> anyhow::Result<()> {
        let config = self.state.config.read().clone();
        let positions = self.state.trading.positions();
        let orders = self.state.trading.orders();

        for pos in &positions {
            let has_stop = find_working_stop(&orders, &pos.symbol, pos.side).is_some();

            if has_stop {
                self.naked_since.write().remove(&pos.symbol);
                continue;
            }

            // Start (or continue) the naked clock.
            let naked_for = {
                let mut naked = self.naked_since.write();
                let since = naked.entry(pos.symbol.clone()).or_insert_with(Instant::now);
                since.elapsed()
            };

            if naked_for.as_secs() < config.protection_grace_secs {
                debug!(
                    symbol = %pos.symbol,
                    naked_secs = naked_for.as_secs(),
                    grace = config.protection_grace_secs,
                    "position without stop — inside grace window"
                );
                continue;
            }

            warn!(
                symbol = %pos.symbol,
                naked_secs = naked_for.as_secs(),
                "position naked beyond grace window — rebuilding protection"
            );
            // Bracket-sibling surgery is atomic per symbol.
            let lock = self.state.symbol_locks.for_symbol(&pos.symbol);
            let _guard = lock.lock().await;
            self.rebuild_protection(pos, &orders, &config).await?;
            self.naked_since.write().remove(&pos.symbol);
        }

        Ok(())
    }

    /// Cancel stale children and place a fresh stop (re-placing a
    /// take-profit that was holding the shares).
    async fn rebuild_protection(
        &self,
        pos: &Position,
        orders: &[Order],
        config: &crate::config::RuntimeConfig,
    ) -> anyhow::Result<()> {
        let exit_side = pos.side.opposite();

        // A working take-profit on the exit side holds the shares and
        // blocks a new stop; cancel it first, re-place after.
        let mut replace_tp: Option<f64> = None;
        for order in orders {
            if order.symbol == pos.symbol
                && order.side == exit_side
                && is_working_status(&order.status)
            {
                if order.order_type == "limit" {
                    replace_tp = order.limit_price.or(pos.take_profit).or(replace_tp);
                }
                match self.client.cancel_order(&order.order_id).await {
                    Ok(()) => {
                        debug!(symbol = %pos.symbol, order_id = %order.order_id, "stale child cancelled");
                        self.state.trading.remove_order(&order.order_id);
                    }
                    Err(e) if e.is_cancel_race() => {
                        // The child filled: the position is changing under
                        // us. Let the next reconcile settle the truth; do
                        // not place a stop against a stale quantity.
                        info!(
                            symbol = %pos.symbol,
                            order_id = %order.order_id,
                            "child cancel raced a fill — deferring rebuild to reconcile"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        anyhow::bail!("cancel {} failed: {e}", order.order_id);
                    }
                }
            }
        }

        // Stop from the ladder state when we have one, else reconstructed.
        let stop_price = {
            let protection = self.protection.read();
            protection
                .get(&pos.symbol)
                .map(|ps| ps.current_stop)
                .unwrap_or_else(|| {
                    let atr = self
                        .state
                        .trading
                        .features(&pos.symbol)
                        .and_then(|f| f.atr)
                        .unwrap_or(0.0);
                    protective_stop(pos.side, pos.avg_entry_price, atr, config)
                })
        };

        let now = Utc::now();
        let stop_request = OrderRequest::simple(&pos.symbol, pos.qty, exit_side, OrderType::Stop)
            .with_stop(round_cents(stop_price))
            .with_client_order_id(client_order_id(&pos.symbol, OrderIntent::StopLoss, now));

        let stop_order = self
            .client
            .submit_order(&stop_request)
            .await
            .map_err(|e| anyhow::anyhow!("stop submit failed: {e}"))?;

        info!(
            symbol = %pos.symbol,
            stop = stop_price,
            order_id = %stop_order.id,
            "protective stop rebuilt"
        );

        self.state.trading.upsert_order(Order {
            order_id: stop_order.id.clone(),
            client_order_id: stop_order.client_order_id.clone(),
            symbol: pos.symbol.clone(),
            side: exit_side,
            qty: pos.qty,
            order_type: "stop".to_string(),
            status: stop_order.status.clone(),
            filled_qty: 0.0,
            filled_avg_price: None,
            limit_price: None,
            stop_price: Some(round_cents(stop_price)),
            submitted_at: stop_order.submitted_at,
            linkage: None,
        });
        self.state.trading.with_position_mut(&pos.symbol, |p| {
            p.stop_loss = Some(stop_price);
        });

        // Re-place the take-profit the stop displaced.
        if let Some(tp_price) = replace_tp {
            let tp_request =
                OrderRequest::simple(&pos.symbol, pos.qty, exit_side, OrderType::Limit)
                    .with_limit(round_cents(tp_price))
                    .with_client_order_id(client_order_id(
                        &pos.symbol,
                        OrderIntent::TakeProfit,
                        now,
                    ));
            match self.client.submit_order(&tp_request).await {
                Ok(tp_order) => {
                    debug!(symbol = %pos.symbol, tp = tp_price, "take-profit re-placed");
                    self.state.trading.upsert_order(Order {
                        order_id: tp_order.id.clone(),
                        client_order_id: tp_order.client_order_id.clone(),
                        symbol: pos.symbol.clone(),
                        side: exit_side,
                        qty: pos.qty,
                        order_type: "limit".to_string(),
                        status: tp_order.status.clone(),
                        filled_qty: 0.0,
                        filled_avg_price: None,
                        limit_price: Some(round_cents(tp_price)),
                        stop_price: None,
                        submitted_at: tp_order.submitted_at,
                        linkage: None,
                    });
                }
                Err(e) => {
                    // The stop is in place; a missing TP is an opportunity
                    // cost, not a protection hole.
                    warn!(symbol = %pos.symbol, error = %e, "take-profit re-place failed");
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trailing & partial profits
    // -------------------------------------------------------------------------

    /// Evaluate the R-ladder for every open position.
    async fn manage_ladders(&self) {
        let config = self.state.config.read().clone();
        let positions = self.state.trading.positions();
        if positions.is_empty() {
            return;
        }

        let trailing_symbols =
            select_trailing_symbols(&positions, config.max_trailing_positions as usize);

        for pos in &positions {
            let price = pos.current_price;
            if price <= 0.0 {
                continue;
            }

            let lock = self.state.symbol_locks.for_symbol(&pos.symbol);
            let _guard = lock.lock().await;

            let actions = {
                let mut protection = self.protection.write();
                match protection.get_mut(&pos.symbol) {
                    Some(ps) => ps.evaluate(
                        price,
                        pos.original_qty,
                        pos.qty,
                        trailing_symbols.contains(pos.symbol.as_str()),
                        &config,
                    ),
                    None => continue,
                }
            };

            for action in actions {
                match action {
                    ProtectionAction::MoveStop { new_stop, reason } => {
                        self.apply_stop_move(pos, new_stop, &reason).await;
                    }
                    ProtectionAction::PartialExit { qty, rung, r_level } => {
                        self.apply_partial_exit(pos, qty, &rung, r_level, &config)
                            .await;
                    }
                    ProtectionAction::CloseRemainder { rung, r_level } => {
                        self.apply_close_remainder(pos, &rung, r_level, &config).await;
                    }
                }
            }
        }
    }

    /// Replace the working stop with a tighter one. A missing stop order is
    /// left for the protection audit to rebuild at the new level.
    async fn apply_stop_move(&self, pos: &Position, new_stop: f64, reason: &str) {
        let orders = self.state.trading.orders();
        let stop_order = find_working_stop(&orders, &pos.symbol, pos.side);

        match stop_order {
            Some(order) => {
                match self
                    .client
                    .replace_order(&order.order_id, None, None, Some(round_cents(new_stop)))
                    .await
                {
                    Ok(replaced) => {
                        info!(
                            symbol = %pos.symbol,
                            new_stop,
                            reason,
                            order_id = %replaced.id,
                            "stop ratcheted"
                        );
                        self.state.trading.remove_order(&order.order_id);
                        self.state.trading.upsert_order(Order {
                            order_id: replaced.id.clone(),
                            client_order_id: replaced.client_order_id.clone(),
                            symbol: pos.symbol.clone(),
                            side: pos.side.opposite(),
                            qty: pos.qty,
                            order_type: "stop".to_string(),
                            status: replaced.status.clone(),
                            filled_qty: 0.0,
                            filled_avg_price: None,
                            limit_price: None,
                            stop_price: Some(round_cents(new_stop)),
                            submitted_at: replaced.submitted_at,
                            linkage: None,
                        });
                    }
                    Err(e) if e.is_cancel_race() => {
                        info!(symbol = %pos.symbol, "stop replace raced a fill — reconcile will settle");
                    }
                    Err(e) => {
                        warn!(symbol = %pos.symbol, error = %e, "stop replace failed");
                        self.state.push_error(format!("stop replace {}: {e}", pos.symbol));
                    }
                }
            }
            None => {
                debug!(symbol = %pos.symbol, "no working stop to ratchet — audit will rebuild");
            }
        }

        self.state.trading.with_position_mut(&pos.symbol, |p| {
            p.stop_loss = Some(new_stop);
            p.trailing_active = true;
        });
    }

    /// Sell part of the position at a ladder rung. Shadow mode logs the
    /// action it would have taken and stops there.
    async fn apply_partial_exit(
        &self,
        pos: &Position,
        qty: f64,
        rung: &str,
        r_level: f64,
        config: &crate::config::RuntimeConfig,
    ) {
        if config.partial_profit_shadow_mode {
            info!(
                symbol = %pos.symbol,
                qty,
                rung,
                price = pos.current_price,
                "SHADOW: would take partial profit"
            );
            self.state.trading.with_position_mut(&pos.symbol, |p| {
                p.partials_taken.push(rung.to_string());
            });
            return;
        }

        let now = Utc::now();
        let request = OrderRequest::simple(&pos.symbol, qty, pos.side.opposite(), OrderType::Market)
            .with_client_order_id(client_order_id(&pos.symbol, OrderIntent::PartialExit, now));

        match self.client.submit_order(&request).await {
            Ok(order) => {
                let exit_price = order.filled_avg_price.unwrap_or(pos.current_price);
                let pnl = pos.side.direction() * (exit_price - pos.avg_entry_price) * qty;

                info!(
                    symbol = %pos.symbol,
                    qty,
                    rung,
                    exit_price,
                    pnl = format!("{pnl:.2}"),
                    "partial profit taken"
                );

                // Each partial exit is an individual trade record.
                self.state.trading.record_trade(TradeRecord {
                    symbol: pos.symbol.clone(),
                    side: pos.side,
                    qty,
                    entry_price: pos.avg_entry_price,
                    exit_price,
                    entry_time: pos.entry_time,
                    exit_time: now,
                    pnl,
                    pnl_pct: if pos.avg_entry_price > 0.0 {
                        pos.side.direction() * (exit_price - pos.avg_entry_price)
                            / pos.avg_entry_price
                            * 100.0
                    } else {
                        0.0
                    },
                    reason: format!("partial_{rung}"),
                    client_order_id: order.client_order_id.clone(),
                    r_multiple: Some(r_level),
                });

                self.state.trading.with_position_mut(&pos.symbol, |p| {
                    p.qty -= qty;
                    p.partials_taken.push(rung.to_string());
                });
                self.state.events.publish(EngineEvent::Order {
                    symbol: pos.symbol.clone(),
                    status: order.status.clone(),
                    payload: serde_json::to_value(&order).unwrap_or_default(),
                });
            }
            Err(e) => {
                warn!(symbol = %pos.symbol, rung, error = %e, "partial exit failed");
                self.state.push_error(format!("partial {}: {e}", pos.symbol));
                // Un-mark the rung so the next cycle retries.
                let mut protection = self.protection.write();
                if let Some(ps) = protection.get_mut(&pos.symbol) {
                    ps.partials_taken.retain(|r| r != rung);
                }
            }
        }
    }

    /// The +4R rung: close whatever remains.
    async fn apply_close_remainder(
        &self,
        pos: &Position,
        rung: &str,
        _r_level: f64,
        config: &crate::config::RuntimeConfig,
    ) {
        if config.partial_profit_shadow_mode {
            info!(symbol = %pos.symbol, rung, "SHADOW: would close remainder");
            return;
        }

        match self.client.close_position(&pos.symbol).await {
            Ok(()) => {
                info!(symbol = %pos.symbol, rung, "remainder closed at ladder top");
                self.finalize_close(pos, pos.current_price, &format!("ladder_{rung}"));
            }
            Err(e) => {
                warn!(symbol = %pos.symbol, error = %e, "remainder close failed");
                self.state.push_error(format!("close {}: {e}", pos.symbol));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    /// Daily realized loss beyond the cap disables new entries.
    fn check_circuit_breaker(&self) {
        if self.state.trading.circuit_breaker_triggered() {
            return;
        }
        let config = self.state.config.read();
        let metrics = self.state.trading.metrics();
        if metrics.equity <= 0.0 {
            return;
        }

        let cap = config.daily_loss_cap_pct * metrics.equity;
        let day_pnl = self.state.trading.day_realized_pnl(Utc::now());
        if day_pnl < -cap {
            error!(
                day_pnl = format!("{day_pnl:.2}"),
                cap = format!("{cap:.2}"),
                "daily loss cap exceeded — disabling new entries"
            );
            drop(config);
            self.state.disable_trading();
            self.state.events.log(
                "error",
                format!("circuit breaker: daily loss {day_pnl:.2} exceeded cap {cap:.2}"),
            );
        }
    }

    // -------------------------------------------------------------------------
    // EOD flatten
    // -------------------------------------------------------------------------

    /// At the configured Eastern time, close all positions and cancel all
    /// working orders.
    async fn maybe_eod_flatten(&self) {
        let config = self.state.config.read().clone();
        let Some(eod) = market_time::parse_hhmm(&config.eod_exit_time) else {
            return;
        };
        if !market_time::at_or_past(Utc::now(), eod) {
            return;
        }

        let positions = self.state.trading.positions();
        let orders = self.state.trading.orders();
        if positions.is_empty() && orders.is_empty() {
            return;
        }

        if !config.force_eod_exit {
            info!(
                positions = positions.len(),
                orders = orders.len(),
                "SHADOW: EOD window reached, force_eod_exit disabled"
            );
            return;
        }

        info!(
            positions = positions.len(),
            orders = orders.len(),
            "EOD flatten — closing everything"
        );
        self.flatten_all("eod_exit").await;
    }

    /// Cancel every working order, then close every position.
    pub async fn flatten_all(&self, reason: &str) {
        for order in self.state.trading.orders() {
            match self.client.cancel_order(&order.order_id).await {
                Ok(()) => {
                    self.state.trading.remove_order(&order.order_id);
                }
                Err(e) if e.is_cancel_race() => {
                    debug!(order_id = %order.order_id, "cancel raced a fill during flatten");
                    self.state.trading.remove_order(&order.order_id);
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "cancel failed during flatten");
                }
            }
        }

        for pos in self.state.trading.positions() {
            match self.client.close_position(&pos.symbol).await {
                Ok(()) => self.finalize_close(&pos, pos.current_price, reason),
                Err(e) => {
                    warn!(symbol = %pos.symbol, error = %e, "close failed during flatten");
                    self.state.push_error(format!("flatten {}: {e}", pos.symbol));
                }
            }
        }
    }

    /// Operator command: close one symbol through the same path.
    pub async fn close_symbol(&self, symbol: &str, reason: &str) -> anyhow::Result<()> {
        let pos = self
            .state
            .trading
            .position(symbol)
            .ok_or_else(|| anyhow::anyhow!("no open position for {symbol}"))?;

        // Children first so the close does not race the protective legs.
        for order in self.state.trading.orders() {
            if order.symbol == symbol {
                match self.client.cancel_order(&order.order_id).await {
                    Ok(()) => {
                        self.state.trading.remove_order(&order.order_id);
                    }
                    Err(e) if e.is_cancel_race() => {
                        debug!(order_id = %order.order_id, "child cancel raced a fill");
                        self.state.trading.remove_order(&order.order_id);
                    }
                    Err(e) => {
                        warn!(order_id = %order.order_id, error = %e, "child cancel failed");
                    }
                }
            }
        }

        self.client
            .close_position(symbol)
            .await
            .map_err(|e| anyhow::anyhow!("close {symbol}: {e}"))?;
        self.finalize_close(&pos, pos.current_price, reason);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Remnant cleanup
    // -------------------------------------------------------------------------

    /// Close positions whose notional has shrunk below the floor; they hold
    /// a slot without carrying meaningful exposure.
    async fn cleanup_remnants(&self) {
        let config = self.state.config.read().clone();
        let equity = self.state.trading.metrics().equity;
        if equity <= 0.0 {
            return;
        }

        for pos in self.state.trading.positions() {
            if is_remnant(&pos, equity, config.remnant_pct) {
                info!(
                    symbol = %pos.symbol,
                    notional = format!("{:.2}", pos.market_value.abs()),
                    floor = format!("{:.2}", equity * config.remnant_pct),
                    "remnant position — closing to free the slot"
                );
                match self.client.close_position(&pos.symbol).await {
                    Ok(()) => self.finalize_close(&pos, pos.current_price, "remnant_cleanup"),
                    Err(e) => {
                        warn!(symbol = %pos.symbol, error = %e, "remnant close failed");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("protected", &self.protection.read().len())
            .field("audit_failures", &self.audit_failures.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// Working statuses a protective order can sit in.
fn is_working_status(status: &str) -> bool {
    matches!(
        status,
        "new" | "accepted" | "pending_new" | "partially_filled" | "held" | "accepted_for_bidding"
    )
}

/// Find the working stop order protecting `symbol` (exit side of the
/// position, stop-type, working status).
pub fn find_working_stop<'a>(
    orders: &'a [Order],
    symbol: &str,
    position_side: Side,
) -> Option<&'a Order> {
    let exit_side = position_side.opposite();
    orders.iter().find(|o| {
        o.symbol == symbol
            && o.side == exit_side
            && (o.order_type == "stop" || o.order_type == "trailing_stop")
            && is_working_status(&o.status)
    })
}

/// Symbols allowed to trail this cycle: the N most profitable positions.
pub fn select_trailing_symbols(positions: &[Position], max_n: usize) -> HashSet<String> {
    let mut ranked: Vec<&Position> = positions.iter().collect();
    ranked.sort_by(|a, b| {
        b.unrealized_pnl
            .partial_cmp(&a.unrealized_pnl)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
        .into_iter()
        .take(max_n)
        .map(|p| p.symbol.clone())
        .collect()
}

/// Whether a position's notional has shrunk below the cleanup floor.
pub fn is_remnant(position: &Position, equity: f64, remnant_pct: f64) -> bool {
    position.market_value.abs() < equity * remnant_pct
}

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}
