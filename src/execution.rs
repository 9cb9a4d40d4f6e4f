// =============================================================================
// Order Executor — bracket submission with bulletproof fill detection
// =============================================================================
//
// Submits an approved trade as a bracket: entry + linked stop + linked
// take-profit. With `bracket_orders_enabled` the broker does the linking in
// one atomic request; otherwise the executor places the entry, waits for the
// fill, then attaches both protective legs — and fails closed (flattens the
// entry) if the legs cannot be attached.
//
// Fill detection is multi-method; a fill is confirmed when at least two of
// these agree, or when the broker-side position reflects the quantity
// (ultimate validation):
//   1. status field says filled/fill/executed/complete/completed
//   2. filled_qty >= qty
//   3. the broker stamped a fill timestamp
//   4. the broker position shows the new quantity
//
// A cancel that comes back `RaceCondition` IS a fill and is reconciled as
// one, never surfaced as an error.
//
// Client order ids are `hash(symbol, intent, minute-bucket)`, URL-safe and
// deterministic: retrying a submission inside the same bar reuses the same
// id, so the broker deduplicates instead of double-filling.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::app_state::{AppState, Order};
use crate::broker::{BrokerClient, BrokerError, BrokerOrder, OrderRequest};
use crate::config::RuntimeConfig;
use crate::events::EngineEvent;
use crate::market_time;
use crate::strategy::Signal;
use crate::types::{OrderType, Side};

/// Submission attempts for transient broker failures.
const SUBMIT_RETRIES: u32 = 3;
/// Base backoff between submission retries.
const SUBMIT_BACKOFF_MS: u64 = 500;
/// Initial fill-wait poll interval.
const POLL_INITIAL_MS: u64 = 500;
/// Poll interval ceiling.
const POLL_MAX_MS: u64 = 2_000;
/// Seconds the executor waits for protective legs before failing closed.
const LEG_ATTACH_GRACE_SECS: u64 = 30;

// =============================================================================
// Client order ids
// =============================================================================

/// What a client order id is for; part of the hash so the entry, its legs,
/// and any later repair each get distinct ids within the same bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderIntent {
    Entry,
    StopLoss,
    TakeProfit,
    PartialExit,
    Flatten,
}

impl OrderIntent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::StopLoss => "stop",
            Self::TakeProfit => "tp",
            Self::PartialExit => "partial",
            Self::Flatten => "flatten",
        }
    }
}

/// Deterministic, URL-safe client order id: `mrd-<16 hex>-<intent>`.
///
/// Hashing (symbol, intent, Eastern minute bucket) makes retries inside the
/// same bar idempotent on the broker side. Always <= 48 chars.
pub fn client_order_id(symbol: &str, intent: OrderIntent, now: DateTime<Utc>) -> String {
    let bucket = market_time::minute_bucket(now);
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(intent.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.as_bytes());
    let digest = hasher.finalize();
    format!("mrd-{}-{}", hex::encode(&digest[..8]), intent.as_str())
}

// =============================================================================
// Fill detection
// =============================================================================

/// True when the status field names a filled state, in any of the shapes
/// brokers have been seen to use.
pub fn status_indicates_fill(status: &str) -> bool {
    matches!(
        status.to_lowercase().as_str(),
        "filled" | "fill" | "executed" | "complete" | "completed"
    )
}

/// One multi-method fill check over an order snapshot plus an optional
/// broker-position quantity for the same symbol.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FillCheck {
    pub status_says_filled: bool,
    pub qty_complete: bool,
    pub has_fill_timestamp: bool,
    pub position_reflects_qty: bool,
}

impl FillCheck {
    pub fn inspect(order: &BrokerOrder, broker_position_qty: Option<f64>) -> Self {
        Self {
            status_says_filled: status_indicates_fill(&order.status),
            qty_complete: order.qty > 0.0 && order.filled_qty >= order.qty,
            has_fill_timestamp: order.filled_at.is_some(),
            position_reflects_qty: broker_position_qty
                .map(|q| q >= order.qty && order.qty > 0.0)
                .unwrap_or(false),
        }
    }

    fn agreeing_methods(&self) -> u32 {
        [
            self.status_says_filled,
            self.qty_complete,
            self.has_fill_timestamp,
            self.position_reflects_qty,
        ]
        .iter()
        .filter(|&&b| b)
        .count() as u32
    }

    /// Two agreeing methods, or the broker-side position alone (ultimate
    /// validation), confirm the fill.
    pub fn confirmed(&self) -> bool {
        self.agreeing_methods() >= 2 || self.position_reflects_qty
    }
}

// =============================================================================
// Pricing
// =============================================================================

/// Marketable-limit price: last trade plus a buffer toward the aggressive
/// side, capped so the worst acceptable fill stays inside the hard slippage
/// limit.
pub fn marketable_limit(
    side: Side,
    last_price: f64,
    extended_hours: bool,
    config: &RuntimeConfig,
) -> f64 {
    let buffer = if extended_hours {
        config.limit_buffer_extended
    } else {
        config.limit_buffer_regular
    };
    let capped = buffer.min(config.max_slippage_pct / 100.0);
    last_price * (1.0 + side.direction() * capped)
}

/// Whether the current print has drifted past the hard slippage limit from
/// the price the signal was computed against. Beyond this the order is
/// cancelled, never re-priced.
pub fn slippage_exceeded(entry_ref: f64, current_price: f64, config: &RuntimeConfig) -> bool {
    if entry_ref <= 0.0 {
        return true;
    }
    let drift_pct = ((current_price - entry_ref) / entry_ref).abs() * 100.0;
    drift_pct > config.max_slippage_pct
}

// =============================================================================
// Outcome
// =============================================================================

/// Final result of one entry attempt.
#[derive(Debug, Clone, Serialize)]
pub enum ExecutionOutcome {
    /// Entry filled and both protective legs are working.
    Bracketed {
        entry_order_id: String,
        stop_order_id: Option<String>,
        take_profit_order_id: Option<String>,
        filled_qty: f64,
        filled_avg_price: f64,
    },
    /// Terminal broker rejection; the gate flags the bar so the same signal
    /// is not retried.
    Rejected { reason: String },
    /// Transient failures exhausted their retries.
    Failed { error: String },
    /// No fill inside the timeout; any remainder was cancelled.
    TimedOut,
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bracketed {
                filled_qty,
                filled_avg_price,
                ..
            } => write!(f, "Bracketed({filled_qty} @ {filled_avg_price})"),
            Self::Rejected { reason } => write!(f, "Rejected({reason})"),
            Self::Failed { error } => write!(f, "Failed({error})"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

pub struct OrderExecutor {
    client: Arc<BrokerClient>,
    state: Arc<AppState>,
}

impl OrderExecutor {
    pub fn new(client: Arc<BrokerClient>, state: Arc<AppState>) -> Self {
        Self { client, state }
    }

    /// Execute an approved signal at the gate-approved quantity.
    #[instrument(skip(self, signal), fields(symbol = %signal.symbol, side = %signal.side), name = "executor::execute")]
    pub async fn execute(&self, signal: &Signal, qty: f64, extended_hours: bool) -> ExecutionOutcome {
        let config = self.state.config.read().clone();
        let now = Utc::now();

        // ── 1. Re-snapshot the price and guard slippage ────────────────
        let latest = match self.client.get_latest_trade(&signal.symbol).await {
            Ok(t) => t.price,
            Err(e) if e.is_transient() => {
                return ExecutionOutcome::Failed {
                    error: format!("latest trade unavailable: {e}"),
                }
            }
            Err(e) => {
                return ExecutionOutcome::Rejected {
                    reason: format!("latest trade: {e}"),
                }
            }
        };

        if slippage_exceeded(signal.entry_ref, latest, &config) {
            warn!(
                symbol = %signal.symbol,
                entry_ref = signal.entry_ref,
                latest,
                max_slippage_pct = config.max_slippage_pct,
                "price drifted past the slippage limit — cancelling entry"
            );
            return ExecutionOutcome::Rejected {
                reason: "max_slippage".to_string(),
            };
        }

        // ── 2. Build the entry request ──────────────────────────────────
        let limit = marketable_limit(signal.side, latest, extended_hours, &config);
        let coid = client_order_id(&signal.symbol, OrderIntent::Entry, now);

        let mut request = OrderRequest::simple(&signal.symbol, qty, signal.side, OrderType::Limit)
            .with_limit(round_cents(limit))
            .with_client_order_id(coid.clone());
        if config.bracket_orders_enabled {
            request = request.with_bracket(
                round_cents(signal.take_profit),
                round_cents(signal.initial_stop),
            );
        }

        // ── 3. Submit with bounded retry (same id => idempotent) ───────
        let entry = match self.submit_with_retry(&request).await {
            Ok(order) => order,
            Err(e) if e.is_transient() => {
                return ExecutionOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(e) => {
                return ExecutionOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        };

        self.track_order(&entry, None);
        self.state.events.publish(EngineEvent::Order {
            symbol: entry.symbol.clone(),
            status: entry.status.clone(),
            payload: serde_json::to_value(&entry).unwrap_or_default(),
        });

        // ── 4. Wait for the fill ────────────────────────────────────────
        let filled = match self.wait_for_fill(&entry, config.fill_timeout_secs).await {
            FillWait::Filled(order) => order,
            FillWait::PartiallyFilled(order) => {
                // Remainder either fills or gets cancelled; legs size to the
                // actual filled quantity.
                info!(
                    symbol = %order.symbol,
                    filled = order.filled_qty,
                    requested = order.qty,
                    "partial fill at timeout — cancelling remainder"
                );
                match self.client.cancel_order(&order.id).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancel_race() => {
                        // The remainder filled while we were cancelling.
                        debug!(order_id = %order.id, "cancel raced a full fill");
                    }
                    Err(e) => warn!(order_id = %order.id, error = %e, "remainder cancel failed"),
                }
                match self.client.get_order(&order.id).await {
                    Ok(refetched) if refetched.filled_qty > 0.0 => refetched,
                    _ => order,
                }
            }
            FillWait::Unfilled(order) => {
                match self.client.cancel_order(&order.id).await {
                    Ok(()) => return ExecutionOutcome::TimedOut,
                    Err(e) if e.is_cancel_race() => {
                        // Classic cancel-race: it filled after all.
                        info!(order_id = %order.id, "cancel raced the entry fill — proceeding as filled");
                        match self.client.get_order(&order.id).await {
                            Ok(refetched) => refetched,
                            Err(_) => order,
                        }
                    }
                    Err(e) => {
                        warn!(order_id = %order.id, error = %e, "entry cancel failed");
                        return ExecutionOutcome::Failed {
                            error: e.to_string(),
                        };
                    }
                }
            }
        };

        let filled_qty = filled.filled_qty;
        let filled_price = filled.filled_avg_price.unwrap_or(latest);

        if filled_qty <= 0.0 {
            return ExecutionOutcome::TimedOut;
        }

        // ── 5. Protection ───────────────────────────────────────────────
        if config.bracket_orders_enabled && !filled.legs.is_empty() {
            let stop_id = filled
                .legs
                .iter()
                .find(|l| l.order_type == "stop")
                .map(|l| l.id.clone());
            let tp_id = filled
                .legs
                .iter()
                .find(|l| l.order_type == "limit")
                .map(|l| l.id.clone());

            for leg in &filled.legs {
                self.track_order(leg, Some(filled.id.clone()));
            }

            info!(
                symbol = %filled.symbol,
                qty = filled_qty,
                price = filled_price,
                stop = ?stop_id,
                take_profit = ?tp_id,
                "entry filled — bracket legs working"
            );

            return ExecutionOutcome::Bracketed {
                entry_order_id: filled.id.clone(),
                stop_order_id: stop_id,
                take_profit_order_id: tp_id,
                filled_qty,
                filled_avg_price: filled_price,
            };
        }

        // Sequential legs: attach stop + take-profit, fail closed on error.
        self.attach_protection(signal, &filled, filled_qty).await
    }

    // -------------------------------------------------------------------------
    // Protective legs (sequential mode)
    // -------------------------------------------------------------------------

    /// Place stop and take-profit legs sized to the actual fill. If either
    /// leg cannot be placed within the grace window the entry is flattened:
    /// an unprotected position is worse than no position.
    async fn attach_protection(
        &self,
        signal: &Signal,
        entry: &BrokerOrder,
        filled_qty: f64,
    ) -> ExecutionOutcome {
        let now = Utc::now();
        let exit_side = signal.side.opposite();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(LEG_ATTACH_GRACE_SECS);

        let stop_request =
            OrderRequest::simple(&signal.symbol, filled_qty, exit_side, OrderType::Stop)
                .with_stop(round_cents(signal.initial_stop))
                .with_client_order_id(client_order_id(
                    &signal.symbol,
                    OrderIntent::StopLoss,
                    now,
                ));

        let stop = loop {
            match self.submit_with_retry(&stop_request).await {
                Ok(order) => break order,
                Err(e) if e.is_transient() && tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(SUBMIT_BACKOFF_MS)).await;
                    continue;
                }
                Err(e) => {
                    warn!(
                        symbol = %signal.symbol,
                        error = %e,
                        "stop leg failed — flattening the naked entry"
                    );
                    let _ = self.client.close_position(&signal.symbol).await;
                    return ExecutionOutcome::Rejected {
                        reason: format!("protection_unavailable: {e}"),
                    };
                }
            }
        };
        self.track_order(&stop, Some(entry.id.clone()));

        let tp_request =
            OrderRequest::simple(&signal.symbol, filled_qty, exit_side, OrderType::Limit)
                .with_limit(round_cents(signal.take_profit))
                .with_client_order_id(client_order_id(
                    &signal.symbol,
                    OrderIntent::TakeProfit,
                    now,
                ));

        let tp_id = match self.submit_with_retry(&tp_request).await {
            Ok(order) => {
                self.track_order(&order, Some(entry.id.clone()));
                Some(order.id)
            }
            Err(e) => {
                // The stop is working, so the position is protected; the
                // take-profit is re-placed by the protection audit.
                warn!(symbol = %signal.symbol, error = %e, "take-profit leg failed — audit will re-place");
                None
            }
        };

        info!(
            symbol = %signal.symbol,
            qty = filled_qty,
            stop_id = %stop.id,
            take_profit = ?tp_id,
            "protective legs attached sequentially"
        );

        ExecutionOutcome::Bracketed {
            entry_order_id: entry.id.clone(),
            stop_order_id: Some(stop.id.clone()),
            take_profit_order_id: tp_id,
            filled_qty,
            filled_avg_price: entry.filled_avg_price.unwrap_or(signal.entry_ref),
        }
    }

    // -------------------------------------------------------------------------
    // Fill wait
    // -------------------------------------------------------------------------

    /// Adaptive poll (0.5 s doubling to 2 s) until the order confirms as
    /// filled by the multi-method check, with a hard timeout.
    async fn wait_for_fill(&self, order: &BrokerOrder, timeout_secs: u64) -> FillWait {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        let mut poll_ms = POLL_INITIAL_MS;
        let mut latest = order.clone();
        let mut polls: u32 = 0;

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(poll_ms)).await;
            poll_ms = (poll_ms * 2).min(POLL_MAX_MS);
            polls += 1;

            match self.client.get_order(&order.id).await {
                Ok(refetched) => latest = refetched,
                Err(e) => {
                    debug!(order_id = %order.id, error = %e, "fill poll failed");
                    continue;
                }
            }

            // Every few polls, consult broker positions for the ultimate
            // validation path.
            let position_qty = if polls % 4 == 0 {
                match self.client.list_positions().await {
                    Ok(positions) => positions
                        .iter()
                        .find(|p| p.symbol == order.symbol)
                        .map(|p| p.qty),
                    Err(_) => None,
                }
            } else {
                None
            };

            let check = FillCheck::inspect(&latest, position_qty);
            if check.confirmed() {
                debug!(order_id = %order.id, ?check, "fill confirmed");
                return FillWait::Filled(latest);
            }

            // Terminal non-fill states end the wait early.
            if matches!(latest.status.as_str(), "canceled" | "cancelled" | "expired" | "rejected") {
                break;
            }
        }

        if latest.filled_qty > 0.0 && latest.filled_qty < latest.qty {
            FillWait::PartiallyFilled(latest)
        } else if latest.filled_qty >= latest.qty && latest.qty > 0.0 {
            FillWait::Filled(latest)
        } else {
            FillWait::Unfilled(latest)
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn submit_with_retry(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError> {
        let mut last_err: Option<BrokerError> = None;
        for attempt in 0..SUBMIT_RETRIES {
            if attempt > 0 {
                let backoff = SUBMIT_BACKOFF_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match self.client.submit_order(request).await {
                Ok(order) => return Ok(order),
                Err(e) if e.is_transient() => {
                    warn!(
                        symbol = %request.symbol,
                        attempt,
                        error = %e,
                        "transient submit failure — retrying with the same client order id"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            BrokerError::new(crate::broker::BrokerErrorKind::Other, "submit retries exhausted")
        }))
    }

    /// Mirror a broker order into TradingState.
    fn track_order(&self, order: &BrokerOrder, linkage: Option<String>) {
        self.state.trading.upsert_order(Order {
            order_id: order.id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            order_type: order.order_type.clone(),
            status: order.status.clone(),
            filled_qty: order.filled_qty,
            filled_avg_price: order.filled_avg_price,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            submitted_at: order.submitted_at,
            linkage,
        });
        self.state.increment_version();
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor").finish_non_exhaustive()
    }
}

enum FillWait {
    Filled(BrokerOrder),
    PartiallyFilled(BrokerOrder),
    Unfilled(BrokerOrder),
}

/// Equity prices go to the broker in whole cents.
fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(status: &str, qty: f64, filled_qty: f64, filled_at: bool) -> BrokerOrder {
        BrokerOrder {
            id: "o1".into(),
            client_order_id: "c1".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            order_type: "limit".into(),
            status: status.into(),
            qty,
            filled_qty,
            filled_avg_price: if filled_qty > 0.0 { Some(50.0) } else { None },
            limit_price: Some(50.05),
            stop_price: None,
            submitted_at: None,
            filled_at: if filled_at {
                Some(Utc::now())
            } else {
                None
            },
            legs: Vec::new(),
        }
    }

    // ---- client order ids ------------------------------------------------

    #[test]
    fn client_order_id_is_deterministic_within_a_bar() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 16, 14, 5, 3).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 16, 14, 5, 58).unwrap();
        assert_eq!(
            client_order_id("SPY", OrderIntent::Entry, t1),
            client_order_id("SPY", OrderIntent::Entry, t2)
        );
    }

    #[test]
    fn client_order_id_varies_by_bar_symbol_and_intent() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 16, 14, 5, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 16, 14, 6, 0).unwrap();

        let base = client_order_id("SPY", OrderIntent::Entry, t1);
        assert_ne!(base, client_order_id("SPY", OrderIntent::Entry, t2));
        assert_ne!(base, client_order_id("QQQ", OrderIntent::Entry, t1));
        assert_ne!(base, client_order_id("SPY", OrderIntent::StopLoss, t1));
    }

    #[test]
    fn client_order_id_is_short_and_url_safe() {
        let t = Utc.with_ymd_and_hms(2026, 3, 16, 14, 5, 0).unwrap();
        for intent in [
            OrderIntent::Entry,
            OrderIntent::StopLoss,
            OrderIntent::TakeProfit,
            OrderIntent::PartialExit,
            OrderIntent::Flatten,
        ] {
            let id = client_order_id("SPY", intent, t);
            assert!(id.len() <= 48, "{id} too long");
            assert!(
                id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
                "{id} not URL-safe"
            );
        }
    }

    // ---- fill detection --------------------------------------------------

    #[test]
    fn status_fill_variants() {
        for status in [
            "filled", "FILLED", "fill", "FILL", "executed", "EXECUTED", "complete", "COMPLETE",
            "completed", "COMPLETED",
        ] {
            assert!(status_indicates_fill(status), "missed status {status}");
        }
        for status in ["new", "accepted", "partially_filled", "canceled", "expired"] {
            assert!(!status_indicates_fill(status), "false positive on {status}");
        }
    }

    #[test]
    fn two_methods_confirm_a_fill() {
        // Status + qty agree.
        let check = FillCheck::inspect(&order("filled", 100.0, 100.0, false), None);
        assert!(check.confirmed());

        // Status alone does not.
        let check = FillCheck::inspect(&order("filled", 100.0, 0.0, false), None);
        assert!(!check.confirmed());

        // Qty + timestamp agree without the status field.
        let check = FillCheck::inspect(&order("new", 100.0, 100.0, true), None);
        assert!(check.confirmed());
    }

    #[test]
    fn position_change_alone_is_ultimate_validation() {
        let check = FillCheck::inspect(&order("new", 100.0, 0.0, false), Some(100.0));
        assert!(check.confirmed());

        // A smaller position does not validate.
        let check = FillCheck::inspect(&order("new", 100.0, 0.0, false), Some(40.0));
        assert!(!check.confirmed());
    }

    // ---- pricing ---------------------------------------------------------

    #[test]
    fn marketable_limit_buffers_by_session() {
        let config = RuntimeConfig::default();

        // Regular hours: 0.1% buffer.
        let buy = marketable_limit(Side::Buy, 100.0, false, &config);
        assert!((buy - 100.10).abs() < 1e-9);

        // Extended hours widen to 0.3%.
        let buy_ext = marketable_limit(Side::Buy, 100.0, true, &config);
        assert!((buy_ext - 100.30).abs() < 1e-9);

        // Sells buffer downward.
        let sell = marketable_limit(Side::Sell, 100.0, false, &config);
        assert!((sell - 99.90).abs() < 1e-9);
    }

    #[test]
    fn marketable_limit_capped_by_max_slippage() {
        let mut config = RuntimeConfig::default();
        config.limit_buffer_extended = 0.02; // 2% buffer...
        config.max_slippage_pct = 0.5; // ...but slippage caps at 0.5%

        let buy = marketable_limit(Side::Buy, 100.0, true, &config);
        assert!((buy - 100.50).abs() < 1e-9);
    }

    #[test]
    fn slippage_guard() {
        let config = RuntimeConfig::default(); // 0.5% max

        assert!(!slippage_exceeded(100.0, 100.3, &config));
        assert!(slippage_exceeded(100.0, 100.6, &config));
        assert!(slippage_exceeded(100.0, 99.4, &config)); // drift either way
        assert!(slippage_exceeded(0.0, 100.0, &config)); // degenerate ref
    }

    #[test]
    fn round_cents_behaviour() {
        assert_eq!(round_cents(50.056), 50.06);
        assert_eq!(round_cents(50.054), 50.05);
        assert_eq!(round_cents(48.0), 48.0);
    }
}
