// =============================================================================
// Risk Gate & Position Sizer — every entry passes through here
// =============================================================================
//
// Approval pipeline for a proposed entry:
//
//   1. Trading enabled (no circuit breaker, not paused/halted)
//   2. Market open, and before the entry cutoff
//   3. Position cap, one position per symbol
//   4. Symbol cooldown (consecutive losses, time since last exit)
//   5. Adaptive confidence threshold (regime + sentiment, bounded +/-25)
//   6. Volatility/flow filter (ADX floor, regime-dependent volume ratio)
//   7. Sizing (risk-based qty, buying-power cap, equity cap, minimum size)
//   8. Per-bar rejection latch (a terminal rejection is not retried in the
//      same bar)
//
// Every verdict — approved or not — is recorded as an auditable decision
// with a stable reason string.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::market_time;
use crate::regime::{MarketRegime, RegimeState};
use crate::strategy::Signal;
use crate::types::Side;

/// Baseline confidence threshold for long entries.
const LONG_THRESHOLD_BASE: f64 = 60.0;
/// Baseline confidence threshold for short entries.
const SHORT_THRESHOLD_BASE: f64 = 65.0;
/// Threshold adjustments from regime and sentiment sum to at most this.
const MAX_THRESHOLD_ADJUSTMENT: f64 = 25.0;

/// Fraction of buying power left untouched as a buffer.
const BUYING_POWER_BUFFER: f64 = 0.8;
/// Minimum viable position as a fraction of equity.
const MIN_NOTIONAL_PCT: f64 = 0.005;
/// Hard floor on risk-per-share as a fraction of the entry price.
const RISK_PER_SHARE_FLOOR_PCT: f64 = 0.015;

/// Minutes a symbol stays blocked after any exit, independent of PnL.
const REENTRY_DELAY_MIN: i64 = 15;

/// Retained gate decisions for the audit trail.
const MAX_DECISIONS: usize = 100;

// =============================================================================
// Verdicts
// =============================================================================

/// Stable, user-visible rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TradingDisabled,
    MarketClosed,
    EntryCutoff,
    CapReached,
    PositionExists,
    Cooldown,
    BelowThreshold,
    VolatilityFilter,
    InsufficientBuyingPower,
    BelowMinSize,
    RejectedThisBar,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TradingDisabled => "trading_disabled",
            Self::MarketClosed => "market_closed",
            Self::EntryCutoff => "entry_cutoff",
            Self::CapReached => "cap_reached",
            Self::PositionExists => "position_exists",
            Self::Cooldown => "cooldown",
            Self::BelowThreshold => "below_threshold",
            Self::VolatilityFilter => "volatility_filter",
            Self::InsufficientBuyingPower => "insufficient_buying_power",
            Self::BelowMinSize => "below_min_size",
            Self::RejectedThisBar => "rejected_this_bar",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct GateVerdict {
    pub approved: bool,
    pub qty: f64,
    pub reason: Option<RejectReason>,
    /// The adaptive threshold the confidence was measured against.
    pub threshold: f64,
    /// Sizing trace for logs and the audit record.
    pub detail: String,
}

impl GateVerdict {
    fn rejected(reason: RejectReason, threshold: f64, detail: impl Into<String>) -> Self {
        Self {
            approved: false,
            qty: 0.0,
            reason: Some(reason),
            threshold,
            detail: detail.into(),
        }
    }
}

/// Auditable record of a gate decision, kept in a bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub approved: bool,
    pub qty: f64,
    pub confidence: f64,
    pub threshold: f64,
    pub reason: Option<String>,
    pub detail: String,
    pub created_at: String,
}

// =============================================================================
// Gate input
// =============================================================================

/// Everything the gate needs to judge one signal, assembled by the signal
/// loop so the gate itself stays synchronous and testable.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub signal: &'a Signal,
    pub now: DateTime<Utc>,
    pub market_open: bool,
    pub equity: f64,
    pub available_buying_power: f64,
    pub open_positions: u32,
    pub has_position_for_symbol: bool,
    pub trading_enabled: bool,
    pub regime: &'a RegimeState,
    /// ADX from the feature snapshot backing the signal.
    pub adx: Option<f64>,
    /// 20-period volume ratio from the feature snapshot.
    pub volume_ratio: Option<f64>,
}

// =============================================================================
// Cooldown tracking
// =============================================================================

#[derive(Debug, Clone, Default)]
struct SymbolCooldown {
    consecutive_losses: u32,
    last_exit: Option<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

// =============================================================================
// RiskGate
// =============================================================================

pub struct RiskGate {
    cooldowns: RwLock<HashMap<String, SymbolCooldown>>,
    decisions: RwLock<Vec<GateDecision>>,
    /// symbol -> minute bucket of the last terminal rejection; the same
    /// signal is not retried within that bar.
    rejected_bars: RwLock<HashMap<String, String>>,
}

impl RiskGate {
    pub fn new() -> Self {
        Self {
            cooldowns: RwLock::new(HashMap::new()),
            decisions: RwLock::new(Vec::new()),
            rejected_bars: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    /// Run the full approval pipeline. Records the decision either way.
    pub fn evaluate(&self, config: &RuntimeConfig, input: &GateInput<'_>) -> GateVerdict {
        let verdict = self.evaluate_inner(config, input);
        self.record_decision(input, &verdict);

        match (&verdict.approved, &verdict.reason) {
            (true, _) => info!(
                symbol = %input.signal.symbol,
                side = %input.signal.side,
                qty = verdict.qty,
                threshold = verdict.threshold,
                detail = %verdict.detail,
                "entry APPROVED"
            ),
            (false, Some(reason)) => debug!(
                symbol = %input.signal.symbol,
                side = %input.signal.side,
                reason = %reason,
                detail = %verdict.detail,
                "entry rejected"
            ),
            _ => {}
        }

        verdict
    }

    fn evaluate_inner(&self, config: &RuntimeConfig, input: &GateInput<'_>) -> GateVerdict {
        let signal = input.signal;
        let threshold = self.adaptive_threshold(signal.side, input.regime);

        // ── 1. Trading enabled ──────────────────────────────────────────
        if !input.trading_enabled {
            return GateVerdict::rejected(RejectReason::TradingDisabled, threshold, "");
        }

        // ── 2. Market open + entry cutoff ───────────────────────────────
        if !input.market_open {
            return GateVerdict::rejected(RejectReason::MarketClosed, threshold, "");
        }
        if let Some(cutoff) = market_time::parse_hhmm(&config.entry_cutoff_time) {
            if market_time::at_or_past(input.now, cutoff) {
                return GateVerdict::rejected(
                    RejectReason::EntryCutoff,
                    threshold,
                    format!("cutoff {}", config.entry_cutoff_time),
                );
            }
        }

        // ── 3. Position cap, one per symbol ─────────────────────────────
        if input.open_positions >= config.max_positions {
            return GateVerdict::rejected(
                RejectReason::CapReached,
                threshold,
                format!("{}/{} positions", input.open_positions, config.max_positions),
            );
        }
        if input.has_position_for_symbol {
            return GateVerdict::rejected(RejectReason::PositionExists, threshold, "");
        }

        // ── 4. Symbol cooldown ──────────────────────────────────────────
        if let Some(until) = self.cooldown_active(&signal.symbol, input.now) {
            return GateVerdict::rejected(
                RejectReason::Cooldown,
                threshold,
                format!("blocked until {until}"),
            );
        }

        // ── 5. Adaptive confidence threshold ────────────────────────────
        if signal.confidence < threshold {
            return GateVerdict::rejected(
                RejectReason::BelowThreshold,
                threshold,
                format!("confidence {:.0} < {:.0}", signal.confidence, threshold),
            );
        }

        // ── 6. Per-bar rejection latch ──────────────────────────────────
        let bucket = market_time::minute_bucket(input.now);
        if self
            .rejected_bars
            .read()
            .get(&signal.symbol)
            .is_some_and(|b| *b == bucket)
        {
            return GateVerdict::rejected(RejectReason::RejectedThisBar, threshold, "");
        }

        // ── 7. Volatility / flow filter ─────────────────────────────────
        if let Some(detail) = volatility_filter(config, input) {
            return GateVerdict::rejected(RejectReason::VolatilityFilter, threshold, detail);
        }

        // ── 8. Sizing ───────────────────────────────────────────────────
        self.size_position(config, input, threshold)
    }

    /// Constraint-based sizing: risk budget, buying power, equity cap.
    fn size_position(
        &self,
        config: &RuntimeConfig,
        input: &GateInput<'_>,
        threshold: f64,
    ) -> GateVerdict {
        let signal = input.signal;
        let entry = signal.entry_ref;
        if entry <= 0.0 || input.equity <= 0.0 {
            return GateVerdict::rejected(RejectReason::BelowMinSize, threshold, "no equity");
        }

        // Risk per share, floored at 1.5% of entry so a tight stop cannot
        // inflate size.
        let raw_risk = (entry - signal.initial_stop).abs();
        let risk_per_share = raw_risk.max(entry * RISK_PER_SHARE_FLOOR_PCT);

        let conf_mult = confidence_multiplier(signal.confidence);
        let regime_mult = input.regime.position_size_multiplier;
        let sent_mult = sentiment_multiplier(input.regime.sentiment_score);

        let dollar_risk = input.equity * config.base_risk_pct * conf_mult * regime_mult * sent_mult;
        let risk_qty = (dollar_risk / risk_per_share).floor();

        let bp_qty = (input.available_buying_power * BUYING_POWER_BUFFER / entry).floor();
        let equity_qty = (input.equity * config.max_position_pct / entry).floor();

        let qty = risk_qty.min(bp_qty).min(equity_qty);

        let min_notional = input.equity * MIN_NOTIONAL_PCT;
        let min_qty = (min_notional / entry).floor().max(1.0);

        let detail = format!(
            "risk_qty={risk_qty} bp_qty={bp_qty} equity_qty={equity_qty} \
             conf_mult={conf_mult:.2} regime_mult={regime_mult:.2} sent_mult={sent_mult:.2}"
        );

        if qty < min_qty {
            // Name the binding constraint so the operator knows what to fix.
            let reason = if bp_qty < risk_qty && bp_qty < equity_qty {
                RejectReason::InsufficientBuyingPower
            } else {
                RejectReason::BelowMinSize
            };
            return GateVerdict::rejected(
                reason,
                threshold,
                format!("{detail} qty={qty} < min {min_qty}"),
            );
        }

        GateVerdict {
            approved: true,
            qty,
            reason: None,
            threshold,
            detail,
        }
    }

    // -------------------------------------------------------------------------
    // Adaptive threshold
    // -------------------------------------------------------------------------

    /// Baseline 60 (long) / 65 (short), adjusted by regime multiplier and
    /// sentiment. Adjustments sum to at most +/-25.
    pub fn adaptive_threshold(&self, side: Side, regime: &RegimeState) -> f64 {
        let base = match side {
            Side::Buy => LONG_THRESHOLD_BASE,
            Side::Sell => SHORT_THRESHOLD_BASE,
        };

        // A hostile regime (small multiplier) demands more conviction.
        let regime_adj = ((1.0 - regime.position_size_multiplier) * 20.0).clamp(-10.0, 15.0);

        // Sentiment extremes demand more conviction against the crowd.
        let s = regime.sentiment_score;
        let sentiment_adj = match side {
            Side::Buy => {
                if s < 25.0 {
                    10.0
                } else if s < 45.0 {
                    5.0
                } else if s > 75.0 {
                    5.0 // euphoria chasing is its own risk
                } else {
                    0.0
                }
            }
            Side::Sell => {
                if s > 75.0 {
                    10.0
                } else if s > 55.0 {
                    5.0
                } else if s < 25.0 {
                    5.0
                } else {
                    0.0
                }
            }
        };

        let adjustment =
            (regime_adj + sentiment_adj).clamp(-MAX_THRESHOLD_ADJUSTMENT, MAX_THRESHOLD_ADJUSTMENT);
        base + adjustment
    }

    // -------------------------------------------------------------------------
    // Cooldowns
    // -------------------------------------------------------------------------

    /// Record a completed exit for cooldown accounting. Consecutive losses
    /// at or above the limit block the symbol for `symbol_cooldown_hours`.
    pub fn record_exit(&self, config: &RuntimeConfig, symbol: &str, pnl: f64, now: DateTime<Utc>) {
        let mut cooldowns = self.cooldowns.write();
        let entry = cooldowns.entry(symbol.to_string()).or_default();

        entry.last_exit = Some(now);
        if pnl < 0.0 {
            entry.consecutive_losses += 1;
            if entry.consecutive_losses >= config.cooldown_loss_limit {
                let hours = config.symbol_cooldown_hours;
                let until = now + Duration::seconds((hours * 3600.0) as i64);
                entry.blocked_until = Some(until);
                warn!(
                    symbol,
                    consecutive_losses = entry.consecutive_losses,
                    until = %until,
                    "symbol cooldown tripped"
                );
            }
        } else {
            entry.consecutive_losses = 0;
            entry.blocked_until = None;
        }
    }

    /// When the symbol is blocked, returns the instant the block lifts.
    fn cooldown_active(&self, symbol: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cooldowns = self.cooldowns.read();
        let entry = cooldowns.get(symbol)?;

        if let Some(until) = entry.blocked_until {
            if now < until {
                return Some(until);
            }
        }
        // Re-entry delay after any exit, win or lose.
        if let Some(last_exit) = entry.last_exit {
            let reentry_at = last_exit + Duration::minutes(REENTRY_DELAY_MIN);
            if now < reentry_at {
                return Some(reentry_at);
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // Per-bar rejection latch
    // -------------------------------------------------------------------------

    /// Flag a terminal executor rejection so the same signal is not retried
    /// within the same bar.
    pub fn flag_rejected_this_bar(&self, symbol: &str, now: DateTime<Utc>) {
        self.rejected_bars
            .write()
            .insert(symbol.to_string(), market_time::minute_bucket(now));
    }

    // -------------------------------------------------------------------------
    // Audit trail
    // -------------------------------------------------------------------------

    fn record_decision(&self, input: &GateInput<'_>, verdict: &GateVerdict) {
        let decision = GateDecision {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: input.signal.symbol.clone(),
            side: input.signal.side,
            approved: verdict.approved,
            qty: verdict.qty,
            confidence: input.signal.confidence,
            threshold: verdict.threshold,
            reason: verdict.reason.map(|r| r.as_str().to_string()),
            detail: verdict.detail.clone(),
            created_at: input.now.to_rfc3339(),
        };

        let mut decisions = self.decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_DECISIONS {
            decisions.remove(0);
        }
    }

    pub fn recent_decisions(&self) -> Vec<GateDecision> {
        self.decisions.read().clone()
    }
}

impl Default for RiskGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGate")
            .field("decisions", &self.decisions.read().len())
            .field("cooldowns", &self.cooldowns.read().len())
            .finish()
    }
}

// =============================================================================
// Multipliers & filters
// =============================================================================

/// Confidence multiplier for dollar risk, bounded [0.8, 1.2].
fn confidence_multiplier(confidence: f64) -> f64 {
    if confidence > 85.0 {
        1.2
    } else if confidence >= 70.0 {
        1.0
    } else {
        0.8
    }
}

/// Sentiment multiplier for dollar risk, bounded [0.7, 1.0]. Extremes cut
/// size; there is no bonus for a comfortable tape.
fn sentiment_multiplier(sentiment: f64) -> f64 {
    if sentiment < 25.0 {
        0.7
    } else if sentiment < 45.0 {
        0.85
    } else if sentiment > 75.0 {
        0.85
    } else {
        1.0
    }
}

/// ADX floor plus a regime-dependent volume-ratio requirement:
/// choppy 1.0x, high-volatility 1.2x, normal 1.5x.
///
/// The strategy enforces its own ADX gate for autonomous signals; the gate
/// re-checks so operator-initiated entries obey the same floor.
fn volatility_filter(config: &RuntimeConfig, input: &GateInput<'_>) -> Option<String> {
    let adx = input.adx.unwrap_or(0.0);
    if adx < config.adx_min {
        return Some(format!("adx {adx:.1} < {:.1}", config.adx_min));
    }

    let required_ratio = if input.regime.regime == MarketRegime::Choppy {
        1.0
    } else if input.regime.vix > 30.0 {
        1.2
    } else {
        1.5
    };

    let ratio = input.volume_ratio.unwrap_or(0.0);
    if ratio < required_ratio {
        return Some(format!(
            "volume ratio {ratio:.1} < required {required_ratio:.1} ({})",
            input.regime.regime
        ));
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// The canonical fresh-long-crossover signal: entry 50.00, stop 48.00
    /// (risk/share 2.00), take-profit 54.00.
    fn signal() -> Signal {
        Signal {
            symbol: "NVDA".into(),
            side: Side::Buy,
            entry_ref: 50.0,
            initial_stop: 48.0,
            take_profit: 54.0,
            confidence: 77.0,
            reasons: vec!["ema crossover buy (spread 0.20%)".into()],
            atr: 0.8,
        }
    }

    fn regime_state(regime: MarketRegime, multiplier: f64, sentiment: f64, vix: f64) -> RegimeState {
        RegimeState {
            regime,
            breadth_score: 0.7,
            trend_strength: 28.0,
            vix,
            position_size_multiplier: multiplier,
            sentiment_score: sentiment,
            sentiment_class: "neutral".into(),
            updated_at: Utc::now(),
        }
    }

    /// Mid-session Eastern time, well before the 15:30 cutoff.
    fn midday() -> DateTime<Utc> {
        // 18:00 UTC == 14:00 ET during DST.
        Utc.with_ymd_and_hms(2026, 3, 16, 18, 0, 0).unwrap()
    }

    fn input<'a>(sig: &'a Signal, regime: &'a RegimeState) -> GateInput<'a> {
        GateInput {
            signal: sig,
            now: midday(),
            market_open: true,
            equity: 100_000.0,
            available_buying_power: 200_000.0,
            open_positions: 0,
            has_position_for_symbol: false,
            trading_enabled: true,
            regime,
            adx: Some(28.0),
            volume_ratio: Some(1.8),
        }
    }

    #[test]
    fn trending_regime_sizes_risk_based_qty() {
        // Equity 100k, base risk 0.5%, regime 1.5x, conf 1.0, sentiment 1.0:
        // floor(100000 * 0.005 * 1.5 / 2.00) = 375 shares. The per-symbol
        // equity cap is lifted here so the risk math is the binding
        // constraint; the default 10% cap is exercised separately below.
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut cfg = RuntimeConfig::default();
        cfg.max_position_pct = 0.25;
        let verdict = gate.evaluate(&cfg, &input(&sig, &regime));

        assert!(verdict.approved, "rejected: {:?} {}", verdict.reason, verdict.detail);
        assert_eq!(verdict.qty, 375.0);
    }

    #[test]
    fn sizing_respects_equity_cap() {
        let gate = RiskGate::new();
        let mut sig = signal();
        // A stop 10 cents away would explode risk-based size; the floor and
        // the 10% equity cap must contain it.
        sig.initial_stop = 49.90;
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let verdict = gate.evaluate(&RuntimeConfig::default(), &input(&sig, &regime));

        assert!(verdict.approved);
        // Equity cap: floor(100000 * 0.10 / 50) = 200 shares.
        assert!(verdict.qty <= 200.0, "qty {} exceeds equity cap", verdict.qty);
        // Sizing cap invariant: qty * entry <= equity * max_position_pct.
        assert!(verdict.qty * sig.entry_ref <= 100_000.0 * 0.10 + 1e-9);
    }

    #[test]
    fn risk_per_share_floor_applies() {
        // Stop 10 cents away, but risk/share floors at 1.5% of 50 = 0.75:
        // risk qty = floor(100000*0.005*1.0/0.75) = 666 -> capped by equity 200.
        let gate = RiskGate::new();
        let mut sig = signal();
        sig.initial_stop = 49.90;
        let regime = regime_state(MarketRegime::BroadNeutral, 1.0, 50.0, 18.0);
        let verdict = gate.evaluate(&RuntimeConfig::default(), &input(&sig, &regime));
        assert!(verdict.approved);
        assert_eq!(verdict.qty, 200.0);
    }

    #[test]
    fn trading_disabled_rejects_everything() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        inp.trading_enabled = false;

        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert_eq!(verdict.reason, Some(RejectReason::TradingDisabled));
    }

    #[test]
    fn market_closed_rejected() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        inp.market_open = false;

        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert_eq!(verdict.reason, Some(RejectReason::MarketClosed));
    }

    #[test]
    fn entry_exactly_at_cutoff_rejected() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        // 19:30 UTC == 15:30 ET during DST: exactly the cutoff minute.
        inp.now = Utc.with_ymd_and_hms(2026, 3, 16, 19, 30, 0).unwrap();

        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert_eq!(verdict.reason, Some(RejectReason::EntryCutoff));
    }

    #[test]
    fn cap_reached_rejected() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        inp.open_positions = 5;

        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert_eq!(verdict.reason, Some(RejectReason::CapReached));
    }

    #[test]
    fn duplicate_symbol_rejected() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        inp.has_position_for_symbol = true;

        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert_eq!(verdict.reason, Some(RejectReason::PositionExists));
    }

    #[test]
    fn consecutive_losses_trip_cooldown() {
        let gate = RiskGate::new();
        let config = RuntimeConfig::default();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let now = midday();

        gate.record_exit(&config, "NVDA", -120.0, now - Duration::hours(1));
        gate.record_exit(&config, "NVDA", -80.0, now - Duration::minutes(50));

        let verdict = gate.evaluate(&config, &input(&sig, &regime));
        assert_eq!(verdict.reason, Some(RejectReason::Cooldown));
    }

    #[test]
    fn win_resets_cooldown_but_reentry_delay_holds() {
        let gate = RiskGate::new();
        let config = RuntimeConfig::default();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let now = midday();

        gate.record_exit(&config, "NVDA", -120.0, now - Duration::hours(3));
        // A win clears the loss streak...
        gate.record_exit(&config, "NVDA", 90.0, now - Duration::minutes(5));

        // ...but five minutes ago is still inside the re-entry delay.
        let verdict = gate.evaluate(&config, &input(&sig, &regime));
        assert_eq!(verdict.reason, Some(RejectReason::Cooldown));

        // After the delay it trades again.
        let mut inp = input(&sig, &regime);
        inp.now = now + Duration::minutes(20);
        let verdict = gate.evaluate(&config, &inp);
        assert!(verdict.approved, "rejected: {:?}", verdict.reason);
    }

    #[test]
    fn below_threshold_rejected() {
        let gate = RiskGate::new();
        let mut sig = signal();
        sig.confidence = 55.0;
        let regime = regime_state(MarketRegime::BroadNeutral, 1.0, 50.0, 18.0);

        let verdict = gate.evaluate(&RuntimeConfig::default(), &input(&sig, &regime));
        assert_eq!(verdict.reason, Some(RejectReason::BelowThreshold));
    }

    #[test]
    fn adaptive_threshold_rises_in_hostile_conditions() {
        let gate = RiskGate::new();

        let easy = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 15.0);
        let hostile = regime_state(MarketRegime::Choppy, 0.25, 15.0, 40.0);

        let easy_t = gate.adaptive_threshold(Side::Buy, &easy);
        let hostile_t = gate.adaptive_threshold(Side::Buy, &hostile);

        // Easy tape relaxes below baseline, hostile tape tightens above it.
        assert!(easy_t < LONG_THRESHOLD_BASE);
        assert!(hostile_t > LONG_THRESHOLD_BASE);
        // Adjustments are bounded.
        assert!(hostile_t <= LONG_THRESHOLD_BASE + MAX_THRESHOLD_ADJUSTMENT);
        assert!(easy_t >= LONG_THRESHOLD_BASE - MAX_THRESHOLD_ADJUSTMENT);
        // Shorts start from the higher baseline.
        assert!(gate.adaptive_threshold(Side::Sell, &easy) >= easy_t + 5.0 - 1e-9);
    }

    #[test]
    fn volume_ratio_requirement_depends_on_regime() {
        let gate = RiskGate::new();
        let config = RuntimeConfig::default();
        let sig = signal();

        // Normal regime needs 1.5x; 1.1x fails.
        let normal = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &normal);
        inp.volume_ratio = Some(1.1);
        assert_eq!(
            gate.evaluate(&config, &inp).reason,
            Some(RejectReason::VolatilityFilter)
        );

        // Choppy regime accepts 1.1x (needs only 1.0x).
        let choppy = regime_state(MarketRegime::Choppy, 0.75, 50.0, 15.0);
        let mut inp = input(&sig, &choppy);
        inp.volume_ratio = Some(1.1);
        assert!(gate.evaluate(&config, &inp).approved);

        // High-volatility tape needs 1.2x.
        let high_vol = regime_state(MarketRegime::NarrowBullish, 0.7, 50.0, 35.0);
        let mut inp = input(&sig, &high_vol);
        inp.volume_ratio = Some(1.1);
        assert_eq!(
            gate.evaluate(&config, &inp).reason,
            Some(RejectReason::VolatilityFilter)
        );
    }

    #[test]
    fn weak_adx_fails_volatility_filter() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        inp.adx = Some(12.0);

        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert_eq!(verdict.reason, Some(RejectReason::VolatilityFilter));
    }

    #[test]
    fn tiny_account_rejected_below_min_size() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadNeutral, 1.0, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        // Equity cap: floor(300 * 0.10 / 50) = 0 shares.
        inp.equity = 300.0;
        inp.available_buying_power = 300.0;
        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert!(!verdict.approved);
        assert_eq!(verdict.reason, Some(RejectReason::BelowMinSize));
    }

    #[test]
    fn exhausted_buying_power_named_as_binding_constraint() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        inp.available_buying_power = 30.0; // bp_qty = 0

        let verdict = gate.evaluate(&RuntimeConfig::default(), &inp);
        assert_eq!(verdict.reason, Some(RejectReason::InsufficientBuyingPower));
    }

    #[test]
    fn per_bar_rejection_latch_blocks_retry() {
        let gate = RiskGate::new();
        let config = RuntimeConfig::default();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let now = midday();

        gate.flag_rejected_this_bar("NVDA", now);

        let verdict = gate.evaluate(&config, &input(&sig, &regime));
        assert_eq!(verdict.reason, Some(RejectReason::RejectedThisBar));

        // Next bar clears the latch.
        let mut inp = input(&sig, &regime);
        inp.now = now + Duration::minutes(1);
        assert!(gate.evaluate(&config, &inp).approved);
    }

    #[test]
    fn decisions_are_recorded_with_stable_reasons() {
        let gate = RiskGate::new();
        let sig = signal();
        let regime = regime_state(MarketRegime::BroadBullish, 1.5, 50.0, 18.0);
        let mut inp = input(&sig, &regime);
        inp.market_open = false;
        gate.evaluate(&RuntimeConfig::default(), &inp);

        let decisions = gate.recent_decisions();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason.as_deref(), Some("market_closed"));
        assert!(!decisions[0].approved);
    }

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(RejectReason::Cooldown.as_str(), "cooldown");
        assert_eq!(RejectReason::BelowThreshold.as_str(), "below_threshold");
        assert_eq!(
            RejectReason::InsufficientBuyingPower.as_str(),
            "insufficient_buying_power"
        );
        assert_eq!(RejectReason::BelowMinSize.as_str(), "below_min_size");
        assert_eq!(RejectReason::MarketClosed.as_str(), "market_closed");
        assert_eq!(RejectReason::EntryCutoff.as_str(), "entry_cutoff");
        assert_eq!(RejectReason::CapReached.as_str(), "cap_reached");
        assert_eq!(RejectReason::VolatilityFilter.as_str(), "volatility_filter");
    }
}
