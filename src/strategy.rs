// =============================================================================
// Signal Strategy — EMA crossover with momentum confirmation
// =============================================================================
//
// A signal is emitted when, and only when, a fresh EMA crossover confirms
// with supporting evidence:
//
//   long:  prev_ema_short <= prev_ema_long  AND  ema_short > ema_long
//          AND ema_diff_pct in [0.05, 1.0] %   (fresh or developing, never
//          extended)
//          AND adx >= adx_min
//          AND (optionally) daily EMA9 > EMA21
//   short: the exact mirror, gated by long_only_mode.
//
// For each signal the strategy proposes the entry reference, the protective
// stop (the wider of the percent floor and the ATR stop), the take-profit,
// and a confidence figure with bounded entry-quality adjustments. Everything
// that fails a condition is a rejection with an enumerated reason, not a
// signal.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::market_data::Features;
use crate::trend_filter::DailyTrend;
use crate::types::Side;

/// Minimum EMA spread for a crossover to count (percent).
const MIN_SPREAD_PCT: f64 = 0.05;
/// Spread above which the crossover is extended and must not be chased.
const MAX_SPREAD_PCT: f64 = 1.0;
/// VWAP proximity band for the entry-quality bonus (fraction of VWAP).
const VWAP_PROXIMITY: f64 = 0.005;
/// Entry-quality adjustments are bounded to this magnitude in total.
const MAX_ADJUSTMENT: f64 = 25.0;

// =============================================================================
// Signal
// =============================================================================

/// A fully formed entry proposal, ready for the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Latest trade price snapshot the levels were computed against.
    pub entry_ref: f64,
    pub initial_stop: f64,
    pub take_profit: f64,
    /// 0–100 after entry-quality adjustments.
    pub confidence: f64,
    /// Human-readable evidence trail.
    pub reasons: Vec<String>,
    /// ATR at signal time; the position manager reuses it for trailing.
    pub atr: f64,
}

impl Signal {
    /// Initial reward-to-risk ratio.
    pub fn risk_reward(&self) -> f64 {
        let risk = (self.entry_ref - self.initial_stop).abs();
        if risk <= 0.0 {
            return 0.0;
        }
        (self.take_profit - self.entry_ref).abs() / risk
    }
}

/// Why a symbol did not signal. Enumerated so the gate, logs, and API all
/// speak the same strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRejection {
    InsufficientHistory,
    NoCrossover,
    BoundsNotMet,
    ExtendedCrossover,
    WeakTrend,
    ShortsDisabled,
    DailyMisaligned,
    RrBelowFloor,
}

impl SignalRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientHistory => "insufficient_history",
            Self::NoCrossover => "no_crossover",
            Self::BoundsNotMet => "bounds_not_met",
            Self::ExtendedCrossover => "extended_crossover",
            Self::WeakTrend => "weak_trend",
            Self::ShortsDisabled => "shorts_disabled",
            Self::DailyMisaligned => "daily_misaligned",
            Self::RrBelowFloor => "rr_below_floor",
        }
    }
}

impl std::fmt::Display for SignalRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Strategy
// =============================================================================

pub struct CrossoverStrategy;

impl CrossoverStrategy {
    /// Evaluate one feature snapshot. `daily_trend` is `None` when no daily
    /// history is cached; the alignment filter is waived in that case rather
    /// than blocking the whole session.
    pub fn evaluate(
        features: &Features,
        daily_trend: Option<&DailyTrend>,
        config: &RuntimeConfig,
    ) -> Result<Signal, SignalRejection> {
        if !features.is_valid() {
            return Err(SignalRejection::InsufficientHistory);
        }

        // These unwraps are guarded by is_valid() above.
        let ema_short = features.ema_short.unwrap_or_default();
        let ema_long = features.ema_long.unwrap_or_default();
        let prev_short = features.prev_ema_short.unwrap_or_default();
        let prev_long = features.prev_ema_long.unwrap_or_default();
        let atr = features.atr.unwrap_or_default();
        let adx = features.adx.unwrap_or_default();

        // ── 1. Crossover detection ───────────────────────────────────────
        let side = if prev_short <= prev_long && ema_short > ema_long {
            Side::Buy
        } else if prev_short >= prev_long && ema_short < ema_long {
            Side::Sell
        } else {
            return Err(SignalRejection::NoCrossover);
        };

        if side == Side::Sell && config.long_only_mode {
            return Err(SignalRejection::ShortsDisabled);
        }

        // ── 2. Spread bounds: fresh or developing, never extended ───────
        let spread = features
            .ema_diff_pct
            .ok_or(SignalRejection::InsufficientHistory)?;
        let spread_abs = spread.abs();
        if spread_abs < MIN_SPREAD_PCT {
            return Err(SignalRejection::BoundsNotMet);
        }
        if spread_abs > MAX_SPREAD_PCT {
            debug!(
                symbol = %features.symbol,
                spread_pct = spread_abs,
                "crossover extended — not chasing"
            );
            return Err(SignalRejection::ExtendedCrossover);
        }

        // ── 3. Trend strength ────────────────────────────────────────────
        if adx < config.adx_min {
            return Err(SignalRejection::WeakTrend);
        }

        // ── 4. Daily alignment (optional) ────────────────────────────────
        let daily_aligned = match daily_trend {
            Some(trend) => {
                if config.require_daily_alignment && !trend.supports(side) {
                    return Err(SignalRejection::DailyMisaligned);
                }
                trend.supports(side)
            }
            None => false,
        };

        // ── 5. Levels: stop is the WIDER of the floor and the ATR stop ──
        let entry_ref = features.price;
        if entry_ref <= 0.0 || atr <= 0.0 {
            return Err(SignalRejection::InsufficientHistory);
        }

        let floor_dist = entry_ref * config.min_stop_pct;
        let atr_dist = atr * config.stop_atr_mult;
        let stop_dist = floor_dist.max(atr_dist);
        let tp_dist = atr * config.tp_atr_mult;

        let (initial_stop, take_profit) = match side {
            Side::Buy => (entry_ref - stop_dist, entry_ref + tp_dist),
            Side::Sell => (entry_ref + stop_dist, entry_ref - tp_dist),
        };

        // ── 6. R:R floor ─────────────────────────────────────────────────
        let rr = tp_dist / stop_dist;
        if rr < config.rr_min {
            return Err(SignalRejection::RrBelowFloor);
        }

        // ── 7. Confidence with bounded entry-quality adjustments ────────
        let mut reasons = vec![format!(
            "ema crossover {} (spread {:.2}%)",
            side, spread_abs
        )];
        reasons.push(format!("adx {:.1}", adx));
        if let Some(ratio) = features.volume_ratio {
            reasons.push(format!("volume ratio {:.1}x", ratio));
        }

        let mut adjustment: f64 = 0.0;
        if let Some(vwap) = features.vwap {
            if vwap > 0.0 && ((entry_ref - vwap) / vwap).abs() < VWAP_PROXIMITY {
                adjustment += 5.0;
                reasons.push("near VWAP".to_string());
            }
        }
        if daily_aligned {
            adjustment += 10.0;
            reasons.push("daily trend aligned".to_string());
        }
        adjustment = adjustment.clamp(-MAX_ADJUSTMENT, MAX_ADJUSTMENT);

        let confidence = (features.confidence_score + adjustment).clamp(0.0, 100.0);

        let signal = Signal {
            symbol: features.symbol.clone(),
            side,
            entry_ref,
            initial_stop,
            take_profit,
            confidence,
            reasons,
            atr,
        };

        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            entry_ref = signal.entry_ref,
            stop = signal.initial_stop,
            take_profit = signal.take_profit,
            rr = format!("{:.2}", signal.risk_reward()),
            confidence = format!("{:.0}", signal.confidence),
            "signal generated"
        );

        Ok(signal)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Feature snapshot matching the canonical fresh-long-crossover setup:
    /// price 50.00, EMAs 50.10/50.00 with previous 49.95/50.00, ATR 0.80,
    /// ADX 28, RSI 58, volume ratio 1.8.
    fn crossover_features() -> Features {
        Features {
            symbol: "NVDA".into(),
            ts: Utc::now(),
            price: 50.0,
            ema_short: Some(50.10),
            ema_long: Some(50.00),
            prev_ema_short: Some(49.95),
            prev_ema_long: Some(50.00),
            ema_diff_pct: Some((50.10f64 / 50.00 - 1.0) * 100.0),
            atr: Some(0.80),
            rsi: Some(58.0),
            macd: Some(0.05),
            macd_signal: Some(0.02),
            macd_hist: Some(0.03),
            adx: Some(28.0),
            plus_di: Some(28.0),
            minus_di: Some(12.0),
            vwap: Some(49.99),
            obv: Some(10_000.0),
            volume: 1800.0,
            volume_avg: Some(1000.0),
            volume_ratio: Some(1.8),
            volume_zscore: Some(2.1),
            regime: "broad_bullish".into(),
            confidence_score: 72.0,
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[test]
    fn fresh_long_crossover_signals_with_atr_stop() {
        let features = crossover_features();
        let signal = CrossoverStrategy::evaluate(&features, None, &config()).unwrap();

        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.entry_ref, 50.0);
        // Stop: wider of 50*(1-0.015)=49.25 and 50-2.5*0.8=48.00 — ATR wins.
        assert!((signal.initial_stop - 48.0).abs() < 1e-10);
        // TP: 50 + 5.0*0.8 = 54.00, R:R = 4.0/2.0 = 2.0.
        assert!((signal.take_profit - 54.0).abs() < 1e-10);
        assert!((signal.risk_reward() - 2.0).abs() < 1e-10);
        // Near-VWAP bonus applies on top of the composite.
        assert!((signal.confidence - 77.0).abs() < 1e-10);
    }

    #[test]
    fn percent_floor_wins_when_atr_is_tight() {
        let mut features = crossover_features();
        features.atr = Some(0.10); // ATR stop 0.25 < 1.5% floor 0.75
        // Widen TP multiple so R:R still clears the floor.
        let mut cfg = config();
        cfg.tp_atr_mult = 20.0;

        let signal = CrossoverStrategy::evaluate(&features, None, &cfg).unwrap();
        assert!((signal.initial_stop - 49.25).abs() < 1e-10);
    }

    #[test]
    fn extended_crossover_rejected() {
        let mut features = crossover_features();
        features.ema_diff_pct = Some(1.4);
        let err = CrossoverStrategy::evaluate(&features, None, &config()).unwrap_err();
        assert_eq!(err, SignalRejection::ExtendedCrossover);
    }

    #[test]
    fn flat_spread_rejected_as_bounds() {
        let mut features = crossover_features();
        features.ema_diff_pct = Some(0.01);
        let err = CrossoverStrategy::evaluate(&features, None, &config()).unwrap_err();
        assert_eq!(err, SignalRejection::BoundsNotMet);
    }

    #[test]
    fn weak_adx_rejected() {
        let mut features = crossover_features();
        features.adx = Some(15.0);
        let err = CrossoverStrategy::evaluate(&features, None, &config()).unwrap_err();
        assert_eq!(err, SignalRejection::WeakTrend);
    }

    #[test]
    fn no_crossover_when_already_above() {
        let mut features = crossover_features();
        // Short EMA was already above long on the previous bar.
        features.prev_ema_short = Some(50.05);
        features.prev_ema_long = Some(50.00);
        let err = CrossoverStrategy::evaluate(&features, None, &config()).unwrap_err();
        assert_eq!(err, SignalRejection::NoCrossover);
    }

    #[test]
    fn insufficient_history_rejected() {
        let mut features = crossover_features();
        features.adx = None;
        let err = CrossoverStrategy::evaluate(&features, None, &config()).unwrap_err();
        assert_eq!(err, SignalRejection::InsufficientHistory);
    }

    #[test]
    fn short_crossover_blocked_in_long_only_mode() {
        let mut features = crossover_features();
        // Mirror: short crosses below long.
        features.ema_short = Some(49.90);
        features.ema_long = Some(50.00);
        features.prev_ema_short = Some(50.05);
        features.prev_ema_long = Some(50.00);
        features.ema_diff_pct = Some((49.90f64 / 50.00 - 1.0) * 100.0);

        let err = CrossoverStrategy::evaluate(&features, None, &config()).unwrap_err();
        assert_eq!(err, SignalRejection::ShortsDisabled);
    }

    #[test]
    fn short_crossover_mirrors_levels_when_enabled() {
        let mut features = crossover_features();
        features.ema_short = Some(49.90);
        features.ema_long = Some(50.00);
        features.prev_ema_short = Some(50.05);
        features.prev_ema_long = Some(50.00);
        features.ema_diff_pct = Some((49.90f64 / 50.00 - 1.0) * 100.0);

        let mut cfg = config();
        cfg.long_only_mode = false;

        let signal = CrossoverStrategy::evaluate(&features, None, &cfg).unwrap();
        assert_eq!(signal.side, Side::Sell);
        assert!((signal.initial_stop - 52.0).abs() < 1e-10); // 50 + 2.0
        assert!((signal.take_profit - 46.0).abs() < 1e-10); // 50 - 4.0
    }

    #[test]
    fn daily_misalignment_blocks_when_required() {
        let features = crossover_features();
        let bearish_daily = DailyTrend {
            symbol: "NVDA".into(),
            bullish: false,
            ema_sep_pct: -0.8,
            bars_used: 60,
        };

        let err =
            CrossoverStrategy::evaluate(&features, Some(&bearish_daily), &config()).unwrap_err();
        assert_eq!(err, SignalRejection::DailyMisaligned);
    }

    #[test]
    fn daily_alignment_adds_bounded_bonus() {
        let features = crossover_features();
        let bullish_daily = DailyTrend {
            symbol: "NVDA".into(),
            bullish: true,
            ema_sep_pct: 0.8,
            bars_used: 60,
        };

        let signal =
            CrossoverStrategy::evaluate(&features, Some(&bullish_daily), &config()).unwrap();
        // +5 VWAP +10 alignment on top of the 72 composite.
        assert!((signal.confidence - 87.0).abs() < 1e-10);
        assert!(signal.reasons.iter().any(|r| r.contains("daily trend")));
    }

    #[test]
    fn rr_floor_rejects_thin_targets() {
        let features = crossover_features();
        let mut cfg = config();
        cfg.rr_min = 2.5; // S1 geometry yields exactly 2.0
        let err = CrossoverStrategy::evaluate(&features, None, &cfg).unwrap_err();
        assert_eq!(err, SignalRejection::RrBelowFloor);
    }

    #[test]
    fn rejection_reason_strings_are_stable() {
        assert_eq!(SignalRejection::ExtendedCrossover.as_str(), "extended_crossover");
        assert_eq!(SignalRejection::WeakTrend.as_str(), "weak_trend");
        assert_eq!(SignalRejection::InsufficientHistory.as_str(), "insufficient_history");
        assert_eq!(SignalRejection::RrBelowFloor.to_string(), "rr_below_floor");
    }
}
