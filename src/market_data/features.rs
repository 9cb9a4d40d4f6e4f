// =============================================================================
// Feature Engine — per-symbol technical snapshot
// =============================================================================
//
// Consumes the cached minute bars for one symbol and produces an immutable
// `Features` record: EMAs (with previous values for crossover detection),
// Wilder ATR, RSI, MACD, ADX with ±DI, session-anchored VWAP, OBV, rolling
// volume statistics, and a 0–100 confidence composite.
//
// Indicators that need more history than available are `None`; callers check
// `is_valid()` before evaluating signals and must treat an invalid snapshot
// as insufficient, never as zero.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfidenceWeights;
use crate::indicators::{adx, atr, ema, macd, obv, rsi, volume, vwap};
use crate::market_data::Bar;
use crate::market_time;

/// Longest look-back any indicator needs: MACD(12,26,9) wants 34 closes,
/// ADX(14) wants 29 bars. One extra close feeds the previous-EMA pair.
const MIN_BARS_FOR_FULL_SNAPSHOT: usize = 35;

const ATR_PERIOD: usize = 14;
const RSI_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;
const VOLUME_PERIOD: usize = 20;

// =============================================================================
// Features
// =============================================================================

/// Immutable per-symbol feature snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub price: f64,

    pub ema_short: Option<f64>,
    pub ema_long: Option<f64>,
    pub prev_ema_short: Option<f64>,
    pub prev_ema_long: Option<f64>,
    /// `(ema_short / ema_long - 1) * 100`.
    pub ema_diff_pct: Option<f64>,

    pub atr: Option<f64>,
    pub rsi: Option<f64>,

    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,

    pub adx: Option<f64>,
    pub plus_di: Option<f64>,
    pub minus_di: Option<f64>,

    pub vwap: Option<f64>,
    pub obv: Option<f64>,

    pub volume: f64,
    pub volume_avg: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub volume_zscore: Option<f64>,

    /// Regime label active when the snapshot was computed.
    pub regime: String,

    /// 0–100 composite; see `confidence_score`.
    pub confidence_score: f64,
}

impl Features {
    /// Whether the snapshot carries everything signal evaluation needs.
    pub fn is_valid(&self) -> bool {
        self.ema_short.is_some()
            && self.ema_long.is_some()
            && self.prev_ema_short.is_some()
            && self.prev_ema_long.is_some()
            && self.atr.is_some()
            && self.adx.is_some()
    }
}

// =============================================================================
// FeatureEngine
// =============================================================================

pub struct FeatureEngine;

impl FeatureEngine {
    /// Compute a feature snapshot from minute bars (oldest first).
    ///
    /// Returns `None` only for an empty series; a short series yields a
    /// snapshot with missing fields and `is_valid() == false`.
    pub fn compute(
        symbol: &str,
        bars: &[Bar],
        ema_short_period: usize,
        ema_long_period: usize,
        regime: &str,
        weights: &ConfidenceWeights,
    ) -> Option<Features> {
        let last = bars.last()?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let ema_short_pair = ema::last_pair(&closes, ema_short_period);
        let ema_long_pair = ema::last_pair(&closes, ema_long_period);

        let (prev_ema_short, ema_short) = match ema_short_pair {
            Some((p, c)) => (Some(p), Some(c)),
            None => (None, None),
        };
        let (prev_ema_long, ema_long) = match ema_long_pair {
            Some((p, c)) => (Some(p), Some(c)),
            None => (None, None),
        };

        let ema_diff_pct = match (ema_short, ema_long) {
            (Some(s), Some(l)) => ema::spread_pct(s, l),
            _ => None,
        };

        let atr_val = atr::calculate_atr(bars, ATR_PERIOD);
        let rsi_val = rsi::current_rsi(&closes, RSI_PERIOD);
        let macd_val = macd::calculate(&closes);
        let adx_val = adx::calculate_adx(bars, ADX_PERIOD);

        // VWAP anchors at the session open: only bars sharing the last bar's
        // Eastern trading date participate.
        let session_date = market_time::trading_date(last.ts);
        let session_bars: Vec<Bar> = bars
            .iter()
            .filter(|b| market_time::trading_date(b.ts) == session_date)
            .copied()
            .collect();
        let vwap_val = vwap::calculate_vwap(&session_bars);

        let obv_val = obv::calculate_obv(bars);
        let vol_stats = volume::calculate_volume_stats(&volumes, VOLUME_PERIOD);

        let mut features = Features {
            symbol: symbol.to_string(),
            ts: last.ts,
            price: last.close,
            ema_short,
            ema_long,
            prev_ema_short,
            prev_ema_long,
            ema_diff_pct,
            atr: atr_val,
            rsi: rsi_val,
            macd: macd_val.map(|m| m.macd),
            macd_signal: macd_val.map(|m| m.signal),
            macd_hist: macd_val.map(|m| m.histogram),
            adx: adx_val.map(|a| a.adx),
            plus_di: adx_val.map(|a| a.plus_di),
            minus_di: adx_val.map(|a| a.minus_di),
            vwap: vwap_val,
            obv: obv_val,
            volume: last.volume,
            volume_avg: vol_stats.map(|v| v.average),
            volume_ratio: vol_stats.map(|v| v.ratio),
            volume_zscore: vol_stats.map(|v| v.zscore),
            regime: regime.to_string(),
            confidence_score: 0.0,
        };

        features.confidence_score = confidence_score(&features, weights);
        Some(features)
    }

    /// The minimum bar count for a fully populated snapshot.
    pub fn min_bars() -> usize {
        MIN_BARS_FOR_FULL_SNAPSHOT
    }
}

// =============================================================================
// Confidence composite
// =============================================================================

/// Blend the component scores into a 0–100 composite using the configured
/// weights. Missing components score a neutral 50 so a thin snapshot neither
/// inflates nor tanks the result.
pub fn confidence_score(features: &Features, weights: &ConfidenceWeights) -> f64 {
    let technical = technical_score(features);
    let momentum = momentum_score(features);
    let vol = volume_score(features);
    let volatility = volatility_score(features);
    let regime = regime_alignment_score(&features.regime);

    let weight_sum =
        weights.technical + weights.momentum + weights.volume + weights.volatility + weights.regime;
    if weight_sum <= 0.0 {
        return 50.0;
    }

    let blended = (technical * weights.technical
        + momentum * weights.momentum
        + vol * weights.volume
        + volatility * weights.volatility
        + regime * weights.regime)
        / weight_sum;

    blended.clamp(0.0, 100.0)
}

/// Trend strength (ADX), crossover freshness (EMA spread), RSI zone.
fn technical_score(f: &Features) -> f64 {
    let adx_part = match f.adx {
        Some(adx) => (adx / 50.0).min(1.0) * 40.0,
        None => 20.0,
    };

    let spread_part = match f.ema_diff_pct {
        Some(diff) => {
            let abs = diff.abs();
            if (0.05..=0.3).contains(&abs) {
                30.0 // fresh crossover zone
            } else if abs <= 1.0 {
                20.0 // developing
            } else {
                5.0 // extended
            }
        }
        None => 15.0,
    };

    let rsi_part = match f.rsi {
        Some(rsi) => {
            if (45.0..=65.0).contains(&rsi) {
                30.0
            } else if (40.0..=70.0).contains(&rsi) {
                20.0
            } else {
                5.0 // overbought / oversold
            }
        }
        None => 15.0,
    };

    adx_part + spread_part + rsi_part
}

/// MACD histogram sign and magnitude, normalised by ATR.
fn momentum_score(f: &Features) -> f64 {
    match (f.macd_hist, f.atr) {
        (Some(hist), Some(atr)) if atr > 0.0 => {
            let magnitude = (hist.abs() / atr).min(1.0) * 50.0;
            if hist >= 0.0 {
                50.0 + magnitude
            } else {
                50.0 - magnitude
            }
        }
        _ => 50.0,
    }
}

/// Volume-burst ladder over the 20-period ratio.
fn volume_score(f: &Features) -> f64 {
    match f.volume_ratio {
        Some(ratio) if ratio >= 2.0 => 100.0,
        Some(ratio) if ratio >= 1.5 => 75.0,
        Some(ratio) if ratio >= 1.2 => 55.0,
        Some(ratio) if ratio >= 1.0 => 40.0,
        Some(_) => 20.0,
        None => 50.0,
    }
}

/// ATR as a percent of price: tradable volatility sits in a band. Too quiet
/// offers no edge, too wild blows through stops.
fn volatility_score(f: &Features) -> f64 {
    match f.atr {
        Some(atr) if f.price > 0.0 => {
            let atr_pct = atr / f.price * 100.0;
            if (0.5..=3.0).contains(&atr_pct) {
                100.0
            } else if (0.2..0.5).contains(&atr_pct) {
                60.0
            } else if (3.0..5.0).contains(&atr_pct) {
                50.0
            } else {
                25.0
            }
        }
        _ => 50.0,
    }
}

/// Long-bias regime alignment (the gate re-checks short entries separately).
fn regime_alignment_score(regime: &str) -> f64 {
    match regime {
        "broad_bullish" => 100.0,
        "narrow_bullish" => 70.0,
        "broad_neutral" => 50.0,
        "choppy" => 35.0,
        "narrow_bearish" => 30.0,
        "broad_bearish" => 20.0,
        _ => 50.0,
    }
}
