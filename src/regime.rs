// =============================================================================
// Regime & Sentiment Sensor — classify the tape, scale the risk
// =============================================================================
//
// Classifies the overall market into one of six regimes from three inputs:
// breadth across a small index basket, trend strength (ADX) on the index,
// and a volatility reading (VIX or an ATR-derived proxy).
//
//   trending (ADX >= 20):
//     up   + breadth >= 0.60  => broad_bullish
//     up   + breadth <  0.60  => narrow_bullish
//     down + breadth <= 0.40  => broad_bearish
//     down + breadth >  0.40  => narrow_bearish
//   ranging (ADX < 20):
//     breadth near 0.5        => choppy
//     otherwise               => broad_neutral
//
// Every regime permits trading; none blocks outright. The sensor's job is to
// scale position size and feed the adaptive confidence threshold, not to
// veto entries.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::indicators::{adx, atr, ema};
use crate::market_data::Bar;

/// ADX level separating trending from ranging tape.
const TREND_ADX: f64 = 20.0;
/// Breadth fraction above which an up-trend counts as broad.
const BROAD_BULL_BREADTH: f64 = 0.60;
/// Breadth fraction below which a down-trend counts as broad.
const BROAD_BEAR_BREADTH: f64 = 0.40;
/// Half-width of the breadth band that makes a ranging tape "choppy".
const CHOP_BREADTH_BAND: f64 = 0.15;

// =============================================================================
// Regime
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    BroadBullish,
    BroadBearish,
    BroadNeutral,
    NarrowBullish,
    NarrowBearish,
    Choppy,
}

impl MarketRegime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BroadBullish => "broad_bullish",
            Self::BroadBearish => "broad_bearish",
            Self::BroadNeutral => "broad_neutral",
            Self::NarrowBullish => "narrow_bullish",
            Self::NarrowBearish => "narrow_bearish",
            Self::Choppy => "choppy",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inputs to one classification pass.
#[derive(Debug, Clone, Copy)]
pub struct RegimeInputs {
    /// Fraction of the basket trading above its own trend (0.0–1.0).
    pub breadth: f64,
    /// ADX of the index daily series.
    pub index_adx: f64,
    /// Whether the index daily EMA stack points up.
    pub index_trend_up: bool,
    /// VIX level or a volatility proxy.
    pub vix: f64,
}

/// Current regime snapshot, refreshed on the sensor's own cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: MarketRegime,
    pub breadth_score: f64,
    pub trend_strength: f64,
    pub vix: f64,
    pub position_size_multiplier: f64,
    pub sentiment_score: f64,
    pub sentiment_class: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for RegimeState {
    fn default() -> Self {
        // Until the first real reading arrives: neutral, 1.0x, mid sentiment.
        Self {
            regime: MarketRegime::BroadNeutral,
            breadth_score: 0.5,
            trend_strength: 0.0,
            vix: 20.0,
            position_size_multiplier: 1.0,
            sentiment_score: 50.0,
            sentiment_class: "neutral".to_string(),
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Classify one set of inputs into a regime.
pub fn classify(inputs: &RegimeInputs) -> MarketRegime {
    if inputs.index_adx >= TREND_ADX {
        if inputs.index_trend_up {
            if inputs.breadth >= BROAD_BULL_BREADTH {
                MarketRegime::BroadBullish
            } else {
                MarketRegime::NarrowBullish
            }
        } else if inputs.breadth <= BROAD_BEAR_BREADTH {
            MarketRegime::BroadBearish
        } else {
            MarketRegime::NarrowBearish
        }
    } else if (inputs.breadth - 0.5).abs() < CHOP_BREADTH_BAND {
        MarketRegime::Choppy
    } else {
        MarketRegime::BroadNeutral
    }
}

/// Position-size multiplier for a regime. Choppy scales with volatility:
/// calm chop is tradable at reduced size, violent chop barely at all.
pub fn position_multiplier(regime: MarketRegime, vix: f64) -> f64 {
    match regime {
        MarketRegime::BroadBullish | MarketRegime::BroadBearish => 1.5,
        MarketRegime::BroadNeutral => 1.0,
        MarketRegime::NarrowBullish | MarketRegime::NarrowBearish => 0.7,
        MarketRegime::Choppy => {
            if vix < 20.0 {
                0.75
            } else if vix <= 30.0 {
                0.5
            } else {
                0.25
            }
        }
    }
}

/// Fear/greed score 0–100 from breadth, trend direction, and volatility.
pub fn sentiment_score(inputs: &RegimeInputs) -> f64 {
    let breadth_part = (inputs.breadth - 0.5) * 60.0;
    let trend_part = if inputs.index_trend_up { 10.0 } else { -10.0 };
    // VIX 20 is the pivot: calm adds greed, stress adds fear.
    let vol_part = (20.0 - inputs.vix) * 1.5;

    (50.0 + breadth_part + trend_part + vol_part).clamp(0.0, 100.0)
}

/// Label for a sentiment score.
pub fn sentiment_class(score: f64) -> &'static str {
    if score < 25.0 {
        "extreme_fear"
    } else if score < 45.0 {
        "fear"
    } else if score <= 55.0 {
        "neutral"
    } else if score <= 75.0 {
        "greed"
    } else {
        "extreme_greed"
    }
}

// =============================================================================
// Input derivation from daily bars
// =============================================================================

/// Fraction of basket members whose last close sits above their 20-day EMA.
///
/// Members with too little history are skipped; an empty basket reads 0.5
/// (no information, not bearishness).
pub fn compute_breadth(basket: &[Vec<Bar>]) -> f64 {
    let mut counted = 0usize;
    let mut above = 0usize;

    for series in basket {
        let closes: Vec<f64> = series.iter().map(|b| b.close).collect();
        let ema20 = ema::calculate_ema(&closes, 20);
        if let (Some(&last_ema), Some(&last_close)) = (ema20.last(), closes.last()) {
            counted += 1;
            if last_close > last_ema {
                above += 1;
            }
        }
    }

    if counted == 0 {
        0.5
    } else {
        above as f64 / counted as f64
    }
}

/// Whether the index daily EMA9 sits above EMA21.
pub fn index_trend_up(index_daily: &[Bar]) -> Option<bool> {
    let closes: Vec<f64> = index_daily.iter().map(|b| b.close).collect();
    let e9 = *ema::calculate_ema(&closes, 9).last()?;
    let e21 = *ema::calculate_ema(&closes, 21).last()?;
    Some(e9 > e21)
}

/// VIX-like proxy when no volatility index feed is configured: daily ATR as
/// a percent of price, annualised (~sqrt of 252 trading days).
pub fn volatility_proxy(index_daily: &[Bar]) -> Option<f64> {
    let atr_pct = atr::calculate_atr_pct(index_daily, 14)?;
    Some(atr_pct * (252.0_f64).sqrt())
}

// =============================================================================
// Sensor
// =============================================================================

/// Thread-safe holder of the latest regime reading.
pub struct RegimeSensor {
    state: RwLock<RegimeState>,
}

impl RegimeSensor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegimeState::default()),
        }
    }

    /// Run one classification pass and store the result.
    pub fn update(&self, inputs: &RegimeInputs) -> RegimeState {
        let regime = classify(inputs);
        let multiplier = position_multiplier(regime, inputs.vix);
        let score = sentiment_score(inputs);

        let new_state = RegimeState {
            regime,
            breadth_score: inputs.breadth,
            trend_strength: inputs.index_adx,
            vix: inputs.vix,
            position_size_multiplier: multiplier,
            sentiment_score: score,
            sentiment_class: sentiment_class(score).to_string(),
            updated_at: Utc::now(),
        };

        let mut guard = self.state.write();
        if guard.regime != regime {
            info!(
                old = %guard.regime,
                new = %regime,
                breadth = inputs.breadth,
                adx = inputs.index_adx,
                vix = inputs.vix,
                multiplier,
                "market regime changed"
            );
        } else {
            debug!(regime = %regime, multiplier, "regime refreshed");
        }
        *guard = new_state.clone();

        new_state
    }

    /// Derive inputs from daily bar series and update.
    ///
    /// Returns `None` (state untouched) when the index series is too short
    /// to read a trend.
    pub fn update_from_bars(&self, index_daily: &[Bar], basket: &[Vec<Bar>]) -> Option<RegimeState> {
        let trend_up = index_trend_up(index_daily)?;
        let index_adx = adx::calculate_adx(index_daily, 14).map(|a| a.adx)?;
        let vix = volatility_proxy(index_daily).unwrap_or(20.0);
        let breadth = compute_breadth(basket);

        Some(self.update(&RegimeInputs {
            breadth,
            index_adx,
            index_trend_up: trend_up,
            vix,
        }))
    }

    pub fn current(&self) -> RegimeState {
        self.state.read().clone()
    }
}

impl Default for RegimeSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegimeSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RegimeSensor")
            .field("regime", &state.regime)
            .field("multiplier", &state.position_size_multiplier)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(breadth: f64, adx: f64, up: bool, vix: f64) -> RegimeInputs {
        RegimeInputs {
            breadth,
            index_adx: adx,
            index_trend_up: up,
            vix,
        }
    }

    // ---- classification --------------------------------------------------

    #[test]
    fn broad_bullish_needs_trend_and_breadth() {
        assert_eq!(classify(&inputs(0.8, 28.0, true, 18.0)), MarketRegime::BroadBullish);
    }

    #[test]
    fn narrow_bullish_on_weak_breadth() {
        assert_eq!(classify(&inputs(0.45, 28.0, true, 18.0)), MarketRegime::NarrowBullish);
    }

    #[test]
    fn broad_and_narrow_bearish() {
        assert_eq!(classify(&inputs(0.2, 30.0, false, 22.0)), MarketRegime::BroadBearish);
        assert_eq!(classify(&inputs(0.55, 30.0, false, 22.0)), MarketRegime::NarrowBearish);
    }

    #[test]
    fn weak_adx_with_split_breadth_is_choppy() {
        assert_eq!(classify(&inputs(0.5, 12.0, true, 25.0)), MarketRegime::Choppy);
        assert_eq!(classify(&inputs(0.6, 12.0, true, 25.0)), MarketRegime::Choppy);
    }

    #[test]
    fn weak_adx_with_lopsided_breadth_is_neutral() {
        assert_eq!(classify(&inputs(0.8, 12.0, true, 25.0)), MarketRegime::BroadNeutral);
        assert_eq!(classify(&inputs(0.2, 12.0, false, 25.0)), MarketRegime::BroadNeutral);
    }

    // ---- multipliers -----------------------------------------------------

    #[test]
    fn multiplier_table() {
        assert_eq!(position_multiplier(MarketRegime::BroadBullish, 20.0), 1.5);
        assert_eq!(position_multiplier(MarketRegime::BroadBearish, 20.0), 1.5);
        assert_eq!(position_multiplier(MarketRegime::BroadNeutral, 20.0), 1.0);
        assert_eq!(position_multiplier(MarketRegime::NarrowBullish, 20.0), 0.7);
        assert_eq!(position_multiplier(MarketRegime::NarrowBearish, 20.0), 0.7);
    }

    #[test]
    fn choppy_multiplier_scales_with_vix() {
        assert_eq!(position_multiplier(MarketRegime::Choppy, 15.0), 0.75);
        assert_eq!(position_multiplier(MarketRegime::Choppy, 20.0), 0.5);
        assert_eq!(position_multiplier(MarketRegime::Choppy, 25.0), 0.5);
        assert_eq!(position_multiplier(MarketRegime::Choppy, 30.0), 0.5);
        assert_eq!(position_multiplier(MarketRegime::Choppy, 35.0), 0.25);
        assert_eq!(position_multiplier(MarketRegime::Choppy, 50.0), 0.25);
    }

    // ---- sentiment -------------------------------------------------------

    #[test]
    fn sentiment_is_bounded() {
        for breadth in [0.0, 0.5, 1.0] {
            for vix in [10.0, 20.0, 50.0, 90.0] {
                for up in [true, false] {
                    let s = sentiment_score(&inputs(breadth, 25.0, up, vix));
                    assert!((0.0..=100.0).contains(&s), "score {s} out of range");
                }
            }
        }
    }

    #[test]
    fn calm_broad_advance_reads_greedy() {
        let s = sentiment_score(&inputs(0.9, 30.0, true, 12.0));
        assert!(s > 75.0, "expected extreme greed, got {s}");
        assert_eq!(sentiment_class(s), "extreme_greed");
    }

    #[test]
    fn violent_selloff_reads_fearful() {
        let s = sentiment_score(&inputs(0.1, 30.0, false, 45.0));
        assert!(s < 25.0, "expected extreme fear, got {s}");
        assert_eq!(sentiment_class(s), "extreme_fear");
    }

    #[test]
    fn sentiment_class_boundaries() {
        assert_eq!(sentiment_class(10.0), "extreme_fear");
        assert_eq!(sentiment_class(30.0), "fear");
        assert_eq!(sentiment_class(50.0), "neutral");
        assert_eq!(sentiment_class(70.0), "greed");
        assert_eq!(sentiment_class(90.0), "extreme_greed");
    }

    // ---- sensor ----------------------------------------------------------

    #[test]
    fn sensor_update_stores_state() {
        let sensor = RegimeSensor::new();
        let state = sensor.update(&inputs(0.8, 28.0, true, 15.0));
        assert_eq!(state.regime, MarketRegime::BroadBullish);
        assert_eq!(state.position_size_multiplier, 1.5);

        let current = sensor.current();
        assert_eq!(current.regime, MarketRegime::BroadBullish);
        assert_eq!(current.sentiment_class, sentiment_class(current.sentiment_score));
    }

    #[test]
    fn default_state_is_neutral_one_x() {
        let sensor = RegimeSensor::new();
        let state = sensor.current();
        assert_eq!(state.regime, MarketRegime::BroadNeutral);
        assert_eq!(state.position_size_multiplier, 1.0);
    }

    // ---- breadth helper --------------------------------------------------

    #[test]
    fn breadth_counts_members_above_trend() {
        use chrono::TimeZone;
        let rising: Vec<Bar> = (0..40)
            .map(|i| {
                let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::days(i);
                let p = 100.0 + i as f64;
                Bar::new(ts, p, p + 1.0, p - 1.0, p, 1000.0)
            })
            .collect();
        let falling: Vec<Bar> = (0..40)
            .map(|i| {
                let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::days(i);
                let p = 200.0 - i as f64;
                Bar::new(ts, p, p + 1.0, p - 1.0, p, 1000.0)
            })
            .collect();

        let breadth = compute_breadth(&[rising.clone(), rising, falling]);
        assert!((breadth - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn breadth_of_empty_basket_is_half() {
        assert_eq!(compute_breadth(&[]), 0.5);
    }
}
