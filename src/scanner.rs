// =============================================================================
// Opportunity Scanner — score the universe, emit the watchlist
// =============================================================================
//
// Scores candidate symbols 0–110 from their feature snapshots and recent
// bars, grades them, and emits an ordered watchlist of the top N. Refreshes
// are cadence-limited; when a refresh fails the scanner keeps serving the
// last good list rather than emptying the watchlist mid-session.
//
// Score components (base 0–100):
//   volume          0–25   volume-ratio ladder
//   trend strength  0–20   ADX + RSI zone
//   breakout        0–20   crossover freshness + price vs VWAP
//   upside          0–25   room to the recent high (never chase a top)
//   trend           0–10   daily alignment
// Penalties: overbought RSI −20, extended crossover −15, no room −15.
// Bonuses: R/R +5/+3, VWAP proximity +5, multi-timeframe alignment +10.
// Total clamped to 0–110.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::{Bar, Features};

/// Bars scanned backwards for the resistance (recent high) estimate.
const RESISTANCE_LOOKBACK: usize = 60;

// =============================================================================
// Universe
// =============================================================================

/// The scan universe, stratified by capitalisation and sector. Roughly 160
/// liquid names; the scanner narrows this to the working watchlist.
pub mod universe {
    pub const INDICES: &[&str] = &["SPY", "QQQ", "DIA", "IWM"];

    pub const MEGA_CAP_TECH: &[&str] = &[
        "AAPL", "MSFT", "GOOGL", "AMZN", "META", "NVDA", "TSLA", "NFLX", "AMD", "INTC",
    ];

    pub const LARGE_CAP_TECH: &[&str] = &[
        "AVGO", "ORCL", "CRM", "ADBE", "CSCO", "QCOM", "TXN", "AMAT", "MU", "LRCX",
        "KLAC", "SNPS", "CDNS", "MRVL", "ASML", "NXPI", "ADI", "ON", "MPWR", "NOW",
    ];

    pub const CLOUD_SOFTWARE: &[&str] = &[
        "SNOW", "DDOG", "CRWD", "ZS", "PANW", "WDAY", "TEAM", "PLTR", "NET", "OKTA",
        "MDB", "HUBS", "TWLO", "GTLB", "S",
    ];

    pub const CONSUMER: &[&str] = &[
        "SHOP", "EBAY", "ETSY", "W", "CHWY", "DASH", "UBER", "LYFT", "ABNB", "BKNG",
        "SBUX", "NKE", "MCD", "TGT", "COST", "WMT", "HD", "LOW", "DIS", "CMG",
    ];

    pub const FINANCE: &[&str] = &[
        "JPM", "BAC", "WFC", "GS", "MS", "C", "BLK", "SCHW", "V", "MA",
        "PYPL", "COIN", "HOOD", "SOFI", "AXP",
    ];

    pub const HEALTHCARE: &[&str] = &[
        "UNH", "JNJ", "LLY", "ABBV", "MRK", "PFE", "TMO", "ABT", "DHR", "BMY",
        "AMGN", "GILD", "VRTX", "REGN", "BIIB", "ISRG", "MRNA", "ZTS", "CVS", "HCA",
    ];

    pub const ENERGY_INDUSTRIAL: &[&str] = &[
        "XOM", "CVX", "COP", "SLB", "EOG", "MPC", "PSX", "VLO", "OXY", "HAL",
        "CAT", "DE", "BA", "GE", "HON", "UPS", "UNP", "LMT", "RTX", "FDX",
    ];

    pub const MID_SMALL_MOMENTUM: &[&str] = &[
        "RIVN", "LCID", "NIO", "RBLX", "U", "DKNG", "ARKK", "SOXL", "AFRM", "UPST",
        "IONQ", "RKLB", "ASTS", "SMCI", "CELH", "ELF", "DUOL", "APP", "TOST", "CAVA",
        "ONON", "BROS", "WING", "FOUR", "TMDX", "KRYS", "CORT", "ACLS", "PLAB", "HIMS",
    ];

    /// Full deduplicated universe across every stratum.
    pub fn full() -> Vec<String> {
        let mut all: Vec<String> = [
            INDICES,
            MEGA_CAP_TECH,
            LARGE_CAP_TECH,
            CLOUD_SOFTWARE,
            CONSUMER,
            FINANCE,
            HEALTHCARE,
            ENERGY_INDUSTRIAL,
            MID_SMALL_MOMENTUM,
        ]
        .iter()
        .flat_map(|group| group.iter().map(|s| s.to_string()))
        .collect();
        all.sort();
        all.dedup();
        all
    }

    /// The most liquid names, scanned first when time is tight.
    pub fn high_priority() -> Vec<String> {
        let mut set: Vec<String> = INDICES
            .iter()
            .chain(MEGA_CAP_TECH.iter())
            .chain(MID_SMALL_MOMENTUM.iter().take(10))
            .map(|s| s.to_string())
            .collect();
        set.sort();
        set.dedup();
        set
    }
}

// =============================================================================
// Crossover freshness
// =============================================================================

/// How far the EMA crossover has travelled. Fresh is the ideal entry;
/// extended is a chase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossoverFreshness {
    Fresh,
    Developing,
    Extended,
}

impl CrossoverFreshness {
    /// Classify from the absolute EMA spread percentage.
    pub fn classify(ema_diff_pct_abs: f64) -> Option<Self> {
        if ema_diff_pct_abs < 0.05 {
            None // Not meaningfully crossed yet.
        } else if ema_diff_pct_abs <= 0.3 {
            Some(Self::Fresh)
        } else if ema_diff_pct_abs <= 1.0 {
            Some(Self::Developing)
        } else {
            Some(Self::Extended)
        }
    }
}

// =============================================================================
// Scoring
// =============================================================================

/// Per-component score breakdown for one candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub volume_score: i32,
    pub trend_strength_score: i32,
    pub breakout_score: i32,
    pub upside_score: i32,
    pub trend_score: i32,
    pub overbought_penalty: i32,
    pub extended_penalty: i32,
    pub insufficient_room_penalty: i32,
    pub rr_bonus: i32,
    pub vwap_bonus: i32,
    pub timeframe_bonus: i32,
}

impl ScoreBreakdown {
    /// Base + bonuses − penalties, clamped to 0–110.
    pub fn total(&self) -> i32 {
        let base = self.volume_score
            + self.trend_strength_score
            + self.breakout_score
            + self.upside_score
            + self.trend_score;
        let penalties =
            self.overbought_penalty + self.extended_penalty + self.insufficient_room_penalty;
        let bonuses = self.rr_bonus + self.vwap_bonus + self.timeframe_bonus;
        (base - penalties + bonuses).clamp(0, 110)
    }
}

/// A scored candidate on the watchlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub score: i32,
    pub grade: String,
    pub price: f64,
    pub volume_ratio: f64,
    pub crossover: Option<CrossoverFreshness>,
    pub breakdown: ScoreBreakdown,
    pub scored_at: DateTime<Utc>,
}

/// Letter grade for a 0–110 score.
pub fn grade_for(score: i32) -> &'static str {
    match score {
        s if s >= 90 => "A+",
        s if s >= 80 => "A",
        s if s >= 70 => "B",
        s if s >= 60 => "C",
        s if s >= 50 => "D",
        _ => "F",
    }
}

/// Score one candidate from its feature snapshot and recent minute bars.
///
/// Returns `None` for snapshots without the indicators scoring needs.
pub fn score_symbol(features: &Features, bars: &[Bar], daily_aligned: bool) -> Option<Opportunity> {
    if !features.is_valid() {
        return None;
    }

    let price = features.price;
    let volume_ratio = features.volume_ratio.unwrap_or(1.0);
    let rsi = features.rsi.unwrap_or(50.0);
    let adx = features.adx?;
    let ema_diff = features.ema_diff_pct?;
    let atr = features.atr?;

    let mut b = ScoreBreakdown::default();

    // ── Volume (0–25) ────────────────────────────────────────────────────
    b.volume_score = if volume_ratio >= 3.0 {
        25
    } else if volume_ratio >= 2.0 {
        20
    } else if volume_ratio >= 1.5 {
        15
    } else if volume_ratio >= 1.2 {
        10
    } else if volume_ratio >= 1.0 {
        5
    } else {
        0
    };

    // ── Trend strength (0–20): ADX carries 0–14, RSI zone 0–6 ───────────
    let adx_part = ((adx / 40.0).min(1.0) * 14.0) as i32;
    let rsi_part = if (50.0..=65.0).contains(&rsi) {
        6
    } else if (40.0..70.0).contains(&rsi) {
        4
    } else {
        0
    };
    b.trend_strength_score = adx_part + rsi_part;

    // ── Breakout (0–20): crossover freshness + above VWAP ────────────────
    let crossover = CrossoverFreshness::classify(ema_diff.abs());
    b.breakout_score = match crossover {
        Some(CrossoverFreshness::Fresh) => 15,
        Some(CrossoverFreshness::Developing) => 10,
        Some(CrossoverFreshness::Extended) => 3,
        None => 0,
    };
    if let Some(vwap) = features.vwap {
        if price > vwap {
            b.breakout_score = (b.breakout_score + 5).min(20);
        }
    }

    // ── Upside (0–25): room to the recent high ───────────────────────────
    let resistance = recent_high(bars, RESISTANCE_LOOKBACK);
    let room_pct = match resistance {
        Some(high) if price > 0.0 => ((high - price) / price * 100.0).max(0.0),
        _ => 0.0,
    };
    b.upside_score = if room_pct > 5.0 {
        25
    } else if room_pct > 3.0 {
        18
    } else if room_pct > 2.0 {
        12
    } else if room_pct > 1.0 {
        6
    } else {
        0
    };
    if room_pct < 1.0 && resistance.is_some() {
        b.insufficient_room_penalty = 15;
    }

    // ── Trend (0–10): daily alignment ────────────────────────────────────
    b.trend_score = if daily_aligned { 10 } else { 0 };

    // ── Penalties ────────────────────────────────────────────────────────
    if !(25.0..=75.0).contains(&rsi) {
        b.overbought_penalty = 20;
    }
    if matches!(crossover, Some(CrossoverFreshness::Extended)) {
        b.extended_penalty = 15;
    }

    // ── Bonuses ──────────────────────────────────────────────────────────
    // R/R estimated from room-to-resistance against an ATR-sized stop.
    if atr > 0.0 {
        let rr = (room_pct / 100.0 * price) / atr;
        if rr > 3.0 {
            b.rr_bonus = 5;
        } else if rr > 2.0 {
            b.rr_bonus = 3;
        }
    }
    if let Some(vwap) = features.vwap {
        if vwap > 0.0 && ((price - vwap) / vwap).abs() < 0.005 {
            b.vwap_bonus = 5;
        }
    }
    if daily_aligned {
        b.timeframe_bonus = 10;
    }

    let score = b.total();
    Some(Opportunity {
        symbol: features.symbol.clone(),
        score,
        grade: grade_for(score).to_string(),
        price,
        volume_ratio,
        crossover,
        breakdown: b,
        scored_at: features.ts,
    })
}

/// Highest high over the trailing `lookback` bars, excluding the last bar
/// (the candidate's own bar must not count as its resistance).
fn recent_high(bars: &[Bar], lookback: usize) -> Option<f64> {
    if bars.len() < 2 {
        return None;
    }
    let end = bars.len() - 1;
    let start = end.saturating_sub(lookback);
    bars[start..end]
        .iter()
        .map(|b| b.high)
        .fold(None, |acc, h| match acc {
            Some(max) if max >= h => Some(max),
            _ => Some(h),
        })
}

// =============================================================================
// Scanner
// =============================================================================

struct ScannerInner {
    opportunities: Vec<Opportunity>,
    last_refresh: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// Thread-safe holder of the ranked watchlist with cadence limiting.
pub struct OpportunityScanner {
    inner: RwLock<ScannerInner>,
    refresh_interval_secs: u64,
    max_symbols: usize,
}

impl OpportunityScanner {
    pub fn new(refresh_interval_secs: u64, max_symbols: usize) -> Self {
        Self {
            inner: RwLock::new(ScannerInner {
                opportunities: Vec::new(),
                last_refresh: None,
                consecutive_failures: 0,
            }),
            refresh_interval_secs,
            max_symbols,
        }
    }

    /// Whether enough time has passed since the last successful refresh.
    pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read();
        match inner.last_refresh {
            None => true,
            Some(last) => now - last >= Duration::seconds(self.refresh_interval_secs as i64),
        }
    }

    /// Store a completed scan: rank descending, truncate to the cap.
    pub fn ingest(&self, mut scored: Vec<Opportunity>, now: DateTime<Utc>) {
        scored.sort_by(|a, b| b.score.cmp(&a.score));
        scored.truncate(self.max_symbols);

        let mut inner = self.inner.write();
        info!(
            count = scored.len(),
            top = scored.first().map(|o| o.symbol.as_str()).unwrap_or("-"),
            top_score = scored.first().map(|o| o.score).unwrap_or(0),
            "watchlist refreshed"
        );
        inner.opportunities = scored;
        inner.last_refresh = Some(now);
        inner.consecutive_failures = 0;
    }

    /// Record a failed refresh. The previous list keeps serving.
    pub fn mark_failed(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures += 1;
        warn!(
            consecutive_failures = inner.consecutive_failures,
            serving = inner.opportunities.len(),
            "scan refresh failed — keeping last good watchlist"
        );
    }

    /// Ranked symbols for the signal loop.
    pub fn watchlist(&self) -> Vec<String> {
        self.inner
            .read()
            .opportunities
            .iter()
            .map(|o| o.symbol.clone())
            .collect()
    }

    /// Full scored snapshot for the API.
    pub fn opportunities(&self) -> Vec<Opportunity> {
        self.inner.read().opportunities.clone()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_refresh
    }
}

impl std::fmt::Debug for OpportunityScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("OpportunityScanner")
            .field("watchlist_len", &inner.opportunities.len())
            .field("last_refresh", &inner.last_refresh)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfidenceWeights;
    use crate::market_data::FeatureEngine;
    use chrono::TimeZone;

    fn bars_with_headroom(n: usize) -> Vec<Bar> {
        // An early spike leaves plenty of room between the current price and
        // the recent high.
        (0..n)
            .map(|i| {
                let ts = Utc.with_ymd_and_hms(2026, 3, 16, 14, 0, 0).unwrap()
                    + chrono::Duration::minutes(i as i64);
                let base = 100.0 + i as f64 * 0.05;
                let high = if i == 10 { base + 12.0 } else { base + 0.3 };
                Bar::new(ts, base, high, base - 0.3, base + 0.1, 1500.0)
            })
            .collect()
    }

    fn features_for(bars: &[Bar]) -> Features {
        FeatureEngine::compute(
            "NVDA",
            bars,
            9,
            21,
            "broad_bullish",
            &ConfidenceWeights::default(),
        )
        .unwrap()
    }

    #[test]
    fn universe_is_stratified_and_large() {
        let full = universe::full();
        assert!(full.len() >= 150, "universe has {} symbols", full.len());
        // No duplicates survive the dedup.
        let mut sorted = full.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), full.len());
        assert!(full.contains(&"SPY".to_string()));
        assert!(full.contains(&"KRYS".to_string()));
    }

    #[test]
    fn high_priority_is_subset_of_full() {
        let full = universe::full();
        for s in universe::high_priority() {
            assert!(full.contains(&s), "{s} missing from full universe");
        }
    }

    #[test]
    fn crossover_freshness_thresholds() {
        assert_eq!(CrossoverFreshness::classify(0.01), None);
        assert_eq!(CrossoverFreshness::classify(0.05), Some(CrossoverFreshness::Fresh));
        assert_eq!(CrossoverFreshness::classify(0.3), Some(CrossoverFreshness::Fresh));
        assert_eq!(
            CrossoverFreshness::classify(0.6),
            Some(CrossoverFreshness::Developing)
        );
        assert_eq!(
            CrossoverFreshness::classify(1.4),
            Some(CrossoverFreshness::Extended)
        );
    }

    #[test]
    fn grades() {
        assert_eq!(grade_for(95), "A+");
        assert_eq!(grade_for(85), "A");
        assert_eq!(grade_for(72), "B");
        assert_eq!(grade_for(61), "C");
        assert_eq!(grade_for(55), "D");
        assert_eq!(grade_for(10), "F");
    }

    #[test]
    fn score_total_is_clamped() {
        let mut b = ScoreBreakdown {
            volume_score: 25,
            trend_strength_score: 20,
            breakout_score: 20,
            upside_score: 25,
            trend_score: 10,
            rr_bonus: 5,
            vwap_bonus: 5,
            timeframe_bonus: 10,
            ..Default::default()
        };
        assert_eq!(b.total(), 110); // 120 raw, clamped

        b.overbought_penalty = 20;
        b.extended_penalty = 15;
        b.insufficient_room_penalty = 15;
        b.volume_score = 0;
        b.trend_strength_score = 0;
        b.breakout_score = 0;
        b.upside_score = 0;
        b.trend_score = 0;
        b.rr_bonus = 0;
        b.vwap_bonus = 0;
        b.timeframe_bonus = 0;
        assert_eq!(b.total(), 0); // negative raw, clamped
    }

    #[test]
    fn score_symbol_rejects_invalid_features() {
        let bars = bars_with_headroom(10); // too short for a full snapshot
        let features = FeatureEngine::compute(
            "NVDA",
            &bars,
            9,
            21,
            "choppy",
            &ConfidenceWeights::default(),
        )
        .unwrap();
        assert!(score_symbol(&features, &bars, false).is_none());
    }

    #[test]
    fn daily_alignment_adds_trend_and_bonus() {
        let bars = bars_with_headroom(80);
        let features = features_for(&bars);

        let aligned = score_symbol(&features, &bars, true).unwrap();
        let unaligned = score_symbol(&features, &bars, false).unwrap();

        assert_eq!(aligned.breakdown.trend_score, 10);
        assert_eq!(aligned.breakdown.timeframe_bonus, 10);
        assert_eq!(unaligned.breakdown.trend_score, 0);
        assert!(aligned.score > unaligned.score);
    }

    #[test]
    fn recent_high_excludes_current_bar() {
        let bars = bars_with_headroom(80);
        let high = recent_high(&bars, 60).unwrap();
        // The spike at bar 10 is outside the trailing 60-bar window by now,
        // so resistance comes from ordinary bar highs.
        let last = bars.last().unwrap();
        assert!(high >= last.close - 1.0);
        assert!(recent_high(&bars[..1], 60).is_none());
    }

    #[test]
    fn scanner_cadence_limits_refresh() {
        let scanner = OpportunityScanner::new(300, 20);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 16, 14, 0, 0).unwrap();
        assert!(scanner.should_refresh(t0));

        scanner.ingest(Vec::new(), t0);
        assert!(!scanner.should_refresh(t0 + Duration::seconds(60)));
        assert!(scanner.should_refresh(t0 + Duration::seconds(300)));
    }

    #[test]
    fn scanner_ranks_and_truncates() {
        let scanner = OpportunityScanner::new(300, 2);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 16, 14, 0, 0).unwrap();
        let bars = bars_with_headroom(80);
        let features = features_for(&bars);

        let mut a = score_symbol(&features, &bars, true).unwrap();
        a.symbol = "AAA".into();
        a.score = 90;
        let mut b = a.clone();
        b.symbol = "BBB".into();
        b.score = 95;
        let mut c = a.clone();
        c.symbol = "CCC".into();
        c.score = 40;

        scanner.ingest(vec![a, b, c], t0);
        assert_eq!(scanner.watchlist(), vec!["BBB", "AAA"]);
    }

    #[test]
    fn failed_refresh_keeps_last_good_list() {
        let scanner = OpportunityScanner::new(300, 5);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 16, 14, 0, 0).unwrap();
        let bars = bars_with_headroom(80);
        let features = features_for(&bars);
        let opp = score_symbol(&features, &bars, true).unwrap();

        scanner.ingest(vec![opp], t0);
        let before = scanner.watchlist();
        scanner.mark_failed();
        assert_eq!(scanner.watchlist(), before);
    }
}
