// =============================================================================
// Daily Trend Filter — higher-timeframe alignment for entries
// =============================================================================
//
// Evaluates the daily EMA(9)/EMA(21) stack to determine whether the higher
// timeframe supports a trade direction.
//
// Decision rule:
//   buy_allowed  = daily EMA9 > EMA21
//   sell_allowed = daily EMA9 < EMA21
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::ema::calculate_ema;
use crate::market_data::{BarKey, BarStore};
use crate::types::Side;

/// Daily bars needed for the EMA(21) stack.
const MIN_DAILY_BARS: usize = 21;

/// Snapshot of the daily trend read for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyTrend {
    pub symbol: String,
    pub bullish: bool,
    /// `(EMA9 - EMA21) / EMA21 * 100`.
    pub ema_sep_pct: f64,
    pub bars_used: usize,
}

impl DailyTrend {
    /// Whether this trend supports an entry on `side`.
    pub fn supports(&self, side: Side) -> bool {
        match side {
            Side::Buy => self.bullish,
            Side::Sell => !self.bullish,
        }
    }
}

/// Analyze the daily trend for `symbol` from cached daily bars.
///
/// Returns `None` when fewer than 21 daily bars are cached; callers decide
/// whether missing data blocks the entry or waives the filter.
pub fn analyze(bars: &BarStore, symbol: &str) -> Option<DailyTrend> {
    let closes = bars.closes(&BarKey::daily(symbol), 100);
    analyze_closes(symbol, &closes)
}

/// Same as [`analyze`], over an explicit close series.
pub fn analyze_closes(symbol: &str, closes: &[f64]) -> Option<DailyTrend> {
    if closes.len() < MIN_DAILY_BARS {
        debug!(
            symbol,
            daily_bars = closes.len(),
            "daily trend: insufficient data (need >= {MIN_DAILY_BARS})"
        );
        return None;
    }

    let e9 = *calculate_ema(closes, 9).last()?;
    let e21 = *calculate_ema(closes, 21).last()?;
    if e21.abs() <= f64::EPSILON {
        return None;
    }

    let sep = (e9 - e21) / e21 * 100.0;
    let bullish = e9 > e21;

    debug!(
        symbol,
        bullish,
        ema_sep_pct = format!("{sep:.3}"),
        "daily trend analyzed"
    );

    Some(DailyTrend {
        symbol: symbol.to_string(),
        bullish,
        ema_sep_pct: sep,
        bars_used: closes.len(),
    })
}

/// Convenience used by the scanner: `Some(true)` when the daily stack is
/// aligned for longs.
pub fn daily_aligned_for_long(bars: &BarStore, symbol: &str) -> Option<bool> {
    analyze(bars, symbol).map(|t| t.bullish)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Bar;

    #[test]
    fn insufficient_history_returns_none() {
        let closes: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        assert!(analyze_closes("SPY", &closes).is_none());
    }

    #[test]
    fn rising_dailies_are_bullish() {
        let closes: Vec<f64> = (1..=60).map(|x| 100.0 + x as f64).collect();
        let trend = analyze_closes("SPY", &closes).unwrap();
        assert!(trend.bullish);
        assert!(trend.ema_sep_pct > 0.0);
        assert!(trend.supports(Side::Buy));
        assert!(!trend.supports(Side::Sell));
    }

    #[test]
    fn falling_dailies_are_bearish() {
        let closes: Vec<f64> = (1..=60).map(|x| 200.0 - x as f64).collect();
        let trend = analyze_closes("SPY", &closes).unwrap();
        assert!(!trend.bullish);
        assert!(trend.supports(Side::Sell));
    }

    #[test]
    fn reads_from_bar_store() {
        use chrono::{TimeZone, Utc};
        let store = BarStore::new(200);
        let bars: Vec<Bar> = (0..40)
            .map(|i| {
                let ts = Utc.with_ymd_and_hms(2026, 1, 1, 21, 0, 0).unwrap()
                    + chrono::Duration::days(i);
                let p = 100.0 + i as f64;
                Bar::new(ts, p, p + 1.0, p - 1.0, p, 1_000_000.0)
            })
            .collect();
        store.replace(BarKey::daily("SPY"), bars);

        let trend = analyze(&store, "SPY").unwrap();
        assert!(trend.bullish);
        assert_eq!(daily_aligned_for_long(&store, "SPY"), Some(true));
        assert_eq!(daily_aligned_for_long(&store, "MISSING"), None);
    }
}
