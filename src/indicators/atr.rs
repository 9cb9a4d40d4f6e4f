// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR measures volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

use crate::market_data::Bar;

/// Compute the most recent ATR value from a slice of OHLCV bars (oldest
/// first) using Wilder's smoothing.
///
/// Returns `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` bars (each TR needs a previous bar).
/// - Any intermediate value is non-finite.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    // True Range for each consecutive pair.
    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    // Seed with SMA of the first `period` TR values.
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    // Wilder's smoothing for the remainder.
    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// ATR as a percentage of the last close. Useful for comparing volatility
/// across symbols at different price scales.
pub fn calculate_atr_pct(bars: &[Bar], period: usize) -> Option<f64> {
    let atr = calculate_atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        let ts = Utc.with_ymd_and_hms(2026, 3, 16, 14, 0, 0).unwrap();
        Bar::new(ts, open, high, low, close, 100.0)
    }

    #[test]
    fn atr_period_zero() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&bars, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        // Need period + 1 = 15 bars for period=14, only have 10.
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&bars, 14).is_none());
    }

    #[test]
    fn atr_exact_minimum_data() {
        let bars = vec![
            bar(100.0, 102.0, 98.0, 101.0),
            bar(101.0, 104.0, 99.0, 103.0),
            bar(103.0, 106.0, 100.0, 105.0),
            bar(105.0, 108.0, 102.0, 107.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > 0.0 && atr.is_finite());
    }

    #[test]
    fn atr_constant_range_converges() {
        // All bars have the same range (H-L=10); ATR converges to 10.
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            bars.push(bar(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L.
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0), // gap up: |115-95|=20 > 7
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_pct_positive_and_finite() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = calculate_atr_pct(&bars, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
    }

    #[test]
    fn atr_nan_returns_none() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&bars, 3).is_none());
    }
}
