// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD tracks momentum as the spread between a fast and a slow EMA:
//
//   MACD line   = EMA(fast) - EMA(slow)          (12, 26 by default)
//   Signal line = EMA(MACD line, signal_period)  (9 by default)
//   Histogram   = MACD line - Signal line
//
// A positive, growing histogram confirms bullish momentum; the mirror holds
// for bearish.
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// The most recent MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD value for `closes`.
///
/// Returns `None` when there is not enough history for the slow EMA plus the
/// signal EMA (`slow + signal - 1` closes minimum), or when any intermediate
/// value is non-finite.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal - 1 {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_slow.is_empty() {
        return None;
    }

    // Align the two series on their tails: the slow series is the shorter
    // one, so pair each slow value with the fast value for the same close.
    let offset = ema_fast.len().checked_sub(ema_slow.len())?;
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, &s)| ema_fast[offset + i] - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal);
    let signal_val = *signal_series.last()?;
    let macd_val = *macd_line.last()?;
    let histogram = macd_val - signal_val;

    if !macd_val.is_finite() || !signal_val.is_finite() {
        return None;
    }

    Some(Macd {
        macd: macd_val,
        signal: signal_val,
        histogram,
    })
}

/// Standard MACD(12, 26, 9).
pub fn calculate(closes: &[f64]) -> Option<Macd> {
    calculate_macd(closes, 12, 26, 9)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        // Need 26 + 9 - 1 = 34 closes.
        assert!(calculate(&closes).is_none());
    }

    #[test]
    fn macd_bad_periods() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
        assert!(calculate_macd(&closes, 12, 0, 9).is_none());
        assert!(calculate_macd(&closes, 12, 26, 0).is_none());
        // Fast must be strictly below slow.
        assert!(calculate_macd(&closes, 26, 26, 9).is_none());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        // A steadily rising series keeps the fast EMA above the slow one.
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let macd = calculate(&closes).unwrap();
        assert!(macd.macd > 0.0, "uptrend MACD should be positive, got {}", macd.macd);
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let closes: Vec<f64> = (1..=100).rev().map(|x| x as f64).collect();
        let macd = calculate(&closes).unwrap();
        assert!(macd.macd < 0.0, "downtrend MACD should be negative, got {}", macd.macd);
    }

    #[test]
    fn macd_flat_market_near_zero() {
        let closes = vec![100.0; 100];
        let macd = calculate(&closes).unwrap();
        assert!(macd.macd.abs() < 1e-9);
        assert!(macd.signal.abs() < 1e-9);
        assert!(macd.histogram.abs() < 1e-9);
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 5.0 + i as f64 * 0.1)
            .collect();
        let macd = calculate(&closes).unwrap();
        assert!((macd.histogram - (macd.macd - macd.signal)).abs() < 1e-12);
    }

    #[test]
    fn macd_exact_minimum_length() {
        let min = 26 + 9 - 1;
        let closes: Vec<f64> = (1..=min).map(|x| x as f64).collect();
        assert!(calculate(&closes).is_some());
        assert!(calculate(&closes[..min - 1]).is_none());
    }
}
