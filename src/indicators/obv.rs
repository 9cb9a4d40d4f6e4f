// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
// OBV accumulates volume with the sign of the close-to-close move:
//
//   close > prev close  =>  OBV += volume
//   close < prev close  =>  OBV -= volume
//   close == prev close =>  OBV unchanged
//
// The absolute level is arbitrary; only the slope carries information.
// =============================================================================

use crate::market_data::Bar;

/// Compute the most recent OBV value over the given bars (oldest first).
///
/// Returns `None` when fewer than two bars are available.
pub fn calculate_obv(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 2 {
        return None;
    }

    let mut obv = 0.0;
    for w in bars.windows(2) {
        if w[1].close > w[0].close {
            obv += w[1].volume;
        } else if w[1].close < w[0].close {
            obv -= w[1].volume;
        }
    }

    if obv.is_finite() {
        Some(obv)
    } else {
        None
    }
}
