// =============================================================================
// Volume-Weighted Average Price (VWAP) — session anchored
// =============================================================================
//
// VWAP is the cumulative typical-price-times-volume divided by cumulative
// volume, anchored at the session open:
//
//   typical = (H + L + C) / 3
//   VWAP    = Σ(typical · volume) / Σ(volume)
//
// Callers pass only the bars belonging to the current session; the function
// itself does no date filtering.
// =============================================================================

use crate::market_data::Bar;

/// Compute session VWAP over the given bars (oldest first).
///
/// Returns `None` for an empty slice, zero total volume, or a non-finite
/// result.
pub fn calculate_vwap(bars: &[Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }

    let mut pv_sum = 0.0;
    let mut vol_sum = 0.0;

    for bar in bars {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        pv_sum += typical * bar.volume;
        vol_sum += bar.volume;
    }

    if vol_sum == 0.0 {
        return None;
    }

    let vwap = pv_sum / vol_sum;
    if vwap.is_finite() {
        Some(vwap)
    } else {
        None
    }
}

/// Distance of `price` from VWAP as a percentage of VWAP.
///
/// Positive when the price trades above VWAP.
pub fn distance_pct(price: f64, vwap: f64) -> Option<f64> {
    if vwap == 0.0 {
        return None;
    }
    let pct = ((price - vwap) / vwap) * 100.0;
    if pct.is_finite() {
        Some(pct)
    } else {
        None
    }
}
