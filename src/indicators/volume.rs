// =============================================================================
// Volume Statistics — rolling mean, ratio, and z-score
// =============================================================================
//
// The feature engine compares the latest bar's volume against a rolling
// 20-period window:
//
//   ratio   = current / mean           (volume burst detector)
//   z-score = (current - mean) / std   (how unusual the burst is)
// =============================================================================

/// Rolling volume statistics over the trailing `period` bars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeStats {
    pub current: f64,
    pub average: f64,
    pub ratio: f64,
    pub zscore: f64,
}

/// Compute volume statistics from a series of per-bar volumes (oldest
/// first). The window covers the most recent `period` entries, including the
/// current bar.
///
/// Returns `None` when there are fewer than `period` entries or the mean is
/// zero. A zero standard deviation yields a z-score of 0.0.
pub fn calculate_volume_stats(volumes: &[f64], period: usize) -> Option<VolumeStats> {
    if period == 0 || volumes.len() < period {
        return None;
    }

    let window = &volumes[volumes.len() - period..];
    let current = *window.last()?;

    let mean: f64 = window.iter().sum::<f64>() / period as f64;
    if mean == 0.0 || !mean.is_finite() {
        return None;
    }

    let variance: f64 =
        window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let std = variance.sqrt();

    let zscore = if std > 0.0 { (current - mean) / std } else { 0.0 };
    let ratio = current / mean;

    if !ratio.is_finite() || !zscore.is_finite() {
        return None;
    }

    Some(VolumeStats {
        current,
        average: mean,
        ratio,
        zscore,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_insufficient_data() {
        assert!(calculate_volume_stats(&[1.0, 2.0], 20).is_none());
        assert!(calculate_volume_stats(&[], 1).is_none());
        assert!(calculate_volume_stats(&[1.0], 0).is_none());
    }

    #[test]
    fn stats_flat_volume() {
        let volumes = vec![100.0; 20];
        let stats = calculate_volume_stats(&volumes, 20).unwrap();
        assert!((stats.ratio - 1.0).abs() < 1e-10);
        assert!((stats.zscore).abs() < 1e-10);
        assert!((stats.average - 100.0).abs() < 1e-10);
    }

    #[test]
    fn stats_burst_detected() {
        let mut volumes = vec![100.0; 19];
        volumes.push(300.0); // 3x burst on the current bar
        let stats = calculate_volume_stats(&volumes, 20).unwrap();
        assert!(stats.ratio > 2.5, "ratio {} should reflect burst", stats.ratio);
        assert!(stats.zscore > 3.0, "zscore {} should be large", stats.zscore);
    }

    #[test]
    fn stats_window_is_trailing() {
        // Early giant volume outside the window must not affect the stats.
        let mut volumes = vec![1_000_000.0];
        volumes.extend(vec![100.0; 20]);
        let stats = calculate_volume_stats(&volumes, 20).unwrap();
        assert!((stats.average - 100.0).abs() < 1e-10);
    }

    #[test]
    fn stats_zero_mean_rejected() {
        let volumes = vec![0.0; 20];
        assert!(calculate_volume_stats(&volumes, 20).is_none());
    }
}
