// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian trading engine. Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_watchlist() -> Vec<String> {
    vec![
        "SPY".to_string(),
        "QQQ".to_string(),
        "AAPL".to_string(),
        "MSFT".to_string(),
        "NVDA".to_string(),
    ]
}

fn default_max_positions() -> u32 {
    5
}

fn default_max_position_pct() -> f64 {
    0.10
}

fn default_base_risk_pct() -> f64 {
    0.005
}

fn default_min_stop_pct() -> f64 {
    0.015
}

fn default_stop_atr_mult() -> f64 {
    2.5
}

fn default_tp_atr_mult() -> f64 {
    5.0
}

fn default_rr_min() -> f64 {
    2.0
}

fn default_ema_short() -> usize {
    9
}

fn default_ema_long() -> usize {
    21
}

fn default_adx_min() -> f64 {
    20.0
}

fn default_entry_cutoff_time() -> String {
    "15:30".to_string()
}

fn default_eod_exit_time() -> String {
    "15:58".to_string()
}

fn default_trailing_activation_r() -> f64 {
    2.0
}

fn default_trailing_distance_r() -> f64 {
    0.5
}

fn default_trailing_pct() -> f64 {
    0.01
}

fn default_max_trailing_positions() -> u32 {
    3
}

fn default_symbol_cooldown_hours() -> f64 {
    2.0
}

fn default_cooldown_loss_limit() -> u32 {
    2
}

fn default_daily_loss_cap_pct() -> f64 {
    0.03
}

fn default_fill_timeout_secs() -> u64 {
    60
}

fn default_max_slippage_pct() -> f64 {
    0.5
}

fn default_limit_buffer_regular() -> f64 {
    0.001
}

fn default_limit_buffer_extended() -> f64 {
    0.003
}

fn default_protection_grace_secs() -> u64 {
    30
}

fn default_remnant_pct() -> f64 {
    0.01
}

fn default_scan_interval_secs() -> u64 {
    120
}

fn default_signal_interval_secs() -> u64 {
    10
}

fn default_position_interval_secs() -> u64 {
    3
}

fn default_scanner_refresh_secs() -> u64 {
    300
}

fn default_scanner_max_symbols() -> usize {
    20
}

// =============================================================================
// ConfidenceWeights
// =============================================================================

fn default_w_technical() -> f64 {
    0.35
}

fn default_w_momentum() -> f64 {
    0.25
}

fn default_w_volume() -> f64 {
    0.20
}

fn default_w_volatility() -> f64 {
    0.10
}

fn default_w_regime() -> f64 {
    0.10
}

/// Weights of the 0–100 confidence composite. The inputs and the ±25 bound
/// on bonuses/penalties are fixed; the blend is tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    #[serde(default = "default_w_technical")]
    pub technical: f64,
    #[serde(default = "default_w_momentum")]
    pub momentum: f64,
    #[serde(default = "default_w_volume")]
    pub volume: f64,
    #[serde(default = "default_w_volatility")]
    pub volatility: f64,
    #[serde(default = "default_w_regime")]
    pub regime: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            technical: default_w_technical(),
            momentum: default_w_momentum(),
            volume: default_w_volume(),
            volatility: default_w_volatility(),
            regime: default_w_regime(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational mode ----------------------------------------------------

    /// Current trading mode: Live, Paused, or Halted.
    #[serde(default)]
    pub trading_mode: TradingMode,

    // --- Watchlist & position limits -----------------------------------------

    /// Static watchlist used when the dynamic scanner is disabled, and as the
    /// seed when it is enabled.
    #[serde(default = "default_watchlist")]
    pub watchlist_symbols: Vec<String>,

    /// Replace the static watchlist with the opportunity scanner's output.
    #[serde(default = "default_true")]
    pub use_dynamic_watchlist: bool,

    /// Maximum number of concurrent open positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// Per-symbol notional cap as a fraction of equity.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    // --- Risk & stops --------------------------------------------------------

    /// Base dollar risk per trade as a fraction of equity.
    #[serde(default = "default_base_risk_pct")]
    pub base_risk_pct: f64,

    /// Minimum stop distance as a fraction of entry price. Floor: 1.5 %.
    #[serde(default = "default_min_stop_pct")]
    pub min_stop_pct: f64,

    /// ATR multiplier for the protective stop distance. Floor: 2.5.
    #[serde(default = "default_stop_atr_mult")]
    pub stop_atr_mult: f64,

    /// ATR multiplier for the take-profit distance. Floor: 5.0.
    #[serde(default = "default_tp_atr_mult")]
    pub tp_atr_mult: f64,

    /// Minimum initial reward-to-risk ratio for a signal to survive.
    #[serde(default = "default_rr_min")]
    pub rr_min: f64,

    /// Daily realized-loss circuit breaker as a fraction of equity.
    #[serde(default = "default_daily_loss_cap_pct")]
    pub daily_loss_cap_pct: f64,

    // --- Strategy ------------------------------------------------------------

    /// Fast EMA period.
    #[serde(default = "default_ema_short")]
    pub ema_short: usize,

    /// Slow EMA period.
    #[serde(default = "default_ema_long")]
    pub ema_long: usize,

    /// Minimum ADX for a signal (trend-strength gate).
    #[serde(default = "default_adx_min")]
    pub adx_min: f64,

    /// Only take long entries. Shorts are computed either way; this flag
    /// gates emission.
    #[serde(default = "default_true")]
    pub long_only_mode: bool,

    /// Require daily EMA9 > EMA21 alignment for longs (mirror for shorts).
    #[serde(default = "default_true")]
    pub require_daily_alignment: bool,

    // --- Session times (US/Eastern, "HH:MM") ---------------------------------

    /// No new entries at or after this time.
    #[serde(default = "default_entry_cutoff_time")]
    pub entry_cutoff_time: String,

    /// Flatten all positions and cancel all working orders at this time.
    #[serde(default = "default_eod_exit_time")]
    pub eod_exit_time: String,

    /// When false the EOD sweep logs what it would close but takes no action.
    #[serde(default = "default_true")]
    pub force_eod_exit: bool,

    // --- Execution -----------------------------------------------------------

    /// Submit entry + stop + take-profit as one atomic bracket request.
    #[serde(default = "default_true")]
    pub bracket_orders_enabled: bool,

    /// Hard cap on time spent waiting for an entry fill.
    #[serde(default = "default_fill_timeout_secs")]
    pub fill_timeout_secs: u64,

    /// Cancel (never re-price) when slippage would exceed this percent.
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: f64,

    /// Marketable-limit buffer during regular hours (fraction of price).
    #[serde(default = "default_limit_buffer_regular")]
    pub limit_buffer_regular: f64,

    /// Marketable-limit buffer during extended hours (fraction of price).
    #[serde(default = "default_limit_buffer_extended")]
    pub limit_buffer_extended: f64,

    // --- Position management -------------------------------------------------

    /// R-ladder trailing stops.
    #[serde(default = "default_true")]
    pub trailing_enabled: bool,

    /// Unrealized R-multiple at which trailing activates.
    #[serde(default = "default_trailing_activation_r")]
    pub trailing_activation_r: f64,

    /// Trail distance in R units (compared against the ATR trail; the wider
    /// one wins).
    #[serde(default = "default_trailing_distance_r")]
    pub trailing_distance_r: f64,

    /// Percent trail distance as a fraction of price.
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: f64,

    /// Trailing is applied to at most this many of the most profitable
    /// positions at a time.
    #[serde(default = "default_max_trailing_positions")]
    pub max_trailing_positions: u32,

    /// Take partial profits on the R ladder (50 % at +2R, 25 % at +3R, rest
    /// at +4R).
    #[serde(default = "default_true")]
    pub partial_profit_enabled: bool,

    /// Log partial-profit actions without executing them.
    #[serde(default)]
    pub partial_profit_shadow_mode: bool,

    /// Seconds a position may lack a working stop before the audit rebuilds
    /// protection.
    #[serde(default = "default_protection_grace_secs")]
    pub protection_grace_secs: u64,

    /// Positions whose notional falls below this fraction of equity are
    /// closed during cleanup sweeps.
    #[serde(default = "default_remnant_pct")]
    pub remnant_pct: f64,

    // --- Cooldowns -----------------------------------------------------------

    /// Hours a symbol is blocked after its cooldown trips.
    #[serde(default = "default_symbol_cooldown_hours")]
    pub symbol_cooldown_hours: f64,

    /// Consecutive losses on one symbol that trip its cooldown.
    #[serde(default = "default_cooldown_loss_limit")]
    pub cooldown_loss_limit: u32,

    // --- Loop cadences -------------------------------------------------------

    /// Scanner loop interval (regime, watchlist, feature refresh).
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Signal loop interval during market hours.
    #[serde(default = "default_signal_interval_secs")]
    pub signal_interval_secs: u64,

    /// Position-management loop interval.
    #[serde(default = "default_position_interval_secs")]
    pub position_interval_secs: u64,

    /// Minimum seconds between opportunity-scanner refreshes.
    #[serde(default = "default_scanner_refresh_secs")]
    pub scanner_refresh_secs: u64,

    /// Maximum symbols the scanner emits into the watchlist.
    #[serde(default = "default_scanner_max_symbols")]
    pub scanner_max_symbols: usize,

    // --- Confidence composite ------------------------------------------------

    /// Blend weights for the 0–100 confidence score.
    #[serde(default)]
    pub confidence_weights: ConfidenceWeights,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            watchlist_symbols: default_watchlist(),
            use_dynamic_watchlist: true,
            max_positions: default_max_positions(),
            max_position_pct: default_max_position_pct(),
            base_risk_pct: default_base_risk_pct(),
            min_stop_pct: default_min_stop_pct(),
            stop_atr_mult: default_stop_atr_mult(),
            tp_atr_mult: default_tp_atr_mult(),
            rr_min: default_rr_min(),
            daily_loss_cap_pct: default_daily_loss_cap_pct(),
            ema_short: default_ema_short(),
            ema_long: default_ema_long(),
            adx_min: default_adx_min(),
            long_only_mode: true,
            require_daily_alignment: true,
            entry_cutoff_time: default_entry_cutoff_time(),
            eod_exit_time: default_eod_exit_time(),
            force_eod_exit: true,
            bracket_orders_enabled: true,
            fill_timeout_secs: default_fill_timeout_secs(),
            max_slippage_pct: default_max_slippage_pct(),
            limit_buffer_regular: default_limit_buffer_regular(),
            limit_buffer_extended: default_limit_buffer_extended(),
            trailing_enabled: true,
            trailing_activation_r: default_trailing_activation_r(),
            trailing_distance_r: default_trailing_distance_r(),
            trailing_pct: default_trailing_pct(),
            max_trailing_positions: default_max_trailing_positions(),
            partial_profit_enabled: true,
            partial_profit_shadow_mode: false,
            protection_grace_secs: default_protection_grace_secs(),
            remnant_pct: default_remnant_pct(),
            symbol_cooldown_hours: default_symbol_cooldown_hours(),
            cooldown_loss_limit: default_cooldown_loss_limit(),
            scan_interval_secs: default_scan_interval_secs(),
            signal_interval_secs: default_signal_interval_secs(),
            position_interval_secs: default_position_interval_secs(),
            scanner_refresh_secs: default_scanner_refresh_secs(),
            scanner_max_symbols: default_scanner_max_symbols(),
            confidence_weights: ConfidenceWeights::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist_symbols,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Reject configurations that would violate the engine's safety floors.
    /// Called at startup; a bad config refuses to start rather than trade
    /// with weakened protection.
    pub fn validate(&self) -> Result<()> {
        if self.min_stop_pct < 0.015 {
            anyhow::bail!(
                "min_stop_pct {} below the 1.5% floor",
                self.min_stop_pct
            );
        }
        if self.stop_atr_mult < 2.5 {
            anyhow::bail!("stop_atr_mult {} below the 2.5 floor", self.stop_atr_mult);
        }
        if self.tp_atr_mult < 5.0 {
            anyhow::bail!("tp_atr_mult {} below the 5.0 floor", self.tp_atr_mult);
        }
        if self.ema_short >= self.ema_long {
            anyhow::bail!(
                "ema_short {} must be below ema_long {}",
                self.ema_short,
                self.ema_long
            );
        }
        if crate::market_time::parse_hhmm(&self.entry_cutoff_time).is_none() {
            anyhow::bail!("entry_cutoff_time '{}' is not HH:MM", self.entry_cutoff_time);
        }
        if crate::market_time::parse_hhmm(&self.eod_exit_time).is_none() {
            anyhow::bail!("eod_exit_time '{}' is not HH:MM", self.eod_exit_time);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.max_positions, 5);
        assert_eq!(cfg.ema_short, 9);
        assert_eq!(cfg.ema_long, 21);
        assert!((cfg.base_risk_pct - 0.005).abs() < f64::EPSILON);
        assert!((cfg.min_stop_pct - 0.015).abs() < f64::EPSILON);
        assert!((cfg.stop_atr_mult - 2.5).abs() < f64::EPSILON);
        assert!((cfg.tp_atr_mult - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.entry_cutoff_time, "15:30");
        assert_eq!(cfg.eod_exit_time, "15:58");
        assert!(cfg.long_only_mode);
        assert!(cfg.bracket_orders_enabled);
        assert!(cfg.trailing_enabled);
        assert!((cfg.trailing_activation_r - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.fill_timeout_secs, 60);
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.watchlist_symbols.len(), 5);
        assert!(cfg.use_dynamic_watchlist);
        assert!((cfg.daily_loss_cap_pct - 0.03).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "watchlist_symbols": ["TSLA"], "max_positions": 2 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.watchlist_symbols, vec!["TSLA"]);
        assert_eq!(cfg.max_positions, 2);
        assert_eq!(cfg.ema_long, 21);
        assert!(cfg.partial_profit_enabled);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.watchlist_symbols, cfg2.watchlist_symbols);
        assert_eq!(cfg.max_positions, cfg2.max_positions);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert!((cfg.confidence_weights.technical - cfg2.confidence_weights.technical).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_weakened_stops() {
        let mut cfg = RuntimeConfig::default();
        cfg.min_stop_pct = 0.005;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.stop_atr_mult = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.tp_atr_mult = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_times_and_ema_order() {
        let mut cfg = RuntimeConfig::default();
        cfg.entry_cutoff_time = "half past three".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.ema_short = 21;
        cfg.ema_long = 9;
        assert!(cfg.validate().is_err());
    }
}
