// =============================================================================
// Market Data — OHLCV bars and the per-symbol bar store
// =============================================================================
//
// The engine pulls historical bars over REST: minute bars for the intraday
// pipeline and daily bars for the trend filter. `BarStore` caches one bounded
// series per (symbol, timeframe); the scanner loop swaps in fresh series each
// refresh and the rest of the engine reads immutable snapshots.
// =============================================================================

pub mod features;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use features::{FeatureEngine, Features};

// =============================================================================
// Bar
// =============================================================================

/// A single immutable OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            ts,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Bar granularity on the broker wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Minute,
    Day,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "1Min",
            Self::Day => "1Day",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Key identifying one cached bar series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl BarKey {
    pub fn minute(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe: Timeframe::Minute,
        }
    }

    pub fn daily(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe: Timeframe::Day,
        }
    }
}

// =============================================================================
// BarStore
// =============================================================================

/// Thread-safe bounded cache of bar series keyed by (symbol, timeframe).
pub struct BarStore {
    series: RwLock<HashMap<BarKey, VecDeque<Bar>>>,
    max_bars: usize,
}

impl BarStore {
    /// Create a store retaining at most `max_bars` per series.
    pub fn new(max_bars: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Replace an entire series with a freshly fetched one (oldest first).
    /// Series longer than the retention bound are truncated from the front.
    pub fn replace(&self, key: BarKey, bars: Vec<Bar>) {
        let mut deque: VecDeque<Bar> = bars.into();
        while deque.len() > self.max_bars {
            deque.pop_front();
        }
        self.series.write().insert(key, deque);
    }

    /// Append a single bar, deduplicating on timestamp (a re-fetched latest
    /// bar overwrites the cached one instead of duplicating it).
    pub fn append(&self, key: BarKey, bar: Bar) {
        let mut map = self.series.write();
        let deque = map.entry(key).or_default();
        if let Some(last) = deque.back_mut() {
            if last.ts == bar.ts {
                *last = bar;
                return;
            }
        }
        deque.push_back(bar);
        while deque.len() > self.max_bars {
            deque.pop_front();
        }
    }

    /// Return up to the most recent `count` bars (oldest first).
    pub fn bars(&self, key: &BarKey, count: usize) -> Vec<Bar> {
        let map = self.series.read();
        match map.get(key) {
            Some(deque) => {
                let skip = deque.len().saturating_sub(count);
                deque.iter().skip(skip).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// Closing prices of the most recent `count` bars (oldest first).
    pub fn closes(&self, key: &BarKey, count: usize) -> Vec<f64> {
        self.bars(key, count).iter().map(|b| b.close).collect()
    }

    /// The most recent close for a series, if any.
    pub fn last_close(&self, key: &BarKey) -> Option<f64> {
        self.series.read().get(key)?.back().map(|b| b.close)
    }

    /// Number of cached bars for a series.
    pub fn count(&self, key: &BarKey) -> usize {
        self.series.read().get(key).map(|d| d.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for BarStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarStore")
            .field("series_count", &self.series.read().len())
            .field("max_bars", &self.max_bars)
            .finish()
    }
}
