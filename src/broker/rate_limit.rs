// =============================================================================
// Rate-Limit Tracker — monitors broker API usage to avoid 429s
// =============================================================================
//
// The brokerage allows 200 requests per minute. Every response carries
// `X-RateLimit-Remaining` and `X-RateLimit-Reset` (epoch seconds) headers;
// the tracker mirrors them into atomic counters that any task may query
// lock-free. A small reserve is held back so the protection audit can always
// reach the broker even when the scanner is hammering the bar endpoints.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Requests held in reserve for protection-critical calls.
const RESERVE: i64 = 10;
/// Remaining-budget level at which a warning is logged.
const WARN_THRESHOLD: i64 = 40;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    remaining: AtomicI64,
    reset_epoch_secs: AtomicU64,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub remaining: i64,
    pub reset_epoch_secs: u64,
}

impl RateLimitTracker {
    /// Create a tracker that assumes a full budget until headers arrive.
    pub fn new() -> Self {
        Self {
            remaining: AtomicI64::new(200),
            reset_epoch_secs: AtomicU64::new(0),
        }
    }

    /// Mirror the broker's rate-limit headers into the counters.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(remaining) = parse_header(headers, "X-RateLimit-Remaining") {
            let prev = self.remaining.swap(remaining, Ordering::Relaxed);
            if remaining <= WARN_THRESHOLD && prev > WARN_THRESHOLD {
                warn!(remaining, "rate-limit budget crossed warning threshold");
            }
            debug!(remaining, "rate-limit budget updated from header");
        }
        if let Some(reset) = parse_header(headers, "X-RateLimit-Reset") {
            self.reset_epoch_secs.store(reset as u64, Ordering::Relaxed);
        }
    }

    /// Whether a routine (non-critical) request still fits the budget.
    ///
    /// Protection-critical calls bypass this check and use the reserve.
    pub fn can_send_request(&self, now_epoch_secs: u64) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining > RESERVE {
            return true;
        }
        // Budget exhausted; allowed again once the window has reset.
        let reset = self.reset_epoch_secs.load(Ordering::Relaxed);
        let allowed = now_epoch_secs >= reset;
        if !allowed {
            warn!(
                remaining,
                reset_epoch_secs = reset,
                "request deferred — rate-limit budget exhausted"
            );
        }
        allowed
    }

    /// Decrement the local budget optimistically when a request is sent
    /// before the response headers arrive.
    pub fn record_request_sent(&self) {
        self.remaining.fetch_sub(1, Ordering::Relaxed);
    }

    /// Produce a serialisable snapshot of the current counters.
    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            remaining: self.remaining.load(Ordering::Relaxed),
            reset_epoch_secs: self.reset_epoch_secs.load(Ordering::Relaxed),
        }
    }
}

fn parse_header(headers: &reqwest::header::HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field(
                "reset_epoch_secs",
                &self.reset_epoch_secs.load(Ordering::Relaxed),
            )
            .finish()
    }
}
