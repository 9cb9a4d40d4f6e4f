// =============================================================================
// Broker Error Taxonomy
// =============================================================================
//
// Every broker call fails with a kind, and callers branch on the kind:
//
//   Network / RateLimited  — transient; retry with backoff
//   NotFound               — order or position no longer exists
//   InvalidState           — rejected by the broker; terminal for the attempt
//   RaceCondition          — a cancel crossed a fill; reinterpret as a fill
//   Other                  — anything unrecognised
//
// The cancel-race classification is the load-bearing part: brokers report the
// crossing in several shapes ("order is already in \"filled\" state",
// "already executed", numeric code 42210000, ...). The adapter normalises all
// of them into `RaceCondition` here so no caller ever greps message strings.
// =============================================================================

use serde::Serialize;

/// Broker code some venues attach to a cancel that crossed a fill.
pub const CANCEL_RACE_CODE: i64 = 42_210_000;

/// Lowercased substrings that mark a cancel-crossed-fill response.
const FILLED_RACE_MARKERS: &[&str] = &[
    "already in \"filled\" state",
    "already in 'filled' state",
    "already filled",
    "already executed",
    "filled state",
    "order is filled",
    "cannot cancel filled order",
    "order already executed",
    "42210000",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerErrorKind {
    Network,
    RateLimited,
    NotFound,
    InvalidState,
    RaceCondition,
    Other,
}

impl std::fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::RaceCondition => "race_condition",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// A failed broker call.
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
    /// Machine-readable broker code when the response carried one.
    pub code: Option<i64>,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(kind: BrokerErrorKind, message: impl Into<String>, code: i64) -> Self {
        Self {
            kind,
            message: message.into(),
            code: Some(code),
        }
    }

    /// Network and rate-limit failures may be retried; everything else is
    /// terminal for the attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            BrokerErrorKind::Network | BrokerErrorKind::RateLimited
        )
    }

    /// True when this error means "the order filled before the cancel landed".
    pub fn is_cancel_race(&self) -> bool {
        self.kind == BrokerErrorKind::RaceCondition
    }

    /// Classify an HTTP error response (non-cancel endpoints).
    pub fn from_response(status: u16, body: &serde_json::Value) -> Self {
        let code = body.get("code").and_then(|c| c.as_i64());
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        let message = if message.is_empty() {
            format!("broker returned HTTP {status}")
        } else {
            message
        };

        let kind = match status {
            404 => BrokerErrorKind::NotFound,
            429 => BrokerErrorKind::RateLimited,
            403 | 422 => BrokerErrorKind::InvalidState,
            _ => BrokerErrorKind::Other,
        };

        Self {
            kind,
            message,
            code,
        }
    }

    /// Classify a failed cancel. Responses carrying any already-filled marker
    /// become `RaceCondition` regardless of HTTP status; the rest fall back
    /// to the generic response classification.
    pub fn classify_cancel(status: u16, body: &serde_json::Value) -> Self {
        let code = body.get("code").and_then(|c| c.as_i64());
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();

        if code == Some(CANCEL_RACE_CODE) || is_race_message(&message) || is_race_message(&body.to_string())
        {
            return Self {
                kind: BrokerErrorKind::RaceCondition,
                message: if message.is_empty() {
                    "cancel crossed a fill".to_string()
                } else {
                    message
                },
                code,
            };
        }

        Self::from_response(status, body)
    }
}

/// Case-insensitive scan for any of the known already-filled markers.
fn is_race_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    FILLED_RACE_MARKERS.iter().any(|m| lower.contains(m))
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {} (code {})", self.kind, self.message, code),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
            BrokerErrorKind::Network
        } else {
            BrokerErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}
