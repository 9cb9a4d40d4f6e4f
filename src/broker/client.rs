// =============================================================================
// Brokerage REST Client — key/secret header auth, typed responses
// =============================================================================
//
// Thin contract over the brokerage: account, positions, orders (with bracket
// legs), market clock, and the market-data endpoints (bars, latest trade,
// latest quote). The paper/live distinction is entirely in the base URL.
//
// SECURITY: the secret key is sent as a header, never logged or serialized.
// Numeric fields arrive as JSON strings on this wire; `f64_field` accepts
// both shapes.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::broker::error::{BrokerError, BrokerErrorKind};
use crate::broker::rate_limit::RateLimitTracker;
use crate::market_data::{Bar, Timeframe};
use crate::types::{OrderType, Side};

/// Attempts for idempotent reads before the error is surfaced.
const READ_RETRIES: u32 = 3;
/// Base backoff between read retries.
const RETRY_BASE_MS: u64 = 250;

// =============================================================================
// Response types
// =============================================================================

/// Account-level balances and flags.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub daytrading_buying_power: f64,
    pub is_pattern_day_trader: bool,
}

impl AccountSnapshot {
    /// The buying power the sizer should plan against: day-trading BP for
    /// flagged accounts, otherwise the better of cash and regular BP.
    pub fn available_buying_power(&self) -> f64 {
        if self.is_pattern_day_trader && self.daytrading_buying_power > 0.0 {
            self.daytrading_buying_power
        } else {
            self.cash.max(self.buying_power)
        }
    }
}

/// A position as the broker reports it.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub side: Side,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pl: f64,
    pub unrealized_plpc: f64,
}

/// An order as the broker reports it, including nested bracket legs.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: String,
    pub status: String,
    pub qty: f64,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub legs: Vec<BrokerOrder>,
}

impl BrokerOrder {
    /// True when the status field names a working (cancellable) state.
    pub fn is_working(&self) -> bool {
        matches!(
            self.status.as_str(),
            "new" | "accepted" | "pending_new" | "partially_filled" | "held" | "accepted_for_bidding"
        )
    }
}

/// Market clock.
#[derive(Debug, Clone, Serialize)]
pub struct Clock {
    pub now: DateTime<Utc>,
    pub is_open: bool,
    pub next_open: Option<DateTime<Utc>>,
    pub next_close: Option<DateTime<Utc>>,
}

/// Latest trade print.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatestTrade {
    pub price: f64,
    pub ts: DateTime<Utc>,
}

/// Latest NBBO quote.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatestQuote {
    pub bid: f64,
    pub ask: f64,
    pub ts: DateTime<Utc>,
}

// =============================================================================
// Order request
// =============================================================================

/// A new-order request. Bracket legs ride along when both protective prices
/// are present.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: f64,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<TakeProfitLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<StopLossLeg>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TakeProfitLeg {
    pub limit_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopLossLeg {
    pub stop_price: f64,
}

impl OrderRequest {
    /// A plain day order with no protective legs.
    pub fn simple(symbol: &str, qty: f64, side: Side, order_type: OrderType) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty,
            side,
            order_type,
            time_in_force: "day".to_string(),
            limit_price: None,
            stop_price: None,
            client_order_id: None,
            order_class: None,
            take_profit: None,
            stop_loss: None,
        }
    }

    /// Attach bracket legs (take-profit limit + stop-loss stop).
    pub fn with_bracket(mut self, take_profit: f64, stop_loss: f64) -> Self {
        self.order_class = Some("bracket".to_string());
        self.take_profit = Some(TakeProfitLeg {
            limit_price: take_profit,
        });
        self.stop_loss = Some(StopLossLeg {
            stop_price: stop_loss,
        });
        self
    }

    pub fn with_limit(mut self, limit_price: f64) -> Self {
        self.limit_price = Some(limit_price);
        self
    }

    pub fn with_stop(mut self, stop_price: f64) -> Self {
        self.stop_price = Some(stop_price);
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

// =============================================================================
// Client
// =============================================================================

/// Brokerage REST client. Cheap to clone; the underlying reqwest client and
/// rate-limit tracker are shared.
#[derive(Clone)]
pub struct BrokerClient {
    trading_url: String,
    data_url: String,
    client: reqwest::Client,
    rate_limits: Arc<RateLimitTracker>,
}

impl BrokerClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `key_id`      — API key id, sent as a header on every request.
    /// * `secret`      — API secret, sent as a header; never logged.
    /// * `trading_url` — e.g. a paper or live trading endpoint.
    /// * `data_url`    — market-data endpoint.
    pub fn new(
        key_id: impl Into<String>,
        secret: impl Into<String>,
        trading_url: impl Into<String>,
        data_url: impl Into<String>,
    ) -> Self {
        let key_id = key_id.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&key_id) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(mut val) = HeaderValue::from_str(&secret) {
            val.set_sensitive(true);
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let trading_url = trading_url.into();
        debug!(trading_url = %trading_url, "BrokerClient initialised");

        Self {
            trading_url,
            data_url: data_url.into(),
            client,
            rate_limits: Arc::new(RateLimitTracker::new()),
        }
    }

    /// Construct from environment variables; fails when credentials are
    /// missing so a misconfigured engine refuses to start.
    pub fn from_env() -> anyhow::Result<Self> {
        let key_id = std::env::var("MERIDIAN_API_KEY_ID")
            .map_err(|_| anyhow::anyhow!("MERIDIAN_API_KEY_ID is not set"))?;
        let secret = std::env::var("MERIDIAN_API_SECRET_KEY")
            .map_err(|_| anyhow::anyhow!("MERIDIAN_API_SECRET_KEY is not set"))?;
        let trading_url = std::env::var("MERIDIAN_TRADING_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());
        let data_url = std::env::var("MERIDIAN_DATA_URL")
            .unwrap_or_else(|_| "https://data.alpaca.markets".to_string());
        Ok(Self::new(key_id, secret, trading_url, data_url))
    }

    /// Shared rate-limit tracker (exposed for the status API).
    pub fn rate_limits(&self) -> Arc<RateLimitTracker> {
        self.rate_limits.clone()
    }

    // -------------------------------------------------------------------------
    // Account / clock
    // -------------------------------------------------------------------------

    /// GET /v2/account
    #[instrument(skip(self), name = "broker::get_account")]
    pub async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let url = format!("{}/v2/account", self.trading_url);
        let body = self.get_json_with_retry(&url).await?;

        Ok(AccountSnapshot {
            equity: f64_field(&body, "equity"),
            cash: f64_field(&body, "cash"),
            buying_power: f64_field(&body, "buying_power"),
            daytrading_buying_power: f64_field(&body, "daytrading_buying_power"),
            is_pattern_day_trader: body
                .get("pattern_day_trader")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    /// GET /v2/clock
    #[instrument(skip(self), name = "broker::get_clock")]
    pub async fn get_clock(&self) -> Result<Clock, BrokerError> {
        let url = format!("{}/v2/clock", self.trading_url);
        let body = self.get_json_with_retry(&url).await?;

        Ok(Clock {
            now: ts_field(&body, "timestamp").unwrap_or_else(Utc::now),
            is_open: body.get("is_open").and_then(|v| v.as_bool()).unwrap_or(false),
            next_open: ts_field(&body, "next_open"),
            next_close: ts_field(&body, "next_close"),
        })
    }

    /// Convenience wrapper over the clock.
    pub async fn is_market_open(&self) -> Result<bool, BrokerError> {
        Ok(self.get_clock().await?.is_open)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// GET /v2/positions
    #[instrument(skip(self), name = "broker::list_positions")]
    pub async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/v2/positions", self.trading_url);
        let body = self.get_json_with_retry(&url).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| BrokerError::new(BrokerErrorKind::Other, "positions response is not an array"))?;

        let positions = raw.iter().map(parse_position).collect::<Vec<_>>();
        debug!(count = positions.len(), "positions retrieved");
        Ok(positions)
    }

    /// DELETE /v2/positions/{symbol} — market-close the whole position.
    #[instrument(skip(self), name = "broker::close_position")]
    pub async fn close_position(&self, symbol: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/positions/{}", self.trading_url, symbol);
        let resp = self.client.delete(&url).send().await.map_err(BrokerError::from)?;
        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        if status.is_success() {
            debug!(symbol, "position close submitted");
            return Ok(());
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Err(BrokerError::from_response(status.as_u16(), &body))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// GET /v2/orders with an optional status filter (`open`, `closed`,
    /// `all`). Bracket legs come back nested.
    #[instrument(skip(self), name = "broker::list_orders")]
    pub async fn list_orders(&self, status: Option<&str>) -> Result<Vec<BrokerOrder>, BrokerError> {
        let mut url = format!("{}/v2/orders?nested=true&limit=500", self.trading_url);
        if let Some(s) = status {
            url.push_str(&format!("&status={s}"));
        }
        let body = self.get_json_with_retry(&url).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| BrokerError::new(BrokerErrorKind::Other, "orders response is not an array"))?;

        let orders = raw.iter().map(parse_order).collect::<Vec<_>>();
        debug!(count = orders.len(), "orders retrieved");
        Ok(orders)
    }

    /// GET /v2/orders/{id}
    #[instrument(skip(self), name = "broker::get_order")]
    pub async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        let url = format!("{}/v2/orders/{}?nested=true", self.trading_url, order_id);
        let body = self.get_json_with_retry(&url).await?;
        Ok(parse_order(&body))
    }

    /// POST /v2/orders — submit a new order, optionally with bracket legs.
    ///
    /// Writes are NOT retried here; the deterministic client order id makes
    /// a caller-level retry idempotent on the broker side.
    #[instrument(skip(self, request), fields(symbol = %request.symbol, side = %request.side), name = "broker::submit_order")]
    pub async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError> {
        let url = format!("{}/v2/orders", self.trading_url);
        self.rate_limits.record_request_sent();

        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(BrokerError::from)?;
        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::new(BrokerErrorKind::Other, format!("order response parse: {e}")))?;

        if !status.is_success() {
            return Err(BrokerError::from_response(status.as_u16(), &body));
        }

        debug!(symbol = %request.symbol, "order submitted");
        Ok(parse_order(&body))
    }

    /// DELETE /v2/orders/{id} — cancel. A response carrying an
    /// already-filled marker surfaces as `RaceCondition`, which callers must
    /// treat as a fill.
    #[instrument(skip(self), name = "broker::cancel_order")]
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.trading_url, order_id);
        let resp = self.client.delete(&url).send().await.map_err(BrokerError::from)?;
        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        if status.is_success() {
            debug!(order_id, "order cancelled");
            return Ok(());
        }

        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let err = BrokerError::classify_cancel(status.as_u16(), &body);
        if err.is_cancel_race() {
            warn!(order_id, "cancel crossed a fill (race)");
        }
        Err(err)
    }

    /// PATCH /v2/orders/{id} — replace price/qty fields on a working order.
    #[instrument(skip(self), name = "broker::replace_order")]
    pub async fn replace_order(
        &self,
        order_id: &str,
        qty: Option<f64>,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<BrokerOrder, BrokerError> {
        let url = format!("{}/v2/orders/{}", self.trading_url, order_id);

        let mut fields = serde_json::Map::new();
        if let Some(q) = qty {
            fields.insert("qty".to_string(), Value::from(q.to_string()));
        }
        if let Some(l) = limit_price {
            fields.insert("limit_price".to_string(), Value::from(l.to_string()));
        }
        if let Some(s) = stop_price {
            fields.insert("stop_price".to_string(), Value::from(s.to_string()));
        }

        let resp = self
            .client
            .patch(&url)
            .json(&Value::Object(fields))
            .send()
            .await
            .map_err(BrokerError::from)?;
        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::new(BrokerErrorKind::Other, format!("replace response parse: {e}")))?;

        if !status.is_success() {
            return Err(BrokerError::from_response(status.as_u16(), &body));
        }

        debug!(order_id, "order replaced");
        Ok(parse_order(&body))
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /v2/stocks/bars — historical bars for multiple symbols.
    #[instrument(skip(self, symbols), fields(count = symbols.len()), name = "broker::get_bars")]
    pub async fn get_bars(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        // Routine data pulls respect the shared budget; protection-critical
        // trading calls do not pass through this check.
        if !self.rate_limits.can_send_request(epoch_secs()) {
            return Err(BrokerError::new(
                BrokerErrorKind::RateLimited,
                "local rate-limit budget exhausted",
            ));
        }

        let mut url = format!(
            "{}/v2/stocks/bars?symbols={}&timeframe={}&limit={}",
            self.data_url,
            symbols.join(","),
            timeframe.as_str(),
            limit
        );
        if let Some(s) = start {
            url.push_str(&format!("&start={}", s.to_rfc3339()));
        }
        if let Some(e) = end {
            url.push_str(&format!("&end={}", e.to_rfc3339()));
        }

        let body = self.get_json_with_retry(&url).await?;

        let mut result: HashMap<String, Vec<Bar>> = HashMap::new();
        if let Some(bars_by_symbol) = body.get("bars").and_then(|v| v.as_object()) {
            for (symbol, entries) in bars_by_symbol {
                let series = entries
                    .as_array()
                    .map(|arr| arr.iter().filter_map(parse_bar).collect::<Vec<_>>())
                    .unwrap_or_default();
                result.insert(symbol.clone(), series);
            }
        }

        debug!(symbols = result.len(), "bars fetched");
        Ok(result)
    }

    /// GET /v2/stocks/{symbol}/trades/latest
    #[instrument(skip(self), name = "broker::get_latest_trade")]
    pub async fn get_latest_trade(&self, symbol: &str) -> Result<LatestTrade, BrokerError> {
        let url = format!("{}/v2/stocks/{}/trades/latest", self.data_url, symbol);
        let body = self.get_json_with_retry(&url).await?;

        let trade = body
            .get("trade")
            .ok_or_else(|| BrokerError::new(BrokerErrorKind::Other, "latest-trade response missing 'trade'"))?;

        Ok(LatestTrade {
            price: f64_field(trade, "p"),
            ts: ts_field(trade, "t").unwrap_or_else(Utc::now),
        })
    }

    /// GET /v2/stocks/{symbol}/quotes/latest
    #[instrument(skip(self), name = "broker::get_latest_quote")]
    pub async fn get_latest_quote(&self, symbol: &str) -> Result<LatestQuote, BrokerError> {
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol);
        let body = self.get_json_with_retry(&url).await?;

        let quote = body
            .get("quote")
            .ok_or_else(|| BrokerError::new(BrokerErrorKind::Other, "latest-quote response missing 'quote'"))?;

        Ok(LatestQuote {
            bid: f64_field(quote, "bp"),
            ask: f64_field(quote, "ap"),
            ts: ts_field(quote, "t").unwrap_or_else(Utc::now),
        })
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// GET a JSON body with bounded retry on transient failures. Only used
    /// for idempotent reads.
    async fn get_json_with_retry(&self, url: &str) -> Result<Value, BrokerError> {
        let mut last_err: Option<BrokerError> = None;

        for attempt in 0..READ_RETRIES {
            if attempt > 0 {
                let backoff = RETRY_BASE_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }

            match self.get_json_once(url).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_transient() => {
                    warn!(url, attempt, error = %err, "transient broker read failure — retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| BrokerError::new(BrokerErrorKind::Other, "read retries exhausted")))
    }

    async fn get_json_once(&self, url: &str) -> Result<Value, BrokerError> {
        self.rate_limits.record_request_sent();
        let resp = self.client.get(url).send().await.map_err(BrokerError::from)?;
        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::new(BrokerErrorKind::Other, format!("response parse: {e}")))?;

        if !status.is_success() {
            return Err(BrokerError::from_response(status.as_u16(), &body));
        }
        Ok(body)
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("trading_url", &self.trading_url)
            .field("data_url", &self.data_url)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Wire parsing helpers
// =============================================================================

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parse a field that may be a JSON string or number into `f64` (0.0 when
/// absent or malformed — callers requiring presence must check separately).
fn f64_field(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Like `f64_field` but preserves absence.
fn opt_f64_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

fn ts_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)?
        .as_str()?
        .parse::<DateTime<Utc>>()
        .ok()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn parse_side(value: &Value) -> Side {
    match value.get("side").and_then(|v| v.as_str()) {
        Some("sell") | Some("short") => Side::Sell,
        _ => Side::Buy,
    }
}

fn parse_position(value: &Value) -> BrokerPosition {
    BrokerPosition {
        symbol: str_field(value, "symbol"),
        qty: f64_field(value, "qty").abs(),
        side: match value.get("side").and_then(|v| v.as_str()) {
            Some("short") => Side::Sell,
            _ => Side::Buy,
        },
        avg_entry_price: f64_field(value, "avg_entry_price"),
        current_price: f64_field(value, "current_price"),
        market_value: f64_field(value, "market_value"),
        unrealized_pl: f64_field(value, "unrealized_pl"),
        unrealized_plpc: f64_field(value, "unrealized_plpc"),
    }
}

fn parse_order(value: &Value) -> BrokerOrder {
    let legs = value
        .get("legs")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(parse_order).collect())
        .unwrap_or_default();

    BrokerOrder {
        id: str_field(value, "id"),
        client_order_id: str_field(value, "client_order_id"),
        symbol: str_field(value, "symbol"),
        side: parse_side(value),
        order_type: str_field(value, "type"),
        status: str_field(value, "status"),
        qty: f64_field(value, "qty"),
        filled_qty: f64_field(value, "filled_qty"),
        filled_avg_price: opt_f64_field(value, "filled_avg_price"),
        limit_price: opt_f64_field(value, "limit_price"),
        stop_price: opt_f64_field(value, "stop_price"),
        submitted_at: ts_field(value, "submitted_at"),
        filled_at: ts_field(value, "filled_at"),
        legs,
    }
}

fn parse_bar(value: &Value) -> Option<Bar> {
    let ts = ts_field(value, "t")?;
    Some(Bar::new(
        ts,
        f64_field(value, "o"),
        f64_field(value, "h"),
        f64_field(value, "l"),
        f64_field(value, "c"),
        f64_field(value, "v"),
    ))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn f64_field_accepts_string_and_number() {
        let v = json!({"a": "12.5", "b": 3.25, "c": null});
        assert_eq!(f64_field(&v, "a"), 12.5);
        assert_eq!(f64_field(&v, "b"), 3.25);
        assert_eq!(f64_field(&v, "c"), 0.0);
        assert_eq!(f64_field(&v, "missing"), 0.0);
        assert_eq!(opt_f64_field(&v, "missing"), None);
        assert_eq!(opt_f64_field(&v, "a"), Some(12.5));
    }

    #[test]
    fn parse_order_with_nested_legs() {
        let v = json!({
            "id": "abc",
            "client_order_id": "meridian-1",
            "symbol": "SPY",
            "side": "buy",
            "type": "limit",
            "status": "filled",
            "qty": "100",
            "filled_qty": "100",
            "filled_avg_price": "50.02",
            "limit_price": "50.05",
            "submitted_at": "2026-03-16T14:30:00Z",
            "filled_at": "2026-03-16T14:30:02Z",
            "legs": [
                {"id": "s1", "symbol": "SPY", "side": "sell", "type": "stop",
                 "status": "new", "qty": "100", "filled_qty": "0", "stop_price": "48.00"},
                {"id": "t1", "symbol": "SPY", "side": "sell", "type": "limit",
                 "status": "new", "qty": "100", "filled_qty": "0", "limit_price": "54.00"}
            ]
        });

        let order = parse_order(&v);
        assert_eq!(order.id, "abc");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.qty, 100.0);
        assert_eq!(order.filled_avg_price, Some(50.02));
        assert!(order.filled_at.is_some());
        assert_eq!(order.legs.len(), 2);
        assert_eq!(order.legs[0].stop_price, Some(48.0));
        assert_eq!(order.legs[1].limit_price, Some(54.0));
        assert!(order.legs[0].is_working());
        assert!(!order.is_working());
    }

    #[test]
    fn parse_position_short_side() {
        let v = json!({
            "symbol": "TSLA",
            "qty": "-50",
            "side": "short",
            "avg_entry_price": "200.0",
            "current_price": "195.0",
            "market_value": "-9750.0",
            "unrealized_pl": "250.0",
            "unrealized_plpc": "0.025"
        });
        let pos = parse_position(&v);
        assert_eq!(pos.side, Side::Sell);
        assert_eq!(pos.qty, 50.0); // absolute
        assert_eq!(pos.unrealized_pl, 250.0);
    }

    #[test]
    fn parse_bar_from_wire_shape() {
        let v = json!({
            "t": "2026-03-16T14:30:00Z",
            "o": 50.0, "h": 50.5, "l": 49.5, "c": "50.25", "v": 120000
        });
        let bar = parse_bar(&v).unwrap();
        assert_eq!(bar.close, 50.25);
        assert_eq!(bar.volume, 120_000.0);
        assert!(parse_bar(&json!({"o": 1.0})).is_none(), "missing ts rejected");
    }

    #[test]
    fn available_buying_power_prefers_daytrading_for_pdt() {
        let pdt = AccountSnapshot {
            equity: 100_000.0,
            cash: 20_000.0,
            buying_power: 40_000.0,
            daytrading_buying_power: 80_000.0,
            is_pattern_day_trader: true,
        };
        assert_eq!(pdt.available_buying_power(), 80_000.0);

        let retail = AccountSnapshot {
            equity: 100_000.0,
            cash: 50_000.0,
            buying_power: 40_000.0,
            daytrading_buying_power: 0.0,
            is_pattern_day_trader: false,
        };
        assert_eq!(retail.available_buying_power(), 50_000.0);
    }

    #[test]
    fn bracket_request_serialises_legs() {
        let req = OrderRequest::simple("SPY", 100.0, Side::Buy, OrderType::Limit)
            .with_limit(50.05)
            .with_bracket(54.0, 48.0)
            .with_client_order_id("meridian-x");
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["order_class"], "bracket");
        assert_eq!(v["take_profit"]["limit_price"], 54.0);
        assert_eq!(v["stop_loss"]["stop_price"], 48.0);
        assert_eq!(v["type"], "limit");
        assert_eq!(v["client_order_id"], "meridian-x");
    }
}
