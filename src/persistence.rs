// =============================================================================
// Persistence Gateway — idempotent upserts, buffered and non-fatal
// =============================================================================
//
// Everything the engine persists goes through a bounded queue drained by one
// worker task. Trading never blocks on the database: a full queue drops the
// write with a warning, a failed write retries once and is then dropped.
// Upserts key on natural identifiers so replays are harmless:
//
//   trades(client_order_id)   features(symbol, ts)
//   positions(symbol)         ml_predictions(symbol, signal_ts)
//   trading_parameters(active)
//
// The positions table carries `partial_profits_taken` so a restart does not
// double-take a ladder rung.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::TradeRecord;
use crate::market_data::Features;

pub const ENV_DB_URL: &str = "MERIDIAN_DATABASE_URL";

/// Pending writes the queue will hold before dropping.
const QUEUE_CAPACITY: usize = 256;
/// Attempts per write before it is dropped.
const WRITE_ATTEMPTS: u32 = 2;

// =============================================================================
// Connection & schema
// =============================================================================

/// Connect to Postgres using MERIDIAN_DATABASE_URL. Missing configuration is
/// an error the caller may treat as "run without persistence".
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Ensure the schema exists. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        create table if not exists trades (
            id bigserial primary key,
            symbol text not null,
            side text not null,
            qty double precision not null,
            entry_price double precision not null,
            exit_price double precision not null,
            entry_time timestamptz not null,
            exit_time timestamptz not null,
            pnl double precision not null,
            pnl_pct double precision not null,
            reason text not null,
            r_multiple double precision,
            client_order_id text not null unique
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create trades failed")?;

    sqlx::query(
        r#"
        create table if not exists positions (
            symbol text primary key,
            qty double precision not null,
            avg_entry_price double precision not null,
            stop_loss double precision,
            take_profit double precision,
            partial_profits_taken jsonb not null default '[]'::jsonb,
            updated_at timestamptz not null default now()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create positions failed")?;

    sqlx::query(
        r#"
        create table if not exists features (
            symbol text not null,
            ts timestamptz not null,
            payload jsonb not null,
            primary key (symbol, ts)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create features failed")?;

    sqlx::query(
        r#"
        create table if not exists ml_predictions (
            id bigserial primary key,
            symbol text not null,
            signal_ts timestamptz not null,
            features jsonb not null,
            prediction text not null,
            probability double precision not null,
            outcome text,
            was_correct boolean,
            unique (symbol, signal_ts)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create ml_predictions failed")?;

    sqlx::query(
        r#"
        create table if not exists trading_parameters (
            id bigserial primary key,
            active boolean not null default false,
            params jsonb not null,
            created_at timestamptz not null default now()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create trading_parameters failed")?;

    info!("persistence schema ready");
    Ok(())
}

// =============================================================================
// Jobs
// =============================================================================

/// One queued write.
#[derive(Debug, Clone)]
pub enum PersistJob {
    Trade(TradeRecord),
    Features(Features),
    Prediction {
        symbol: String,
        signal_ts: DateTime<Utc>,
        features: Value,
        prediction: String,
        probability: f64,
    },
    Parameters {
        params: Value,
    },
    PositionFlags {
        symbol: String,
        qty: f64,
        avg_entry_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        partials_taken: Vec<String>,
    },
    RemovePosition {
        symbol: String,
    },
}

// =============================================================================
// Gateway
// =============================================================================

/// Clonable enqueue handle. Construct with [`PersistenceGateway::start`],
/// which also spawns the worker task.
#[derive(Clone)]
pub struct PersistenceGateway {
    tx: mpsc::Sender<PersistJob>,
    enabled: bool,
}

impl PersistenceGateway {
    /// Spawn the drain worker. With `pool = None` the gateway accepts and
    /// discards jobs so callers never special-case a missing database.
    pub fn start(pool: Option<PgPool>) -> Self {
        let (tx, mut rx) = mpsc::channel::<PersistJob>(QUEUE_CAPACITY);
        let enabled = pool.is_some();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(ref pool) = pool else {
                    continue;
                };

                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match execute_job(pool, &job).await {
                        Ok(()) => break,
                        Err(e) if attempt < WRITE_ATTEMPTS => {
                            debug!(error = %e, attempt, "persistence write failed — retrying");
                            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "persistence write dropped after retries");
                            break;
                        }
                    }
                }
            }
        });

        Self { tx, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fire-and-forget enqueue. A full queue drops the write rather than
    /// slowing the trading loops.
    pub fn enqueue(&self, job: PersistJob) {
        if let Err(e) = self.tx.try_send(job) {
            warn!(error = %e, "persistence queue full — write dropped");
        }
    }

    pub fn record_trade(&self, record: &TradeRecord) {
        self.enqueue(PersistJob::Trade(record.clone()));
    }

    pub fn record_features(&self, features: &Features) {
        self.enqueue(PersistJob::Features(features.clone()));
    }

    pub fn record_position_flags(
        &self,
        symbol: &str,
        qty: f64,
        avg_entry_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        partials_taken: Vec<String>,
    ) {
        self.enqueue(PersistJob::PositionFlags {
            symbol: symbol.to_string(),
            qty,
            avg_entry_price,
            stop_loss,
            take_profit,
            partials_taken,
        });
    }

    pub fn remove_position(&self, symbol: &str) {
        self.enqueue(PersistJob::RemovePosition {
            symbol: symbol.to_string(),
        });
    }

    pub fn record_parameters(&self, params: Value) {
        self.enqueue(PersistJob::Parameters { params });
    }

    pub fn record_prediction(
        &self,
        symbol: &str,
        signal_ts: DateTime<Utc>,
        features: Value,
        prediction: &str,
        probability: f64,
    ) {
        self.enqueue(PersistJob::Prediction {
            symbol: symbol.to_string(),
            signal_ts,
            features,
            prediction: prediction.to_string(),
            probability,
        });
    }
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("enabled", &self.enabled)
            .finish()
    }
}

// =============================================================================
// Writes
// =============================================================================

async fn execute_job(pool: &PgPool, job: &PersistJob) -> Result<()> {
    match job {
        PersistJob::Trade(t) => upsert_trade(pool, t).await,
        PersistJob::Features(f) => upsert_features(pool, f).await,
        PersistJob::Prediction {
            symbol,
            signal_ts,
            features,
            prediction,
            probability,
        } => upsert_prediction(pool, symbol, *signal_ts, features, prediction, *probability).await,
        PersistJob::Parameters { params } => insert_active_parameters(pool, params).await,
        PersistJob::PositionFlags {
            symbol,
            qty,
            avg_entry_price,
            stop_loss,
            take_profit,
            partials_taken,
        } => {
            upsert_position(
                pool,
                symbol,
                *qty,
                *avg_entry_price,
                *stop_loss,
                *take_profit,
                partials_taken,
            )
            .await
        }
        PersistJob::RemovePosition { symbol } => delete_position(pool, symbol).await,
    }
}

/// Insert a trade, keyed on client_order_id; replays update in place.
pub async fn upsert_trade(pool: &PgPool, t: &TradeRecord) -> Result<()> {
    sqlx::query(
        r#"
        insert into trades (
            symbol, side, qty, entry_price, exit_price, entry_time, exit_time,
            pnl, pnl_pct, reason, r_multiple, client_order_id
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        on conflict (client_order_id) do update set
            exit_price = excluded.exit_price,
            exit_time = excluded.exit_time,
            pnl = excluded.pnl,
            pnl_pct = excluded.pnl_pct,
            reason = excluded.reason,
            r_multiple = excluded.r_multiple
        "#,
    )
    .bind(&t.symbol)
    .bind(t.side.as_str())
    .bind(t.qty)
    .bind(t.entry_price)
    .bind(t.exit_price)
    .bind(t.entry_time)
    .bind(t.exit_time)
    .bind(t.pnl)
    .bind(t.pnl_pct)
    .bind(&t.reason)
    .bind(t.r_multiple)
    .bind(&t.client_order_id)
    .execute(pool)
    .await
    .context("upsert_trade failed")?;
    Ok(())
}

/// Upsert the feature snapshot for (symbol, ts). The round trip back out of
/// the jsonb payload yields an equal record.
pub async fn upsert_features(pool: &PgPool, f: &Features) -> Result<()> {
    let payload = serde_json::to_value(f).context("serialise features")?;
    sqlx::query(
        r#"
        insert into features (symbol, ts, payload)
        values ($1, $2, $3)
        on conflict (symbol, ts) do update set payload = excluded.payload
        "#,
    )
    .bind(&f.symbol)
    .bind(f.ts)
    .bind(payload)
    .execute(pool)
    .await
    .context("upsert_features failed")?;
    Ok(())
}

/// Load one feature snapshot back (used by tests and the shadow predictor).
pub async fn load_features(
    pool: &PgPool,
    symbol: &str,
    ts: DateTime<Utc>,
) -> Result<Option<Features>> {
    let row = sqlx::query(
        r#"select payload from features where symbol = $1 and ts = $2"#,
    )
    .bind(symbol)
    .bind(ts)
    .fetch_optional(pool)
    .await
    .context("load_features failed")?;

    match row {
        Some(row) => {
            let payload: Value = row.try_get("payload")?;
            let features: Features =
                serde_json::from_value(payload).context("deserialise features payload")?;
            Ok(Some(features))
        }
        None => Ok(None),
    }
}

async fn upsert_prediction(
    pool: &PgPool,
    symbol: &str,
    signal_ts: DateTime<Utc>,
    features: &Value,
    prediction: &str,
    probability: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into ml_predictions (symbol, signal_ts, features, prediction, probability)
        values ($1, $2, $3, $4, $5)
        on conflict (symbol, signal_ts) do update set
            features = excluded.features,
            prediction = excluded.prediction,
            probability = excluded.probability
        "#,
    )
    .bind(symbol)
    .bind(signal_ts)
    .bind(features)
    .bind(prediction)
    .bind(probability)
    .execute(pool)
    .await
    .context("upsert_prediction failed")?;
    Ok(())
}

/// Deactivate the previous snapshot and insert the new active one.
async fn insert_active_parameters(pool: &PgPool, params: &Value) -> Result<()> {
    sqlx::query("update trading_parameters set active = false where active")
        .execute(pool)
        .await
        .context("deactivate parameters failed")?;

    sqlx::query(
        r#"insert into trading_parameters (active, params) values (true, $1)"#,
    )
    .bind(params)
    .execute(pool)
    .await
    .context("insert parameters failed")?;
    Ok(())
}

async fn upsert_position(
    pool: &PgPool,
    symbol: &str,
    qty: f64,
    avg_entry_price: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    partials_taken: &[String],
) -> Result<()> {
    let partials = serde_json::to_value(partials_taken).context("serialise partials")?;
    sqlx::query(
        r#"
        insert into positions (symbol, qty, avg_entry_price, stop_loss, take_profit,
                               partial_profits_taken, updated_at)
        values ($1, $2, $3, $4, $5, $6, now())
        on conflict (symbol) do update set
            qty = excluded.qty,
            avg_entry_price = excluded.avg_entry_price,
            stop_loss = excluded.stop_loss,
            take_profit = excluded.take_profit,
            partial_profits_taken = excluded.partial_profits_taken,
            updated_at = now()
        "#,
    )
    .bind(symbol)
    .bind(qty)
    .bind(avg_entry_price)
    .bind(stop_loss)
    .bind(take_profit)
    .bind(partials)
    .execute(pool)
    .await
    .context("upsert_position failed")?;
    Ok(())
}

async fn delete_position(pool: &PgPool, symbol: &str) -> Result<()> {
    sqlx::query("delete from positions where symbol = $1")
        .bind(symbol)
        .execute(pool)
        .await
        .context("delete_position failed")?;
    Ok(())
}

/// Read back the partial-profit flags for every persisted position, used to
/// hydrate the position manager at startup.
pub async fn load_partial_flags(pool: &PgPool) -> Result<HashMap<String, Vec<String>>> {
    let rows = sqlx::query("select symbol, partial_profits_taken from positions")
        .fetch_all(pool)
        .await
        .context("load_partial_flags failed")?;

    let mut flags = HashMap::new();
    for row in rows {
        let symbol: String = row.try_get("symbol")?;
        let taken: Value = row.try_get("partial_profits_taken")?;
        let rungs: Vec<String> = serde_json::from_value(taken).unwrap_or_default();
        flags.insert(symbol, rungs);
    }
    Ok(flags)
}
