// =============================================================================
// Event Bus — append-only fan-out to WebSocket clients and persistence
// =============================================================================
//
// Trading loops publish; the WS handler and the persistence worker subscribe.
// The bus is a tokio broadcast channel: publishing never blocks a trading
// loop, and a slow consumer lags (drops old events) instead of back-pressuring
// the engine. Per-symbol ordering is preserved because each symbol's pipeline
// is serialized upstream; global ordering is not guaranteed.
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffered events per subscriber before lagging kicks in.
const BUS_CAPACITY: usize = 512;

/// What happened to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionAction {
    Opened,
    Closed,
    PnlUpdate,
}

/// A frame on the engine event stream. The `type` tag matches the WS wire
/// format (`log`, `position`, `metrics`, `signal`, `order`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Log {
        level: String,
        message: String,
        at: String,
    },
    Position {
        action: PositionAction,
        symbol: String,
        payload: serde_json::Value,
    },
    Metrics {
        payload: serde_json::Value,
    },
    Signal {
        symbol: String,
        side: String,
        confidence: f64,
        payload: serde_json::Value,
    },
    Order {
        symbol: String,
        status: String,
        payload: serde_json::Value,
    },
}

/// Clonable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Subscribe a new consumer. Each subscriber sees every event published
    /// after this call, minus anything it lags past.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means nobody is listening, which
    /// is fine — the engine trades with or without an audience.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Convenience: publish a `log` frame.
    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.publish(EngineEvent::Log {
            level: level.to_string(),
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        });
    }

    /// Current number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
