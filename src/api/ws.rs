// =============================================================================
// WebSocket Stream — snapshot on connect, events thereafter
// =============================================================================
//
// Clients connect to `/stream?token=<token>` and receive:
//   1. An immediate `snapshot` frame with the full engine state.
//   2. `log` / `position` / `metrics` / `signal` / `order` frames as the
//      engine publishes them on the event bus.
//
// A consumer that falls behind lags (drops old events) instead of
// back-pressuring the trading loops; per-symbol order is preserved, global
// order is not.
// =============================================================================

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::ApiContext;

#[derive(Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_stream(socket, ctx))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_stream(socket: WebSocket, ctx: ApiContext) {
    let (mut sender, mut receiver) = socket.split();

    // ── 1. Initial snapshot frame ───────────────────────────────────────
    let snapshot = ctx.state.build_snapshot();
    let frame = serde_json::json!({
        "type": "snapshot",
        "payload": snapshot,
    });
    match serde_json::to_string(&frame) {
        Ok(json) => {
            if let Err(e) = sender.send(Message::Text(json)).await {
                warn!(error = %e, "failed to send initial snapshot");
                return;
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to serialise snapshot");
            return;
        }
    }

    // ── 2. Event fan-out + client receive loop ──────────────────────────
    let mut events = ctx.state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if let Err(e) = sender.send(Message::Text(json)).await {
                                    debug!(error = %e, "WebSocket send failed — disconnecting");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to serialise event"),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Tell the client it missed events so it can
                        // re-sync from a fresh snapshot if it cares.
                        debug!(skipped, "WebSocket consumer lagged");
                        let notice = serde_json::json!({
                            "type": "log",
                            "level": "warn",
                            "message": format!("stream lagged; {skipped} events dropped"),
                            "at": chrono::Utc::now().to_rfc3339(),
                        });
                        if sender
                            .send(Message::Text(notice.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("event bus closed — ending stream");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/binary/pong from the client carry no commands;
                        // the REST surface is the command channel.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket connection closed");
}
