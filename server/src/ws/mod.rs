//! WebSocket connection surface.
//!
//! One persistent connection per browser tab. All messages are JSON objects
//! with a `"type"` field; the closed client→server set is a tagged enum, not
//! reflective dispatch.
//!
//! ## Message types (client → server)
//!
//! | Type          | Fields          |
//! |---------------|-----------------|
//! | `join_queue`  | `inviteToken?`  |
//! | `leave_queue` | —               |
//! | `heartbeat`   | —               |
//!
//! ## Message types (server → client)
//!
//! `status`, `queue_position`, `queue_full`, `left_queue`, `session_token`,
//! `session_starting`, `session_warning`, `session_ended`, `invite_invalid`,
//! `heartbeat_ack`, `error` — emitted by the coordinator except for
//! `heartbeat_ack` and the two parse errors, which the surface answers
//! directly.
//!
//! On connection close the surface reports the disconnect to the coordinator,
//! which starts the reconnect grace window if the closer held the session.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::AppState;

/// The closed set of client→server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    JoinQueue {
        #[serde(rename = "inviteToken")]
        invite_token: Option<String>,
    },
    LeaveQueue,
    Heartbeat,
}

const KNOWN_TYPES: &[&str] = &["join_queue", "leave_queue", "heartbeat"];

/// Network-layer identity of the peer as observed through the reverse proxy:
/// first `X-Forwarded-For` entry when present, else the socket peer address.
pub fn source_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// `GET /ws` — WebSocket upgrade handler. The reverse proxy has already
/// gated access via the invite sub-request; the upgrade itself is open.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let source = source_address(&headers, peer);
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    ws.on_upgrade(move |socket| handle_ws(socket, state, source, user_agent))
}

/// Main connection loop: register with the coordinator, funnel outbound
/// frames through an mpsc channel, dispatch inbound frames, and report the
/// disconnect when the stream ends.
async fn handle_ws(
    socket: WebSocket,
    state: AppState,
    source: String,
    user_agent: Option<String>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Value>(256);
    let client_id = state.coordinator.register(tx.clone(), source, user_agent).await;

    // Task: forward channel messages to the WebSocket sink.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize frame: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    let _ = tx
                        .send(json!({"type": "error", "message": "Invalid message format"}))
                        .await;
                    continue;
                };
                match serde_json::from_value::<ClientMessage>(parsed.clone()) {
                    Ok(ClientMessage::JoinQueue { invite_token }) => {
                        state.coordinator.join(&client_id, invite_token).await;
                    }
                    Ok(ClientMessage::LeaveQueue) => {
                        state.coordinator.leave(&client_id).await;
                    }
                    Ok(ClientMessage::Heartbeat) => {
                        let _ = tx.send(json!({"type": "heartbeat_ack"})).await;
                    }
                    Err(_) => {
                        let message = match parsed.get("type").and_then(Value::as_str) {
                            Some(t) if !KNOWN_TYPES.contains(&t) => {
                                format!("Unknown message type: {t}")
                            }
                            _ => "Invalid message format".to_string(),
                        };
                        let _ = tx.send(json!({"type": "error", "message": message})).await;
                    }
                }
            }
            Message::Close(_) => break,
            // Control frames are handled by the stack; binary is ignored.
            _ => {}
        }
    }

    debug!("Client {client_id} connection closed");
    state.coordinator.disconnect(&client_id).await;
    send_task.abort();
}
