//! WebSocket server
//!
//! JSON frame protocol:
//! - client request: `{"type":"req","id","method","params"}`
//! - response: `{"type":"res","id","ok","payload"|"error"}`
//! - server event: `{"type":"event","event","payload"}`

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::history::HistoryWriter;
use crate::polls::{PollCoordinator, PollError};
use crate::roster::ConnectionId;
use crate::server::connect_info::MaybeConnectInfo;
use crate::server::metrics::POLL_METRICS;
use crate::now_ms;

mod handlers;
pub mod hub;

pub use hub::{ConnectionClass, ConnectionHub};

pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub const ERROR_VALIDATION: &str = "VALIDATION_ERROR";
pub const ERROR_FORBIDDEN: &str = "FORBIDDEN";

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn error_shape(code: &str, message: &str, details: Option<Value>) -> ErrorShape {
    ErrorShape {
        code: code.to_string(),
        message: message.to_string(),
        details,
    }
}

impl From<PollError> for ErrorShape {
    fn from(err: PollError) -> Self {
        let details = match &err {
            PollError::InvalidOption(option) => Some(json!({ "option": option })),
            PollError::NotFound(name) => Some(json!({ "name": name })),
            _ => None,
        };
        error_shape(err.code(), &err.to_string(), details)
    }
}

#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(rename = "type")]
    frame_type: String,
    id: String,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ResponseFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    id: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorShape>,
}

#[derive(Debug, Serialize)]
struct EventFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    event: &'a str,
    payload: &'a Value,
}

pub(crate) fn event_frame_text(event: &str, payload: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EventFrame {
        frame_type: "event",
        event,
        payload,
    })
}

fn response_text(id: &str, result: Result<Value, ErrorShape>) -> String {
    let frame = match result {
        Ok(payload) => ResponseFrame {
            frame_type: "res",
            id,
            ok: true,
            payload: Some(payload),
            error: None,
        },
        Err(error) => ResponseFrame {
            frame_type: "res",
            id,
            ok: false,
            payload: None,
            error: Some(error),
        },
    };
    serde_json::to_string(&frame).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to encode response");
        json!({
            "type": "res",
            "id": id,
            "ok": false,
            "error": { "code": ERROR_UNAVAILABLE, "message": "response encoding failed" }
        })
        .to_string()
    })
}

/// Shared state for the HTTP and WebSocket handlers.
pub struct WsServerState {
    pub coordinator: PollCoordinator,
    pub hub: Arc<ConnectionHub>,
    pub history: HistoryWriter,
    /// Name of the open history backend, if any
    pub history_backend: Option<&'static str>,
    pub start_time: Instant,
}

impl WsServerState {
    pub fn new(
        coordinator: PollCoordinator,
        hub: Arc<ConnectionHub>,
        history: HistoryWriter,
        history_backend: Option<&'static str>,
    ) -> Self {
        Self {
            coordinator,
            hub,
            history,
            history_backend,
            start_time: Instant::now(),
        }
    }
}

/// Per-socket context handed to method handlers.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
}

/// `GET /ws`
pub async fn ws_handler(
    State(state): State<Arc<WsServerState>>,
    MaybeConnectInfo(peer): MaybeConnectInfo,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsServerState>, peer: Option<SocketAddr>) {
    let (id, mut outbound) = state.hub.connect(peer);
    let conn = ConnectionContext { id, peer };
    POLL_METRICS.ws_connections_active.inc();

    let (mut sender, mut receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let lagged = state.hub.lag_signal(id).unwrap_or_default();
    loop {
        let message = tokio::select! {
            _ = lagged.cancelled() => {
                tracing::info!(connection = %id, "closing lagging connection");
                break;
            }
            message = receiver.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection = %id, error = %e, "websocket read failed");
                break;
            }
        };

        let response = handle_request_text(&state, &conn, text.as_str());
        let Some(tx) = state.hub.sender(id) else {
            break;
        };
        let sent = tokio::select! {
            _ = lagged.cancelled() => false,
            result = tx.send(response) => result.is_ok(),
        };
        if !sent {
            break;
        }
    }

    state.hub.disconnect(id);
    state.coordinator.disconnect(id);
    POLL_METRICS.ws_connections_active.dec();
    if lagged.is_cancelled() {
        // The peer is not reading; do not wait for its backlog to flush.
        writer.abort();
    } else {
        let _ = writer.await;
    }
}

/// Decode one request frame, dispatch it, and encode the response.
pub(crate) fn handle_request_text(
    state: &WsServerState,
    conn: &ConnectionContext,
    text: &str,
) -> String {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return response_text(
                "",
                Err(error_shape(
                    ERROR_INVALID_REQUEST,
                    "invalid JSON",
                    Some(json!({ "error": e.to_string() })),
                )),
            )
        }
    };
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let frame = match serde_json::from_value::<RequestFrame>(value) {
        Ok(frame) if frame.frame_type == "req" => frame,
        Ok(frame) => {
            return response_text(
                &id,
                Err(error_shape(
                    ERROR_INVALID_REQUEST,
                    "expected a request frame",
                    Some(json!({ "type": frame.frame_type })),
                )),
            )
        }
        Err(e) => {
            return response_text(
                &id,
                Err(error_shape(
                    ERROR_INVALID_REQUEST,
                    "malformed request frame",
                    Some(json!({ "error": e.to_string() })),
                )),
            )
        }
    };

    tracing::debug!(connection = %conn.id, method = %frame.method, "request");
    let result = handlers::dispatch_method(&frame.method, frame.params.as_ref(), state, conn);
    let label = match &result {
        Err(error) if error.code == ERROR_UNAVAILABLE => "unknown",
        _ => frame.method.as_str(),
    };
    POLL_METRICS.ws_messages_total.inc(&[label]);
    response_text(&frame.id, result)
}
