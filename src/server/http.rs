//! HTTP routes
//!
//! Read-only JSON views of the poll state, the metrics endpoint and the
//! WebSocket upgrade. Browser frontends on other origins reach the JSON
//! views through the CORS layer.

use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::metrics::metrics_handler;
use super::ws::{ws_handler, WsServerState};

/// Build the application router, allowing `cors_origins` cross-origin.
pub fn build_router(state: Arc<WsServerState>, cors_origins: &[String]) -> Router {
    let router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/polls", get(polls_handler))
        .route("/api/polls/active", get(active_poll_handler))
        .route("/api/participants", get(participants_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler));

    let router = match cors_layer(cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };
    router.with_state(state)
}

/// CORS policy for the configured origins. `None` when the list is empty.
///
/// `"*"` allows any origin without credentials; an explicit list allows
/// credentials. Origins that are not valid header values are skipped.
pub fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.iter().any(|o| o == "*") {
        return Some(layer.allow_origin(Any));
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(
        layer
            .allow_origin(AllowOrigin::list(allowed))
            .allow_credentials(true),
    )
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn root_handler(State(state): State<Arc<WsServerState>>) -> impl IntoResponse {
    let status = state.coordinator.status();
    Json(json!({
        "status": "running",
        "participants": status.participants,
        "activePoll": status.active_poll.is_some(),
        "historyStore": state.history_backend.unwrap_or("none"),
    }))
}

async fn polls_handler(State(state): State<Arc<WsServerState>>) -> impl IntoResponse {
    Json(state.coordinator.history())
}

async fn active_poll_handler(State(state): State<Arc<WsServerState>>) -> Response {
    match state.coordinator.active() {
        Some(poll) => Json(poll).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No active poll" })),
        )
            .into_response(),
    }
}

async fn participants_handler(State(state): State<Arc<WsServerState>>) -> impl IntoResponse {
    Json(state.coordinator.participants())
}
