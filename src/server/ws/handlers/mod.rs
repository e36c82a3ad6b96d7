//! WebSocket handlers

use serde_json::{json, Value};

use super::*;

mod participants;
mod polls;

use participants::*;
use polls::*;

pub(super) fn handle_health() -> Value {
    json!({
        "ts": now_ms(),
        "status": "healthy"
    })
}

pub(super) fn handle_status(state: &WsServerState) -> Value {
    let status = state.coordinator.status();
    json!({
        "ts": now_ms(),
        "status": "ok",
        "uptimeMs": state.start_time.elapsed().as_millis() as u64,
        "version": env!("CARGO_PKG_VERSION"),
        "poll": status,
        "connections": {
            "total": state.hub.len(),
            "moderators": state.hub.count_by_class(ConnectionClass::Moderator),
            "participants": state.hub.count_by_class(ConnectionClass::Participant)
        },
        "historyStore": state.history_backend
    })
}

/// Raw string parameter, untrimmed.
fn string_param<'a>(params: Option<&'a Value>, key: &str) -> Option<&'a str> {
    params.and_then(|v| v.get(key)).and_then(|v| v.as_str())
}

/// Required string parameter; missing or blank is a validation error.
fn require_string_param<'a>(params: Option<&'a Value>, key: &str) -> Result<&'a str, ErrorShape> {
    string_param(params, key)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            error_shape(
                ERROR_VALIDATION,
                &format!("{} is required", key),
                Some(json!({ "param": key })),
            )
        })
}

/// Methods only a connection that joined as moderator may call.
const MODERATOR_METHODS: [&str; 2] = ["poll.start", "participant.kick"];

/// Reject moderator-only methods from guests and participants.
pub(super) fn check_method_authorization(
    method: &str,
    state: &WsServerState,
    conn: &ConnectionContext,
) -> Result<(), ErrorShape> {
    if !MODERATOR_METHODS.contains(&method) {
        return Ok(());
    }
    let class = state.hub.class_of(conn.id).unwrap_or(ConnectionClass::Guest);
    if class == ConnectionClass::Moderator {
        return Ok(());
    }
    tracing::debug!(connection = %conn.id, method, ?class, "moderator method refused");
    Err(error_shape(
        ERROR_FORBIDDEN,
        &format!("method '{}' requires moderator.join first", method),
        Some(json!({
            "method": method,
            "requiredClass": "moderator"
        })),
    ))
}

pub(super) fn dispatch_method(
    method: &str,
    params: Option<&Value>,
    state: &WsServerState,
    conn: &ConnectionContext,
) -> Result<Value, ErrorShape> {
    check_method_authorization(method, state, conn)?;

    match method {
        // Health/status
        "health" => Ok(handle_health()),
        "status" => Ok(handle_status(state)),

        // Participants
        "participant.join" => handle_participant_join(params, state, conn),
        "moderator.join" => handle_moderator_join(params, state, conn),
        "participant.kick" => handle_participant_kick(params, state),
        "chat.send" => handle_chat_send(params, state),

        // Polls
        "poll.start" => handle_poll_start(params, state),
        "poll.answer" => handle_poll_answer(params, state),
        "poll.hasAnswered" => handle_poll_has_answered(params, state),
        "poll.history" => handle_poll_history(state),

        _ => Err(error_shape(
            ERROR_UNAVAILABLE,
            "method unavailable",
            Some(json!({ "method": method })),
        )),
    }
}
