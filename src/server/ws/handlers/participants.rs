//! Participant, moderator and chat handlers.

use serde_json::{json, Value};

use super::super::*;
use super::require_string_param;

pub(super) fn handle_participant_join(
    params: Option<&Value>,
    state: &WsServerState,
    conn: &ConnectionContext,
) -> Result<Value, ErrorShape> {
    let name = require_string_param(params, "name")?;
    let outcome = state.coordinator.join(conn.id, name)?;
    state.hub.set_class(conn.id, ConnectionClass::Participant);

    let mut payload = json!({
        "name": outcome.participant.name,
        "status": outcome.phase.as_str(),
        "rejoined": outcome.rejoined
    });
    if let Some(poll) = outcome.current_poll {
        payload["currentPoll"] = json!(poll);
    }
    Ok(payload)
}

pub(super) fn handle_moderator_join(
    params: Option<&Value>,
    state: &WsServerState,
    conn: &ConnectionContext,
) -> Result<Value, ErrorShape> {
    let name = require_string_param(params, "name")?;
    // Class first, so deliveries planned during the join already reach it.
    state.hub.set_class(conn.id, ConnectionClass::Moderator);
    let snapshot = match state.coordinator.moderator_join(conn.id, name) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            state.hub.set_class(conn.id, ConnectionClass::Guest);
            return Err(err.into());
        }
    };

    let mut payload = json!({
        "name": snapshot.name,
        "participants": snapshot.participants,
        "status": snapshot.phase.as_str()
    });
    if let Some(poll) = snapshot.current_poll {
        payload["currentPoll"] = json!(poll);
    }
    Ok(payload)
}

pub(super) fn handle_participant_kick(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let name = require_string_param(params, "name")?;
    let removed = state.coordinator.kick(name)?;
    state.hub.set_class(removed, ConnectionClass::Guest);
    Ok(json!({ "ok": true }))
}

pub(super) fn handle_chat_send(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let from = require_string_param(params, "from")?;
    let message = require_string_param(params, "message")?;
    let role = require_string_param(params, "role")?;
    state.coordinator.relay_chat(from, message, role)?;
    Ok(json!({ "ok": true }))
}
