//! Poll handlers.

use serde_json::{json, Value};

use super::super::*;
use super::require_string_param;

pub(super) fn handle_poll_start(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let question = params
        .and_then(|v| v.get("question"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let options = read_options(params)?;
    let timeout_secs = params
        .and_then(|v| v.get("timeoutSecs"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| {
            error_shape(
                ERROR_VALIDATION,
                "timeoutSecs must be a positive integer",
                Some(json!({ "param": "timeoutSecs" })),
            )
        })?;

    let poll = state.coordinator.start(question, &options, timeout_secs)?;
    Ok(json!({ "poll": poll }))
}

fn read_options(params: Option<&Value>) -> Result<Vec<String>, ErrorShape> {
    let invalid = || {
        error_shape(
            ERROR_VALIDATION,
            "options must be an array of strings",
            Some(json!({ "param": "options" })),
        )
    };
    let Some(raw) = params.and_then(|v| v.get("options")) else {
        return Ok(Vec::new());
    };
    raw.as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|option| option.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

pub(super) fn handle_poll_answer(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let name = require_string_param(params, "name")?;
    let option = require_string_param(params, "option")?;
    let results = state.coordinator.submit_answer(name, option)?;
    Ok(json!({
        "results": results,
        "message": "Answer recorded"
    }))
}

/// A missing poll is reported in the payload rather than as a failure, so
/// clients can poll this while idle.
pub(super) fn handle_poll_has_answered(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let name = require_string_param(params, "name")?;
    match state.coordinator.has_answered(name) {
        Ok(answered) => Ok(json!({ "hasAnswered": answered })),
        Err(PollError::NoActivePoll) => Ok(json!({
            "hasAnswered": false,
            "error": PollError::NoActivePoll.to_string()
        })),
        Err(err) => Err(err.into()),
    }
}

pub(super) fn handle_poll_history(state: &WsServerState) -> Result<Value, ErrorShape> {
    Ok(json!({ "polls": state.coordinator.history() }))
}
