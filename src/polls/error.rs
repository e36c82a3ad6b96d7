//! Poll errors.

use thiserror::Error;

/// Errors returned to the caller of a poll operation.
///
/// None of these leave shared state modified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("a poll is already active")]
    AlreadyActive,

    #[error("no active poll")]
    NoActivePoll,

    #[error("invalid answer option: {0}")]
    InvalidOption(String),

    #[error("participant not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),
}

impl PollError {
    /// Wire error code for the WebSocket protocol.
    pub fn code(&self) -> &'static str {
        match self {
            PollError::AlreadyActive => "ALREADY_ACTIVE",
            PollError::NoActivePoll => "NO_ACTIVE_POLL",
            PollError::InvalidOption(_) => "INVALID_OPTION",
            PollError::NotFound(_) => "NOT_FOUND",
            PollError::Validation(_) => "VALIDATION_ERROR",
        }
    }

    pub(crate) fn required(field: &str) -> Self {
        PollError::Validation(format!("{} is required", field))
    }
}
