//! pollroom library
//!
//! Live classroom polling: one moderator broadcasts a single timed
//! multiple-choice question, participants answer over WebSocket, and the
//! coordinator decides when the poll ends and who sees which results.

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod history;
pub mod logging;
pub mod polls;
pub mod roster;
pub mod server;

/// Current wall-clock time as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
