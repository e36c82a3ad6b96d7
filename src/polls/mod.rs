//! Polling Module
//!
//! One timed multiple-choice question at a time: typed session records, the
//! answer aggregator, and the coordinator that owns the poll lifecycle.

pub mod coordinator;
pub mod error;
pub mod session;
pub mod tally;

pub use coordinator::{
    CoordinatorStatus, JoinOutcome, ModeratorSnapshot, PollCoordinator, PollPhase, PollSettings,
    RecoveryReport,
};
pub use error::PollError;
pub use session::{Answers, CompletionReason, HistoryRecord, PollId, PollSession, PollStatus};
pub use tally::{personal_tally, tally, Tally};
