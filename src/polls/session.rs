//! Poll Session Records
//!
//! The live session held by the coordinator and the immutable record it
//! becomes once completed.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::PollError;
use super::tally::{self, Tally};

/// Poll session identifier, allocated in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollId(pub u64);

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Active,
    Completed,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Active => "active",
            PollStatus::Completed => "completed",
        }
    }
}

/// Why a session completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionReason {
    /// The deadline elapsed
    Deadline,
    /// Every registered participant answered before the deadline
    AllAnswered,
    /// Found still active in the history store at startup
    Recovered,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::Deadline => "deadline",
            CompletionReason::AllAnswered => "allAnswered",
            CompletionReason::Recovered => "recovered",
        }
    }
}

/// Answers keyed by participant display name.
///
/// Writes go through [`Answers::record`], which rejects anything that is not
/// one of the session's declared options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Answers(IndexMap<String, String>);

impl Answers {
    /// Record `name`'s answer, replacing any earlier one.
    ///
    /// Returns the replaced answer, if there was one.
    pub fn record(
        &mut self,
        options: &[String],
        name: &str,
        option: &str,
    ) -> Result<Option<String>, PollError> {
        if !options.iter().any(|declared| declared == option) {
            return Err(PollError::InvalidOption(option.to_string()));
        }
        Ok(self.0.insert(name.to_string(), option.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single question with its options, answers and lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSession {
    pub id: PollId,
    pub question: String,
    pub options: Vec<String>,
    pub timeout_secs: u64,
    /// Unix ms
    pub start_time: i64,
    #[serde(default)]
    pub answers: Answers,
    pub status: PollStatus,
    /// Unix ms, set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CompletionReason>,
    #[serde(default)]
    pub tally: Tally,
}

impl PollSession {
    pub(crate) fn new(
        id: PollId,
        question: String,
        options: Vec<String>,
        timeout_secs: u64,
        start_time: i64,
    ) -> Self {
        let tally = tally::tally(&options, std::iter::empty::<&str>());
        Self {
            id,
            question,
            options,
            timeout_secs,
            start_time,
            answers: Answers::default(),
            status: PollStatus::Active,
            end_time: None,
            reason: None,
            tally,
        }
    }

    /// Unix ms at which the deadline fires.
    pub fn deadline(&self) -> i64 {
        self.start_time
            .saturating_add((self.timeout_secs as i64).saturating_mul(1000))
    }

    pub fn is_active(&self) -> bool {
        self.status == PollStatus::Active
    }

    /// Validate and record an answer, keeping the running tally current.
    pub(crate) fn record_answer(
        &mut self,
        name: &str,
        option: &str,
    ) -> Result<Option<String>, PollError> {
        let previous = self.answers.record(&self.options, name, option)?;
        self.tally = tally::tally(&self.options, self.answers.values());
        Ok(previous)
    }

    /// Close the session and freeze it into a history record.
    pub(crate) fn complete(mut self, end_time: i64, reason: CompletionReason) -> HistoryRecord {
        self.tally = tally::tally(&self.options, self.answers.values());
        self.status = PollStatus::Completed;
        self.end_time = Some(end_time);
        self.reason = Some(reason);
        HistoryRecord {
            id: self.id,
            question: self.question,
            options: self.options,
            timeout_secs: self.timeout_secs,
            start_time: self.start_time,
            end_time,
            answers: self.answers,
            tally: self.tally,
            reason,
        }
    }

    /// The completed record, if this session has been closed.
    pub fn into_record(self) -> Option<HistoryRecord> {
        match (self.status, self.end_time, self.reason) {
            (PollStatus::Completed, Some(end_time), Some(reason)) => Some(HistoryRecord {
                id: self.id,
                question: self.question,
                options: self.options,
                timeout_secs: self.timeout_secs,
                start_time: self.start_time,
                end_time,
                answers: self.answers,
                tally: self.tally,
                reason,
            }),
            _ => None,
        }
    }
}

/// Immutable snapshot of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: PollId,
    pub question: String,
    pub options: Vec<String>,
    pub timeout_secs: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub answers: Answers,
    pub tally: Tally,
    pub reason: CompletionReason,
}

impl HistoryRecord {
    /// The session form used by history stores.
    pub fn to_session(&self) -> PollSession {
        PollSession {
            id: self.id,
            question: self.question.clone(),
            options: self.options.clone(),
            timeout_secs: self.timeout_secs,
            start_time: self.start_time,
            answers: self.answers.clone(),
            status: PollStatus::Completed,
            end_time: Some(self.end_time),
            reason: Some(self.reason),
            tally: self.tally.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PollSession {
        PollSession::new(
            PollId(7),
            "Favourite colour?".to_string(),
            vec!["red".to_string(), "blue".to_string()],
            30,
            1_000,
        )
    }

    #[test]
    fn test_new_session_has_zero_tally() {
        let s = session();
        assert!(s.is_active());
        assert_eq!(s.tally.get("red"), Some(&0));
        assert_eq!(s.tally.get("blue"), Some(&0));
        assert_eq!(s.deadline(), 31_000);
    }

    #[test]
    fn test_record_answer_rejects_undeclared_option() {
        let mut s = session();
        let err = s.record_answer("p1", "green").unwrap_err();
        assert_eq!(err, PollError::InvalidOption("green".to_string()));
        assert!(s.answers.is_empty());
        assert_eq!(tally::total(&s.tally), 0);
    }

    #[test]
    fn test_record_answer_overwrites() {
        let mut s = session();
        assert_eq!(s.record_answer("p1", "red").unwrap(), None);
        assert_eq!(s.record_answer("p1", "blue").unwrap(), Some("red".to_string()));
        assert_eq!(s.answers.len(), 1);
        assert_eq!(s.tally.get("red"), Some(&0));
        assert_eq!(s.tally.get("blue"), Some(&1));
    }

    #[test]
    fn test_complete_round_trips_through_session_form() {
        let mut s = session();
        s.record_answer("p1", "red").unwrap();
        let record = s.complete(5_000, CompletionReason::AllAnswered);
        assert_eq!(record.end_time, 5_000);
        assert_eq!(record.tally.get("red"), Some(&1));

        let stored = record.to_session();
        assert_eq!(stored.status, PollStatus::Completed);
        assert_eq!(stored.into_record(), Some(record));
    }

    #[test]
    fn test_active_session_has_no_record() {
        assert!(session().into_record().is_none());
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let value = serde_json::to_value(session()).unwrap();
        assert_eq!(value["timeoutSecs"], 30);
        assert_eq!(value["startTime"], 1_000);
        assert_eq!(value["status"], "active");
        assert!(value.get("endTime").is_none());
    }
}
