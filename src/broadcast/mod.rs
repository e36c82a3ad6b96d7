//! Broadcast Routing
//!
//! Decides which connection sees which view of a poll event. [`plan`] is pure:
//! it turns an event and the current roster into a list of [`Delivery`]
//! values, and a [`DeliverySink`] performs the sends.

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::polls::{HistoryRecord, PollSession};
use crate::roster::{ConnectionId, Roster};

pub const EVENT_PARTICIPANTS_UPDATED: &str = "participants.updated";
pub const EVENT_POLL_STARTED: &str = "poll.started";
pub const EVENT_POLL_PROGRESS: &str = "poll.progress";
pub const EVENT_POLL_RESULTS: &str = "poll.results";
pub const EVENT_POLL_ENDED: &str = "poll.ended";
pub const EVENT_PARTICIPANT_KICKED: &str = "participant.kicked";
pub const EVENT_CHAT_MESSAGE: &str = "chat.message";

const KICK_REASON: &str = "Kicked by moderator";

/// Something the coordinator wants the connected clients to hear about.
#[derive(Debug, Clone, Copy)]
pub enum PollEvent<'a> {
    RosterChanged,
    PollStarted {
        session: &'a PollSession,
    },
    AnswerRecorded {
        session: &'a PollSession,
    },
    PollCompleted {
        record: &'a HistoryRecord,
    },
    ParticipantKicked {
        connection: ConnectionId,
        name: &'a str,
    },
    ModeratorSynced {
        connection: ConnectionId,
        session: &'a PollSession,
    },
    ChatMessage {
        from: &'a str,
        message: &'a str,
        role: &'a str,
        timestamp: i64,
    },
}

/// Who receives a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    EveryoneExcept(ConnectionId),
    Moderators,
    Connection(ConnectionId),
}

/// One event frame addressed to an audience.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub audience: Audience,
    pub event: &'static str,
    pub payload: Value,
}

impl Delivery {
    fn new(audience: Audience, event: &'static str, payload: Value) -> Self {
        Self {
            audience,
            event,
            payload,
        }
    }
}

/// Performs the actual sends. Must not block.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, delivery: &Delivery);
}

/// Route an event to its audiences, in send order.
pub fn plan(event: &PollEvent<'_>, roster: &Roster) -> Vec<Delivery> {
    match *event {
        PollEvent::RosterChanged => vec![Delivery::new(
            Audience::Everyone,
            EVENT_PARTICIPANTS_UPDATED,
            participants_payload(roster),
        )],
        PollEvent::PollStarted { session } => vec![Delivery::new(
            Audience::Everyone,
            EVENT_POLL_STARTED,
            json!({
                "id": session.id,
                "question": session.question,
                "options": session.options,
                "timeoutSecs": session.timeout_secs,
                "startTime": session.start_time,
            }),
        )],
        PollEvent::AnswerRecorded { session } => {
            let mut deliveries = vec![Delivery::new(
                Audience::Everyone,
                EVENT_POLL_PROGRESS,
                progress_payload(session, roster),
            )];
            let results = partial_results_payload(session);
            // Participants who answered and then left have no connection to reach.
            deliveries.extend(
                session
                    .answers
                    .names()
                    .filter_map(|name| roster.connection_for(name))
                    .map(|conn| {
                        Delivery::new(Audience::Connection(conn), EVENT_POLL_RESULTS, results.clone())
                    }),
            );
            deliveries.push(Delivery::new(Audience::Moderators, EVENT_POLL_RESULTS, results));
            deliveries
        }
        PollEvent::PollCompleted { record } => vec![
            Delivery::new(
                Audience::Everyone,
                EVENT_POLL_RESULTS,
                json!({
                    "pollId": record.id,
                    "results": record.tally,
                    "final": true,
                }),
            ),
            Delivery::new(
                Audience::Everyone,
                EVENT_POLL_ENDED,
                json!({
                    "pollId": record.id,
                    "reason": record.reason,
                }),
            ),
        ],
        PollEvent::ParticipantKicked { connection, name } => vec![
            Delivery::new(
                Audience::Connection(connection),
                EVENT_PARTICIPANT_KICKED,
                json!({ "name": name, "reason": KICK_REASON }),
            ),
            Delivery::new(
                Audience::EveryoneExcept(connection),
                EVENT_PARTICIPANTS_UPDATED,
                participants_payload(roster),
            ),
        ],
        PollEvent::ModeratorSynced {
            connection,
            session,
        } => vec![
            Delivery::new(
                Audience::Connection(connection),
                EVENT_POLL_RESULTS,
                partial_results_payload(session),
            ),
            Delivery::new(
                Audience::Connection(connection),
                EVENT_POLL_PROGRESS,
                progress_payload(session, roster),
            ),
        ],
        PollEvent::ChatMessage {
            from,
            message,
            role,
            timestamp,
        } => vec![Delivery::new(
            Audience::Everyone,
            EVENT_CHAT_MESSAGE,
            json!({
                "from": from,
                "message": message,
                "role": role,
                "timestamp": timestamp,
            }),
        )],
    }
}

fn partial_results_payload(session: &PollSession) -> Value {
    json!({
        "pollId": session.id,
        "results": session.tally,
        "final": false,
    })
}

fn progress_payload(session: &PollSession, roster: &Roster) -> Value {
    json!({
        "pollId": session.id,
        "total": roster.count(),
        "answered": session.answers.len(),
    })
}

fn participants_payload(roster: &Roster) -> Value {
    json!({ "participants": roster.list() })
}

/// Sink that keeps every delivery, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }

    pub fn snapshot(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Deliveries of a single event type.
    pub fn of_event(&self, event: &str) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.event == event)
            .cloned()
            .collect()
    }
}

impl DeliverySink for RecordingSink {
    fn deliver(&self, delivery: &Delivery) {
        self.deliveries.lock().push(delivery.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polls::{CompletionReason, PollId};

    fn active_session() -> PollSession {
        PollSession::new(
            PollId(1),
            "Q?".to_string(),
            vec!["A".to_string(), "B".to_string()],
            60,
            0,
        )
    }

    #[test]
    fn test_roster_changed_goes_to_everyone() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(1), "p1");
        let deliveries = plan(&PollEvent::RosterChanged, &roster);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].audience, Audience::Everyone);
        assert_eq!(deliveries[0].event, EVENT_PARTICIPANTS_UPDATED);
        assert_eq!(deliveries[0].payload["participants"][0]["name"], "p1");
    }

    #[test]
    fn test_answer_routes_partial_results_to_answerers_and_moderators() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(1), "p1");
        roster.register(ConnectionId(2), "p2");
        let mut session = active_session();
        session.record_answer("p1", "A").unwrap();

        let deliveries = plan(&PollEvent::AnswerRecorded { session: &session }, &roster);
        assert_eq!(deliveries[0].event, EVENT_POLL_PROGRESS);
        assert_eq!(deliveries[0].payload["total"], 2);
        assert_eq!(deliveries[0].payload["answered"], 1);

        let audiences: Vec<Audience> = deliveries
            .iter()
            .filter(|d| d.event == EVENT_POLL_RESULTS)
            .map(|d| d.audience)
            .collect();
        assert_eq!(
            audiences,
            vec![Audience::Connection(ConnectionId(1)), Audience::Moderators]
        );
        assert_eq!(deliveries[1].payload["results"]["A"], 1);
        assert_eq!(deliveries[1].payload["final"], false);
    }

    #[test]
    fn test_departed_answerer_gets_no_partial_results() {
        let roster = Roster::new();
        let mut session = active_session();
        session.record_answer("gone", "B").unwrap();

        let deliveries = plan(&PollEvent::AnswerRecorded { session: &session }, &roster);
        assert!(deliveries
            .iter()
            .all(|d| !matches!(d.audience, Audience::Connection(_))));
    }

    #[test]
    fn test_completion_sends_final_results_then_ended() {
        let roster = Roster::new();
        let record = active_session().complete(10, CompletionReason::Deadline);
        let deliveries = plan(&PollEvent::PollCompleted { record: &record }, &roster);

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].event, EVENT_POLL_RESULTS);
        assert_eq!(deliveries[0].payload["final"], true);
        assert_eq!(deliveries[0].payload["results"]["A"], 0);
        assert_eq!(deliveries[1].event, EVENT_POLL_ENDED);
        assert_eq!(deliveries[1].payload["reason"], "deadline");
    }

    #[test]
    fn test_kick_notifies_target_and_everyone_else() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(2), "p2");
        let deliveries = plan(
            &PollEvent::ParticipantKicked {
                connection: ConnectionId(1),
                name: "p1",
            },
            &roster,
        );

        assert_eq!(deliveries[0].audience, Audience::Connection(ConnectionId(1)));
        assert_eq!(deliveries[0].payload["reason"], KICK_REASON);
        assert_eq!(
            deliveries[1].audience,
            Audience::EveryoneExcept(ConnectionId(1))
        );
        assert_eq!(deliveries[1].payload["participants"][0]["name"], "p2");
    }

    #[test]
    fn test_recording_sink_filters_by_event() {
        let sink = RecordingSink::new();
        sink.deliver(&Delivery::new(Audience::Everyone, EVENT_POLL_ENDED, json!({})));
        sink.deliver(&Delivery::new(Audience::Moderators, EVENT_POLL_RESULTS, json!({})));
        assert_eq!(sink.of_event(EVENT_POLL_ENDED).len(), 1);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.snapshot().is_empty());
    }
}
