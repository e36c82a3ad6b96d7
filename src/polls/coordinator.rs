//! Poll Coordinator
//!
//! Owns the single shared poll state: the active-session slot, the roster and
//! the in-memory history. Every mutation happens under one lock, and the
//! resulting deliveries are planned and handed to the sink before the lock is
//! released, so clients observe events in state order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::PollError;
use super::session::{CompletionReason, HistoryRecord, PollId, PollSession};
use super::tally::{personal_tally, Tally};
use crate::broadcast::{self, DeliverySink, PollEvent};
use crate::history::{self, HistoryError, HistoryStore, HistoryWriter};
use crate::now_ms;
use crate::roster::{ConnectionId, Participant, Roster};
use crate::server::metrics::POLL_METRICS;

/// Poll limits (the `polls` config section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollSettings {
    /// Upper bound for `timeoutSecs` on `poll.start`
    pub max_timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_timeout_secs: 3600,
        }
    }
}

/// Whether a poll is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollPhase {
    Waiting,
    Active,
}

impl PollPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollPhase::Waiting => "waiting",
            PollPhase::Active => "active",
        }
    }
}

/// Result of a participant join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant: Participant,
    pub phase: PollPhase,
    pub current_poll: Option<PollSession>,
    pub rejoined: bool,
}

/// What a moderator sees on joining.
#[derive(Debug, Clone)]
pub struct ModeratorSnapshot {
    pub name: String,
    pub participants: Vec<Participant>,
    pub phase: PollPhase,
    pub current_poll: Option<PollSession>,
}

/// Point-in-time coordinator summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub phase: PollPhase,
    pub participants: usize,
    pub active_poll: Option<PollId>,
    pub answered: usize,
    pub completed_polls: usize,
    pub next_poll_id: u64,
}

/// Outcome of [`PollCoordinator::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub closed_active: Option<PollId>,
    pub next_poll_id: u64,
}

struct ActivePoll {
    session: PollSession,
    deadline: CancellationToken,
}

struct CoordinatorState {
    roster: Roster,
    active: Option<ActivePoll>,
    next_id: u64,
    history: Vec<HistoryRecord>,
}

struct Inner {
    state: Mutex<CoordinatorState>,
    sink: Arc<dyn DeliverySink>,
    writer: HistoryWriter,
    settings: PollSettings,
}

/// Shared handle to the poll state. Cheap to clone.
#[derive(Clone)]
pub struct PollCoordinator {
    inner: Arc<Inner>,
}

impl PollCoordinator {
    pub fn new(settings: PollSettings, sink: Arc<dyn DeliverySink>, writer: HistoryWriter) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoordinatorState {
                    roster: Roster::new(),
                    active: None,
                    next_id: 1,
                    history: Vec::new(),
                }),
                sink,
                writer,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.inner.settings
    }

    /// Register a participant on `connection`.
    pub fn join(&self, connection: ConnectionId, name: &str) -> Result<JoinOutcome, PollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PollError::required("name"));
        }

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let registration = state.roster.register(connection, name);
        if let Some(stale) = registration.displaced {
            tracing::info!(name, %stale, %connection, "participant rejoined on a new connection");
        } else {
            tracing::info!(name, %connection, rejoined = registration.rejoined, "participant joined");
        }
        self.roster_changed(&state.roster);

        let current_poll = state.active.as_ref().map(|a| a.session.clone());
        Ok(JoinOutcome {
            participant: registration.participant,
            phase: phase_of(&current_poll),
            current_poll,
            rejoined: registration.rejoined,
        })
    }

    /// Snapshot for a moderator; if a poll is running the moderator also
    /// receives the current partial results and progress.
    ///
    /// A connection that had joined as a participant leaves the roster, so it
    /// no longer counts toward all-answered. Answers it already recorded stay.
    pub fn moderator_join(
        &self,
        connection: ConnectionId,
        name: &str,
    ) -> Result<ModeratorSnapshot, PollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PollError::required("name"));
        }

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if let Some(previous) = state.roster.unregister(connection) {
            tracing::info!(name = %previous.name, %connection, "participant became moderator");
            self.roster_changed(&state.roster);
        }
        if let Some(active) = &state.active {
            self.publish(
                &state.roster,
                &PollEvent::ModeratorSynced {
                    connection,
                    session: &active.session,
                },
            );
        }
        tracing::info!(name, %connection, "moderator joined");

        let current_poll = state.active.as_ref().map(|a| a.session.clone());
        Ok(ModeratorSnapshot {
            name: name.to_string(),
            participants: state.roster.list(),
            phase: phase_of(&current_poll),
            current_poll,
        })
    }

    /// Start a poll and arm its deadline.
    pub fn start(
        &self,
        question: &str,
        options: &[String],
        timeout_secs: u64,
    ) -> Result<PollSession, PollError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.active.is_some() {
            return Err(PollError::AlreadyActive);
        }

        let question = question.trim();
        if question.is_empty() {
            return Err(PollError::required("question"));
        }
        let options: Vec<String> = options.iter().map(|o| o.trim().to_string()).collect();
        if options.is_empty() {
            return Err(PollError::Validation(
                "at least one option is required".to_string(),
            ));
        }
        if options.iter().any(String::is_empty) {
            return Err(PollError::Validation("options must not be blank".to_string()));
        }
        let max = self.inner.settings.max_timeout_secs;
        if timeout_secs == 0 || timeout_secs > max {
            return Err(PollError::Validation(format!(
                "timeoutSecs must be between 1 and {}",
                max
            )));
        }

        let id = PollId(state.next_id);
        state.next_id += 1;
        let session = PollSession::new(id, question.to_string(), options, timeout_secs, now_ms());
        let deadline = self.arm_deadline(id, timeout_secs);

        self.inner.writer.save(session.clone());
        POLL_METRICS.polls_started_total.inc();
        self.publish(&state.roster, &PollEvent::PollStarted { session: &session });
        tracing::info!(
            poll_id = %id,
            options = session.options.len(),
            timeout_secs,
            "poll started"
        );

        state.active = Some(ActivePoll {
            session: session.clone(),
            deadline,
        });
        Ok(session)
    }

    /// Record `name`'s answer and return their personal tally.
    ///
    /// Completes the poll in the same critical section when every registered
    /// participant has answered.
    pub fn submit_answer(&self, name: &str, option: &str) -> Result<Tally, PollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PollError::required("name"));
        }
        if option.is_empty() {
            return Err(PollError::required("option"));
        }

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(active) = state.active.as_mut() else {
            POLL_METRICS.answers_total.inc(&["no_active_poll"]);
            return Err(PollError::NoActivePoll);
        };

        let previous = match active.session.record_answer(name, option) {
            Ok(previous) => previous,
            Err(e) => {
                POLL_METRICS.answers_total.inc(&["invalid_option"]);
                tracing::debug!(poll_id = %active.session.id, name, option, "rejected answer");
                return Err(e);
            }
        };
        POLL_METRICS.answers_total.inc(&["accepted"]);
        tracing::debug!(
            poll_id = %active.session.id,
            name,
            option,
            replaced = previous.is_some(),
            "answer recorded"
        );

        self.inner.writer.save(active.session.clone());
        self.publish(
            &state.roster,
            &PollEvent::AnswerRecorded {
                session: &active.session,
            },
        );

        let personal = personal_tally(&active.session.options, option);
        let everyone_answered = !state.roster.is_empty()
            && state
                .roster
                .iter()
                .all(|p| active.session.answers.contains(&p.name));
        if everyone_answered {
            self.complete(state, CompletionReason::AllAnswered);
        }
        Ok(personal)
    }

    /// Whether `name` has answered the active poll.
    pub fn has_answered(&self, name: &str) -> Result<bool, PollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PollError::required("name"));
        }
        let state = self.inner.state.lock();
        state
            .active
            .as_ref()
            .map(|a| a.session.answers.contains(name))
            .ok_or(PollError::NoActivePoll)
    }

    /// Drop whoever is registered on `connection`. Recorded answers stay.
    pub fn disconnect(&self, connection: ConnectionId) -> Option<Participant> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let removed = state.roster.unregister(connection)?;
        tracing::info!(name = %removed.name, %connection, "participant left");
        self.roster_changed(&state.roster);
        Some(removed)
    }

    /// Moderator-initiated removal. Returns the removed connection.
    pub fn kick(&self, name: &str) -> Result<ConnectionId, PollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PollError::required("name"));
        }
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let connection = state.roster.remove_by_name(name)?;
        POLL_METRICS.participants.set(state.roster.count() as u64);
        self.publish(
            &state.roster,
            &PollEvent::ParticipantKicked { connection, name },
        );
        tracing::info!(name, %connection, "participant kicked");
        Ok(connection)
    }

    /// Relay a side-chat message to everyone.
    pub fn relay_chat(&self, from: &str, message: &str, role: &str) -> Result<(), PollError> {
        if from.trim().is_empty() {
            return Err(PollError::required("from"));
        }
        if message.trim().is_empty() {
            return Err(PollError::required("message"));
        }
        if role.trim().is_empty() {
            return Err(PollError::required("role"));
        }
        let state = self.inner.state.lock();
        self.publish(
            &state.roster,
            &PollEvent::ChatMessage {
                from,
                message,
                role,
                timestamp: now_ms(),
            },
        );
        Ok(())
    }

    pub fn active(&self) -> Option<PollSession> {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|a| a.session.clone())
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.state.lock().roster.list()
    }

    /// Completed polls, most recent first.
    pub fn history(&self) -> Vec<HistoryRecord> {
        let mut records = self.inner.state.lock().history.clone();
        history::sort_most_recent_first(&mut records);
        records
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = self.inner.state.lock();
        let active = state.active.as_ref().map(|a| &a.session);
        CoordinatorStatus {
            phase: if active.is_some() {
                PollPhase::Active
            } else {
                PollPhase::Waiting
            },
            participants: state.roster.count(),
            active_poll: active.map(|s| s.id),
            answered: active.map(|s| s.answers.len()).unwrap_or(0),
            completed_polls: state.history.len(),
            next_poll_id: state.next_id,
        }
    }

    /// Load archived polls at startup.
    ///
    /// A session the store still reports as active cannot have a live
    /// deadline anymore, so it is closed with reason `recovered`. The id
    /// counter moves past every id seen.
    pub async fn recover(&self, store: &dyn HistoryStore) -> Result<RecoveryReport, HistoryError> {
        let orphan = store.find_active().await?;
        let mut completed = store.list_completed().await?;

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let mut closed_active = None;
        if let Some(orphan) = orphan {
            let record = orphan.complete(now_ms(), CompletionReason::Recovered);
            self.inner.writer.save(record.to_session());
            POLL_METRICS
                .polls_completed_total
                .inc(&[CompletionReason::Recovered.as_str()]);
            tracing::warn!(poll_id = %record.id, "closed poll left active by a previous run");
            closed_active = Some(record.id);
            completed.push(record);
        }

        let loaded = completed.len();
        for record in completed {
            if !state.history.iter().any(|known| known.id == record.id) {
                state.history.push(record);
            }
        }

        let highest = state
            .history
            .iter()
            .map(|r| r.id.0)
            .chain(state.active.as_ref().map(|a| a.session.id.0))
            .max()
            .unwrap_or(0);
        state.next_id = state.next_id.max(highest + 1);

        tracing::info!(
            loaded,
            next_poll_id = state.next_id,
            backend = store.backend(),
            "poll history recovered"
        );
        Ok(RecoveryReport {
            loaded,
            closed_active,
            next_poll_id: state.next_id,
        })
    }

    /// Deadline callback. Ignored unless `id` is still the active poll.
    pub(crate) fn expire(&self, id: PollId) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        match state.active.as_ref().map(|a| a.session.id) {
            Some(active_id) if active_id == id => self.complete(state, CompletionReason::Deadline),
            _ => tracing::debug!(poll_id = %id, "stale deadline ignored"),
        }
    }

    fn complete(&self, state: &mut CoordinatorState, reason: CompletionReason) {
        let Some(active) = state.active.take() else {
            return;
        };
        active.deadline.cancel();

        let record = active.session.complete(now_ms(), reason);
        self.inner.writer.save(record.to_session());
        POLL_METRICS.polls_completed_total.inc(&[reason.as_str()]);
        self.publish(&state.roster, &PollEvent::PollCompleted { record: &record });
        tracing::info!(
            poll_id = %record.id,
            reason = reason.as_str(),
            answers = record.answers.len(),
            "poll completed"
        );
        state.history.push(record);
    }

    fn arm_deadline(&self, id: PollId, timeout_secs: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                    if let Some(inner) = inner.upgrade() {
                        PollCoordinator { inner }.expire(id);
                    }
                }
            }
        });
        token
    }

    fn roster_changed(&self, roster: &Roster) {
        POLL_METRICS.participants.set(roster.count() as u64);
        self.publish(roster, &PollEvent::RosterChanged);
    }

    fn publish(&self, roster: &Roster, event: &PollEvent<'_>) {
        for delivery in broadcast::plan(event, roster) {
            self.inner.sink.deliver(&delivery);
        }
    }
}

fn phase_of(current: &Option<PollSession>) -> PollPhase {
    if current.is_some() {
        PollPhase::Active
    } else {
        PollPhase::Waiting
    }
}
