//! Participant Roster
//!
//! Tracks which participants are currently reachable. One registry keyed by a
//! stable participant id, with secondary indexes by display name and by
//! connection so the two directions can never disagree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::now_ms;
use crate::polls::PollError;

/// Transport connection handle, allocated by the connection hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Stable participant identity; survives a rejoin under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

/// A joined, non-moderating connection identified by display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub connection: ConnectionId,
    pub active: bool,
    /// Unix ms of the first join under this name
    pub joined_at: i64,
}

/// Result of [`Roster::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub participant: Participant,
    /// Connection that previously held this name and is now stale
    pub displaced: Option<ConnectionId>,
    /// Whether the name was already registered
    pub rejoined: bool,
}

/// The current set of registered participants.
#[derive(Debug, Default)]
pub struct Roster {
    participants: HashMap<ParticipantId, Participant>,
    by_name: HashMap<String, ParticipantId>,
    by_connection: HashMap<ConnectionId, ParticipantId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` on `connection`, upserting by name.
    ///
    /// An existing name keeps its identity and moves to the new connection;
    /// the old connection is returned as displaced and no longer maps to
    /// anyone. A connection holds at most one name, so re-registering a
    /// connection under a different name drops its previous participant.
    pub fn register(&mut self, connection: ConnectionId, name: &str) -> Registration {
        let existing = self.by_name.get(name).copied();

        if let Some(other) = self.by_connection.get(&connection).copied() {
            if Some(other) != existing {
                self.remove_participant(other);
            }
        }

        if let Some(participant) = existing.and_then(|id| self.participants.get_mut(&id)) {
            let previous = std::mem::replace(&mut participant.connection, connection);
            participant.active = true;
            let participant = participant.clone();

            let displaced = (previous != connection).then_some(previous);
            if let Some(stale) = displaced {
                self.by_connection.remove(&stale);
            }
            self.by_connection.insert(connection, participant.id);
            return Registration {
                participant,
                displaced,
                rejoined: true,
            };
        }

        let participant = Participant {
            id: ParticipantId::new(),
            name: name.to_string(),
            connection,
            active: true,
            joined_at: now_ms(),
        };
        self.by_name.insert(participant.name.clone(), participant.id);
        self.by_connection.insert(connection, participant.id);
        self.participants.insert(participant.id, participant.clone());
        Registration {
            participant,
            displaced: None,
            rejoined: false,
        }
    }

    /// Drop whoever is registered on `connection`.
    ///
    /// Stale connections (displaced by a rejoin) map to nobody, so this is a
    /// no-op for them.
    pub fn unregister(&mut self, connection: ConnectionId) -> Option<Participant> {
        let id = self.by_connection.get(&connection).copied()?;
        self.remove_participant(id)
    }

    /// Remove a participant by display name, returning its connection.
    pub fn remove_by_name(&mut self, name: &str) -> Result<ConnectionId, PollError> {
        let id = self
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| PollError::NotFound(name.to_string()))?;
        self.remove_participant(id)
            .map(|participant| participant.connection)
            .ok_or_else(|| PollError::NotFound(name.to_string()))
    }

    /// All participants, oldest join first.
    pub fn list(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        participants
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn connection_for(&self, name: &str) -> Option<ConnectionId> {
        let id = self.by_name.get(name)?;
        self.participants.get(id).map(|p| p.connection)
    }

    pub fn participant_for(&self, connection: ConnectionId) -> Option<&Participant> {
        let id = self.by_connection.get(&connection)?;
        self.participants.get(id)
    }

    fn remove_participant(&mut self, id: ParticipantId) -> Option<Participant> {
        let participant = self.participants.remove(&id)?;
        if self.by_name.get(&participant.name) == Some(&id) {
            self.by_name.remove(&participant.name);
        }
        if self.by_connection.get(&participant.connection) == Some(&id) {
            self.by_connection.remove(&participant.connection);
        }
        Some(participant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_new_participant() {
        let mut roster = Roster::new();
        let reg = roster.register(ConnectionId(1), "alice");
        assert!(!reg.rejoined);
        assert!(reg.displaced.is_none());
        assert!(reg.participant.active);
        assert_eq!(roster.count(), 1);
        assert_eq!(roster.connection_for("alice"), Some(ConnectionId(1)));
    }

    #[test]
    fn test_rejoin_displaces_old_connection() {
        let mut roster = Roster::new();
        let first = roster.register(ConnectionId(1), "alice");
        let second = roster.register(ConnectionId(2), "alice");

        assert!(second.rejoined);
        assert_eq!(second.displaced, Some(ConnectionId(1)));
        assert_eq!(second.participant.id, first.participant.id);
        assert_eq!(roster.count(), 1);
        assert_eq!(roster.connection_for("alice"), Some(ConnectionId(2)));
        assert!(roster.participant_for(ConnectionId(1)).is_none());
    }

    #[test]
    fn test_unregister_stale_connection_is_noop() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(1), "alice");
        roster.register(ConnectionId(2), "alice");

        assert!(roster.unregister(ConnectionId(1)).is_none());
        assert_eq!(roster.count(), 1);
        assert_eq!(roster.connection_for("alice"), Some(ConnectionId(2)));
    }

    #[test]
    fn test_rejoin_same_connection_is_not_displacement() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(1), "alice");
        let again = roster.register(ConnectionId(1), "alice");
        assert!(again.rejoined);
        assert!(again.displaced.is_none());
        assert_eq!(roster.count(), 1);
    }

    #[test]
    fn test_connection_switching_names_drops_old_name() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(1), "alice");
        roster.register(ConnectionId(1), "bob");

        assert_eq!(roster.count(), 1);
        assert!(!roster.contains_name("alice"));
        assert_eq!(roster.participant_for(ConnectionId(1)).unwrap().name, "bob");
    }

    #[test]
    fn test_remove_by_name() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(4), "carol");

        assert_eq!(roster.remove_by_name("carol"), Ok(ConnectionId(4)));
        assert!(roster.is_empty());
        assert_eq!(
            roster.remove_by_name("carol"),
            Err(PollError::NotFound("carol".to_string()))
        );
    }

    #[test]
    fn test_unregister_removes_both_indexes() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(1), "alice");
        let removed = roster.unregister(ConnectionId(1)).unwrap();
        assert_eq!(removed.name, "alice");
        assert!(!roster.contains_name("alice"));
        assert!(roster.connection_for("alice").is_none());
    }

    #[test]
    fn test_list_contains_everyone() {
        let mut roster = Roster::new();
        roster.register(ConnectionId(1), "alice");
        roster.register(ConnectionId(2), "bob");
        let mut names: Vec<String> = roster.list().into_iter().map(|p| p.name).collect();
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);
    }
}
