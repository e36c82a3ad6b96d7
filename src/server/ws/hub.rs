//! Connection hub
//!
//! Owns one bounded outbound queue per WebSocket connection and the
//! connection's class. Broadcast deliveries are fanned out here with
//! `try_send` so the coordinator never stalls. A connection whose queue is
//! full has missed a frame and is closed as lagging; the client reconnects
//! and rejoins to resynchronise.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event_frame_text;
use crate::broadcast::{Audience, Delivery, DeliverySink};
use crate::roster::ConnectionId;

pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// What a connection has identified itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClass {
    /// Connected but not yet joined
    Guest,
    Participant,
    Moderator,
}

#[derive(Debug)]
struct ConnectionEntry {
    class: ConnectionClass,
    tx: mpsc::Sender<String>,
    peer: Option<SocketAddr>,
    lagged: CancellationToken,
}

/// Registry of live sockets.
#[derive(Debug)]
pub struct ConnectionHub {
    next_id: AtomicU64,
    queue_size: usize,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl ConnectionHub {
    pub fn new(queue_size: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            queue_size: queue_size.max(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate an id and outbound queue for a new socket.
    pub fn connect(&self, peer: Option<SocketAddr>) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.connections.write().insert(
            id,
            ConnectionEntry {
                class: ConnectionClass::Guest,
                tx,
                peer,
                lagged: CancellationToken::new(),
            },
        );
        tracing::debug!(connection = %id, ?peer, "connection opened");
        (id, rx)
    }

    /// Forget a socket. Dropping its sender ends the writer task.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().remove(&id);
        if let Some(entry) = &removed {
            tracing::debug!(connection = %id, peer = ?entry.peer, "connection closed");
        }
        removed.is_some()
    }

    pub fn set_class(&self, id: ConnectionId, class: ConnectionClass) {
        if let Some(entry) = self.connections.write().get_mut(&id) {
            entry.class = class;
        }
    }

    pub fn class_of(&self, id: ConnectionId) -> Option<ConnectionClass> {
        self.connections.read().get(&id).map(|entry| entry.class)
    }

    /// Cancelled once the connection drops a frame; the socket loop closes
    /// the connection when it fires.
    pub fn lag_signal(&self, id: ConnectionId) -> Option<CancellationToken> {
        self.connections
            .read()
            .get(&id)
            .map(|entry| entry.lagged.clone())
    }

    /// Non-blocking send. Returns false if the frame was dropped.
    pub fn send_to(&self, id: ConnectionId, text: String) -> bool {
        let connections = self.connections.read();
        let Some(entry) = connections.get(&id) else {
            return false;
        };
        try_enqueue(id, entry, text)
    }

    /// Sender for frames that must not be dropped, such as request responses.
    pub fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<String>> {
        self.connections.read().get(&id).map(|entry| entry.tx.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn count_by_class(&self, class: ConnectionClass) -> usize {
        self.connections
            .read()
            .values()
            .filter(|entry| entry.class == class)
            .count()
    }
}

fn try_enqueue(id: ConnectionId, entry: &ConnectionEntry, text: String) -> bool {
    match entry.tx.try_send(text) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            if !entry.lagged.is_cancelled() {
                tracing::warn!(connection = %id, "outbound queue full, closing lagging connection");
                entry.lagged.cancel();
            }
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(connection = %id, "outbound queue closed");
            false
        }
    }
}

impl DeliverySink for ConnectionHub {
    fn deliver(&self, delivery: &Delivery) {
        let text = match event_frame_text(delivery.event, &delivery.payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(event = delivery.event, error = %e, "failed to encode event");
                return;
            }
        };

        let connections = self.connections.read();
        match delivery.audience {
            Audience::Connection(id) => {
                if let Some(entry) = connections.get(&id) {
                    try_enqueue(id, entry, text);
                }
            }
            Audience::Everyone => {
                for (id, entry) in connections.iter() {
                    try_enqueue(*id, entry, text.clone());
                }
            }
            Audience::EveryoneExcept(excluded) => {
                for (id, entry) in connections.iter().filter(|(id, _)| **id != excluded) {
                    try_enqueue(*id, entry, text.clone());
                }
            }
            Audience::Moderators => {
                for (id, entry) in connections
                    .iter()
                    .filter(|(_, entry)| entry.class == ConnectionClass::Moderator)
                {
                    try_enqueue(*id, entry, text.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn delivery(audience: Audience) -> Delivery {
        Delivery {
            audience,
            event: "poll.results",
            payload: json!({ "final": false }),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[test]
    fn test_connect_allocates_distinct_ids() {
        let hub = ConnectionHub::default();
        let (a, _ra) = hub.connect(None);
        let (b, _rb) = hub.connect(None);
        assert_ne!(a, b);
        assert_eq!(hub.len(), 2);
        assert_eq!(hub.class_of(a), Some(ConnectionClass::Guest));
        assert!(hub.disconnect(a));
        assert!(!hub.disconnect(a));
    }

    #[test]
    fn test_moderator_audience() {
        let hub = ConnectionHub::default();
        let (m, mut rm) = hub.connect(None);
        let (p, mut rp) = hub.connect(None);
        hub.set_class(m, ConnectionClass::Moderator);
        hub.set_class(p, ConnectionClass::Participant);

        hub.deliver(&delivery(Audience::Moderators));
        let frames = drain(&mut rm);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "event");
        assert_eq!(frames[0]["event"], "poll.results");
        assert!(drain(&mut rp).is_empty());
        assert_eq!(hub.count_by_class(ConnectionClass::Moderator), 1);
    }

    #[test]
    fn test_everyone_except() {
        let hub = ConnectionHub::default();
        let (a, mut ra) = hub.connect(None);
        let (_b, mut rb) = hub.connect(None);

        hub.deliver(&delivery(Audience::EveryoneExcept(a)));
        assert!(drain(&mut ra).is_empty());
        assert_eq!(drain(&mut rb).len(), 1);
    }

    #[test]
    fn test_full_queue_marks_connection_lagged() {
        let hub = ConnectionHub::new(1);
        let (a, mut ra) = hub.connect(None);
        let lagged = hub.lag_signal(a).unwrap();
        assert!(hub.send_to(a, "one".to_string()));
        assert!(!lagged.is_cancelled());
        assert!(!hub.send_to(a, "two".to_string()));
        assert!(lagged.is_cancelled());
        assert_eq!(ra.try_recv().unwrap(), "one");
        assert!(!hub.send_to(ConnectionId(999), "x".to_string()));
        assert!(hub.lag_signal(ConnectionId(999)).is_none());
    }

    #[test]
    fn test_dropped_final_results_close_only_the_lagging_connection() {
        let hub = ConnectionHub::new(1);
        let (slow, _slow_rx) = hub.connect(None);
        let (fast, mut fast_rx) = hub.connect(None);
        assert!(hub.send_to(slow, "backlog".to_string()));

        hub.deliver(&Delivery {
            audience: Audience::Everyone,
            event: "poll.ended",
            payload: json!({ "pollId": 1, "reason": "deadline" }),
        });
        assert!(hub.lag_signal(slow).unwrap().is_cancelled());
        assert!(!hub.lag_signal(fast).unwrap().is_cancelled());
        assert_eq!(drain(&mut fast_rx)[0]["event"], "poll.ended");
    }
}
