//! Transport sessions
//!
//! A session is one live WebSocket connection. The transport issues the
//! [`SessionId`] at connect time and hands the broker an outbound queue;
//! delivery to a session is a non-blocking push onto that queue.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::ServerEvent;
use crate::presence::Binding;

/// Opaque handle for one live connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random session handle (8 bytes, hex encoded)
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 8];
        getrandom::fill(&mut bytes)?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection-local state, owned by the task driving the connection
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Network origin used for rate limiting
    pub origin: String,
    /// Registry entry installed by this session's last registration
    pub(crate) binding: Option<Binding>,
    /// Rooms joined by this session
    pub(crate) rooms: HashSet<String>,
}

impl Session {
    pub fn new(id: SessionId, origin: impl Into<String>) -> Self {
        Self {
            id,
            origin: origin.into(),
            binding: None,
            rooms: HashSet::new(),
        }
    }

    /// Identity key currently bound to this session
    pub fn identity(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.key())
    }
}

/// Outbound queues of every connected session
#[derive(Default)]
pub struct Sessions {
    outboxes: DashMap<SessionId, mpsc::UnboundedSender<ServerEvent>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, id: SessionId, outbox: mpsc::UnboundedSender<ServerEvent>) {
        self.outboxes.insert(id, outbox);
    }

    pub fn close(&self, id: &SessionId) {
        self.outboxes.remove(id);
    }

    /// Queue an event for a session without waiting for it to be written
    ///
    /// Returns `false` if the session is gone.
    pub fn send(&self, id: &SessionId, event: ServerEvent) -> bool {
        match self.outboxes.get(id) {
            Some(outbox) => {
                if outbox.send(event).is_err() {
                    debug!("Outbox for {} closed", id);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generation() {
        let id1 = SessionId::generate().unwrap();
        let id2 = SessionId::generate().unwrap();

        assert_eq!(id1.as_str().len(), 16);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_send_to_open_session() {
        let sessions = Sessions::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SessionId::from("s1");

        sessions.open(id.clone(), tx);
        assert!(sessions.send(&id, ServerEvent::CallEnded { from: "k".into() }));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::CallEnded { from: "k".into() }
        );

        sessions.close(&id);
        assert!(!sessions.send(&id, ServerEvent::CallEnded { from: "k".into() }));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_send_to_dropped_receiver() {
        let sessions = Sessions::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SessionId::from("s1");
        sessions.open(id.clone(), tx);
        drop(rx);

        assert!(!sessions.send(&id, ServerEvent::CallEnded { from: "k".into() }));
    }
}
