//! Room membership for group relay
//!
//! A room is a named multicast group with no persisted state. A session may
//! join any number of rooms; a room disappears with its last member.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

use crate::session::SessionId;

/// A named group of sessions
pub struct Room {
    pub name: String,

    members: HashSet<SessionId>,
}

impl Room {
    pub fn new(name: String) -> Self {
        Self {
            name,
            members: HashSet::new(),
        }
    }

    /// Add a member, returning `false` if already present
    pub fn add_member(&mut self, session: SessionId) -> bool {
        self.members.insert(session)
    }

    pub fn remove_member(&mut self, session: &SessionId) -> bool {
        self.members.remove(session)
    }

    /// Every member except `sender`
    pub fn others(&self, sender: &SessionId) -> Vec<SessionId> {
        self.members
            .iter()
            .filter(|m| *m != sender)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// All rooms, by name
#[derive(Default)]
pub struct Rooms {
    rooms: DashMap<String, Room>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` to `name`, creating the room if needed
    pub fn join(&self, name: &str, session: &SessionId) -> bool {
        let mut room = self
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| Room::new(name.to_string()));
        room.add_member(session.clone())
    }

    /// Remove `session` from `name`, dropping the room once empty
    pub fn leave(&self, name: &str, session: &SessionId) {
        let removed = self
            .rooms
            .remove_if_mut(name, |_, room| {
                room.remove_member(session);
                room.is_empty()
            })
            .is_some();

        if removed {
            debug!("Room {} removed (empty)", name);
        }
    }

    /// Recipients of a broadcast from `sender` to `name`
    pub fn recipients(&self, name: &str, sender: &SessionId) -> Vec<SessionId> {
        self.rooms
            .get(name)
            .map(|room| room.others(sender))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
