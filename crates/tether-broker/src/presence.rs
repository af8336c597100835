//! Presence registry
//!
//! Maps a peer's stable identity key to the session currently holding it.
//! At most one session per key: a later registration silently supersedes an
//! earlier one. Keys are normalized before use.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use tether_core::IdentityKey;

use crate::session::SessionId;

/// The exact registry entry a session installed
///
/// Kept on the session so disconnect removes only its own mapping, never a
/// newer one installed by another session for the same key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    key: IdentityKey,
    session: SessionId,
}

impl Binding {
    pub fn key(&self) -> &str {
        self.key.as_str()
    }
}

/// Identity key -> session handle
#[derive(Default)]
pub struct PresenceRegistry {
    entries: DashMap<IdentityKey, SessionId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `session`, replacing any existing mapping
    ///
    /// Returns `None` if the key is empty after normalization.
    pub fn register(&self, key: &str, session: &SessionId) -> Option<Binding> {
        let key = IdentityKey::parse(key)?;

        if let Some(previous) = self.entries.insert(key.clone(), session.clone()) {
            if &previous != session {
                info!("Key {} moved from session {} to {}", key, previous, session);
            }
        } else {
            info!("Key {} registered to session {}", key, session);
        }

        Some(Binding {
            key,
            session: session.clone(),
        })
    }

    /// Current session for `key`
    pub fn resolve(&self, key: &str) -> Option<SessionId> {
        let key = IdentityKey::parse(key)?;
        self.entries.get(&key).map(|s| s.value().clone())
    }

    /// Remove the mapping for `key` unconditionally
    pub fn unregister(&self, key: &str) {
        if let Some(key) = IdentityKey::parse(key) {
            if self.entries.remove(&key).is_some() {
                debug!("Key {} unregistered", key);
            }
        }
    }

    /// Remove `binding` only if the registry still holds it
    ///
    /// Returns `true` if the entry was removed.
    pub fn release(&self, binding: &Binding) -> bool {
        match self.entries.entry(binding.key.clone()) {
            Entry::Occupied(entry) if entry.get() == &binding.session => {
                entry.remove();
                debug!("Key {} released by session {}", binding.key, binding.session);
                true
            }
            Entry::Occupied(entry) => {
                debug!(
                    "Key {} now held by {}, leaving it in place for {}",
                    binding.key,
                    entry.get(),
                    binding.session
                );
                false
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
