//! Identity key handling
//!
//! Peers identify themselves with a public key string. Clients copy keys
//! around by hand, so stray whitespace is common; every lookup goes through
//! [`normalize_identity_key`] first.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalize an identity key for use as a map key
///
/// Removes all whitespace, including whitespace inside the key. Case is
/// preserved.
pub fn normalize_identity_key(key: &str) -> String {
    key.chars().filter(|c| !c.is_whitespace()).collect()
}

/// A normalized, non-empty identity key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Normalize `raw`, returning `None` if nothing is left
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = normalize_identity_key(raw);
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
