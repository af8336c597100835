//! Invite directory
//!
//! Maps short, human-readable ids to an invite payload owned by an identity
//! key. Temporary entries expire after a configurable TTL; permanent entries
//! never do.
//!
//! [`Directory`] holds the validation, ownership, and expiry rules and talks
//! to durable storage through the [`DirectoryStore`] trait. Claims on the same
//! id are serialized with a per-id async lock; claims on different ids never
//! wait on each other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info};

use tether_core::{normalize_identity_key, Clock, DirectoryError, MAX_ID_LEN, MAX_INVITE_LEN};

use crate::storage::StorageError;

/// A stored directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub id: String,
    pub invite_payload: String,
    pub owner_key: String,
    /// Expiry in ms since epoch; `None` for permanent entries
    pub expires_at: Option<u64>,
}

impl DirectoryRecord {
    pub fn permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|t| now_millis >= t)
    }
}

/// How long a claim should live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persistence {
    Temporary,
    Permanent,
}

impl Persistence {
    /// `"temporary"` selects the TTL; anything else is permanent
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("temporary") {
            Persistence::Temporary
        } else {
            Persistence::Permanent
        }
    }
}

/// Claim request as received from a client
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub custom_id: Option<String>,
    pub full_invite_code: Option<String>,
    pub persistence: Option<String>,
    pub pub_key: Option<String>,
}

/// Durable storage for directory records
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DirectoryRecord>, StorageError>;

    /// Insert or overwrite by id
    async fn put(&self, record: DirectoryRecord) -> Result<(), StorageError>;

    /// Delete `id` only if it is still expired at `now_millis`
    ///
    /// A record claimed again since it was read as expired stays in place.
    async fn delete_expired(&self, id: &str, now_millis: u64) -> Result<bool, StorageError>;

    /// Live record owned by `owner_key` with the smallest id
    async fn find_by_owner(
        &self,
        owner_key: &str,
        now_millis: u64,
    ) -> Result<Option<DirectoryRecord>, StorageError>;

    /// Delete every record owned by `owner_key`
    async fn delete_by_owner(&self, owner_key: &str) -> Result<usize, StorageError>;

    /// Delete every record expired at `now_millis`
    async fn purge_expired(&self, now_millis: u64) -> Result<usize, StorageError>;

    async fn len(&self) -> Result<usize, StorageError>;
}

/// Volatile store, used in tests and when no data directory is wanted
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, DirectoryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<DirectoryRecord>, StorageError> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn put(&self, record: DirectoryRecord) -> Result<(), StorageError> {
        self.records.lock().insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_expired(&self, id: &str, now_millis: u64) -> Result<bool, StorageError> {
        let mut records = self.records.lock();
        let expired = records.get(id).is_some_and(|r| r.is_expired(now_millis));
        if expired {
            records.remove(id);
        }
        Ok(expired)
    }

    async fn find_by_owner(
        &self,
        owner_key: &str,
        now_millis: u64,
    ) -> Result<Option<DirectoryRecord>, StorageError> {
        // BTreeMap iterates in id order
        Ok(self
            .records
            .lock()
            .values()
            .find(|r| r.owner_key == owner_key && !r.is_expired(now_millis))
            .cloned())
    }

    async fn delete_by_owner(&self, owner_key: &str) -> Result<usize, StorageError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.owner_key != owner_key);
        Ok(before - records.len())
    }

    async fn purge_expired(&self, now_millis: u64) -> Result<usize, StorageError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now_millis));
        Ok(before - records.len())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.records.lock().len())
    }
}

/// Directory rules on top of a [`DirectoryStore`]
pub struct Directory {
    store: Arc<dyn DirectoryStore>,
    clock: Arc<dyn Clock>,
    temporary_ttl: Duration,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Directory {
    pub fn new(store: Arc<dyn DirectoryStore>, clock: Arc<dyn Clock>, temporary_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            temporary_ttl,
            locks: DashMap::new(),
        }
    }

    /// Claim or re-claim `id` for the request's key
    ///
    /// Only the current owner may overwrite a live record. Expired records
    /// are free for anyone.
    pub async fn claim(&self, request: ClaimRequest) -> Result<DirectoryRecord, DirectoryError> {
        let id = required(request.custom_id, "customId")?.trim().to_string();
        let invite_payload = required(request.full_invite_code, "fullInviteCode")?;
        let persistence = Persistence::parse(&required(request.persistence, "persistence")?);
        let owner_key = normalize_identity_key(&required(request.pub_key, "pubKey")?);

        if owner_key.is_empty() {
            return Err(DirectoryError::validation("missing pubKey"));
        }
        if id.chars().count() > MAX_ID_LEN {
            return Err(DirectoryError::validation(format!(
                "customId longer than {} characters",
                MAX_ID_LEN
            )));
        }
        if invite_payload.len() > MAX_INVITE_LEN {
            return Err(DirectoryError::validation(format!(
                "fullInviteCode larger than {} bytes",
                MAX_INVITE_LEN
            )));
        }

        let _held = self.lock_id(&id).await;
        self.claim_locked(id, invite_payload, persistence, owner_key).await
    }

    async fn claim_locked(
        &self,
        id: String,
        invite_payload: String,
        persistence: Persistence,
        owner_key: String,
    ) -> Result<DirectoryRecord, DirectoryError> {
        let now = self.clock.now_millis();

        if let Some(existing) = self.store.get(&id).await.map_err(storage_failure)? {
            if !existing.is_expired(now) && existing.owner_key != owner_key {
                debug!("Claim for {} refused: owned by another key", id);
                return Err(DirectoryError::Conflict(id));
            }
        }

        let expires_at = match persistence {
            Persistence::Temporary => Some(now + self.temporary_ttl.as_millis() as u64),
            Persistence::Permanent => None,
        };

        let record = DirectoryRecord {
            id,
            invite_payload,
            owner_key,
            expires_at,
        };
        self.store.put(record.clone()).await.map_err(storage_failure)?;

        info!(
            "Claimed {} ({})",
            record.id,
            if record.permanent() { "permanent" } else { "temporary" }
        );
        Ok(record)
    }

    /// Invite payload for `id`
    ///
    /// Expired entries are dropped on the way out, unless a new claim has
    /// replaced them in the meantime.
    pub async fn resolve(&self, id: &str) -> Result<String, DirectoryError> {
        let now = self.clock.now_millis();

        match self.store.get(id).await.map_err(storage_failure)? {
            Some(record) if !record.is_expired(now) => Ok(record.invite_payload),
            Some(_) => {
                if let Err(e) = self.store.delete_expired(id, now).await {
                    error!("Failed to drop expired entry {}: {}", id, e);
                }
                debug!("Entry {} expired", id);
                Err(DirectoryError::NotFound(id.to_string()))
            }
            None => Err(DirectoryError::NotFound(id.to_string())),
        }
    }

    /// The live record owned by `owner_key`
    ///
    /// When a key owns several ids, the lexicographically smallest wins.
    pub async fn find_by_owner(&self, owner_key: &str) -> Result<DirectoryRecord, DirectoryError> {
        let owner_key = normalize_identity_key(owner_key);
        if owner_key.is_empty() {
            return Err(DirectoryError::NotFound(owner_key));
        }

        let found = self
            .store
            .find_by_owner(&owner_key, self.clock.now_millis())
            .await
            .map_err(storage_failure)?;

        found.ok_or(DirectoryError::NotFound(owner_key))
    }

    /// Delete everything owned by `owner_key`
    ///
    /// Succeeds with a count of zero when nothing was owned.
    pub async fn delete_by_owner(&self, owner_key: &str) -> Result<usize, DirectoryError> {
        let owner_key = normalize_identity_key(owner_key);
        if owner_key.is_empty() {
            return Err(DirectoryError::validation("missing pubKey"));
        }

        let removed = self
            .store
            .delete_by_owner(&owner_key)
            .await
            .map_err(storage_failure)?;

        if removed > 0 {
            info!("Deleted {} entries for key {}", removed, owner_key);
        }
        Ok(removed)
    }

    /// Drop expired temporary entries
    pub async fn purge_expired(&self) -> Result<usize, DirectoryError> {
        let removed = self
            .store
            .purge_expired(self.clock.now_millis())
            .await
            .map_err(storage_failure)?;

        if removed > 0 {
            info!("Purged {} expired directory entries", removed);
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize, DirectoryError> {
        self.store.len().await.map_err(storage_failure)
    }

    async fn lock_id(&self, id: &str) -> IdLock<'_> {
        let mut held = IdLock {
            locks: &self.locks,
            id: id.to_string(),
            guard: None,
        };
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        held.guard = Some(lock.lock_owned().await);
        held
    }
}

/// Exclusive hold on one id
///
/// Dropping it releases the lock and removes the table entry once no other
/// claim holds or waits for it, including when the claim future is cancelled.
struct IdLock<'a> {
    locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Present and not blank; the value itself is passed through untouched
fn required(field: Option<String>, name: &str) -> Result<String, DirectoryError> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(DirectoryError::validation(format!("missing {}", name))),
    }
}

fn storage_failure(e: StorageError) -> DirectoryError {
    error!("Directory storage failure: {}", e);
    DirectoryError::storage(e)
}
