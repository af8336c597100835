//! SQLite storage for directory records
//!
//! Durable backing for the invite directory. Records survive restarts; expired
//! temporary records are filtered on read and purged periodically.
//!
//! rusqlite is blocking, so every call runs on the blocking thread pool and
//! never stalls the event-dispatch tasks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::directory::{DirectoryRecord, DirectoryStore};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// SQLite storage backend
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database, creating parent directories as needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!("Directory storage opened at {:?}", path);
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS directory (
                id TEXT PRIMARY KEY,
                invite_payload TEXT NOT NULL,
                owner_key TEXT NOT NULL,
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_directory_owner ON directory(owner_key);
            "#,
        )?;

        debug!("Storage schema initialized");
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DirectoryRecord> {
    let expires_at: Option<i64> = row.get(3)?;
    Ok(DirectoryRecord {
        id: row.get(0)?,
        invite_payload: row.get(1)?,
        owner_key: row.get(2)?,
        expires_at: expires_at.map(|t| t as u64),
    })
}

#[async_trait]
impl DirectoryStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<DirectoryRecord>, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, invite_payload, owner_key, expires_at FROM directory WHERE id = ?1",
                    params![id],
                    record_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn put(&self, record: DirectoryRecord) -> Result<(), StorageError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO directory (id, invite_payload, owner_key, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id,
                    record.invite_payload,
                    record.owner_key,
                    record.expires_at.map(|t| t as i64),
                ],
            )?;
            debug!("Record stored: {}", record.id);
            Ok(())
        })
        .await
    }

    async fn delete_expired(&self, id: &str, now_millis: u64) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM directory
                 WHERE id = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![id, now_millis as i64],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn find_by_owner(
        &self,
        owner_key: &str,
        now_millis: u64,
    ) -> Result<Option<DirectoryRecord>, StorageError> {
        let owner_key = owner_key.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, invite_payload, owner_key, expires_at FROM directory
                     WHERE owner_key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY id LIMIT 1",
                    params![owner_key, now_millis as i64],
                    record_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn delete_by_owner(&self, owner_key: &str) -> Result<usize, StorageError> {
        let owner_key = owner_key.to_string();
        self.with_conn(move |conn| {
            let removed =
                conn.execute("DELETE FROM directory WHERE owner_key = ?1", params![owner_key])?;
            Ok(removed)
        })
        .await
    }

    async fn purge_expired(&self, now_millis: u64) -> Result<usize, StorageError> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM directory WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_millis as i64],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn len(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM directory", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}
