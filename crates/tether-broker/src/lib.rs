//! Tether Broker
//!
//! Real-time connection broker for peers identified by a public key.
//! Clients connect over WebSocket to find each other's current session and
//! exchange the signaling needed to open a direct channel. A small HTTP API
//! maps short ids to invite payloads.
//!
//! # Protocol
//!
//! 1. Client opens `/socket` and sends `register` with its identity key
//! 2. Peers address each other by key (`request-connection`, `call-request`, ...)
//! 3. The broker resolves the key to a live session and forwards the event
//! 4. Room members exchange `signal`/`auth` payloads for connection setup
//! 5. Peers establish their direct channel and may drop the broker connection

pub mod api;
pub mod directory;
pub mod messages;
pub mod presence;
pub mod rate_limiter;
pub mod relay;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

pub use directory::{ClaimRequest, Directory, DirectoryRecord, DirectoryStore, MemoryStore};
pub use messages::{ClientEvent, ServerEvent};
pub use presence::{Binding, PresenceRegistry};
pub use rate_limiter::RateLimiter;
pub use relay::{Outcome, SignalingRelay};
pub use server::BrokerServer;
pub use session::{Session, SessionId};
pub use storage::{SqliteStore, StorageError};
