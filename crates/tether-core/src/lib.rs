//! Tether Core - Shared types, configuration, and error definitions
//!
//! This crate contains the foundational pieces used by the tether broker.
//! It has no dependencies on networking or storage code.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, DirectoryConfig, RateLimitConfig, ServerConfig};
pub use error::*;
pub use identity::{normalize_identity_key, IdentityKey};

/// Default port the broker listens on
pub const DEFAULT_PORT: u16 = 3000;

/// Default number of rate-limited operations per origin per window
pub const DEFAULT_RATE_LIMIT: u32 = 20;

/// Default rate window length in seconds
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// Default lifetime of a temporary directory entry (24 hours)
pub const DEFAULT_TEMPORARY_TTL_SECS: u64 = 24 * 60 * 60;

/// Default directory for durable directory records
pub const DEFAULT_DATA_DIR: &str = "directory-data";

/// Maximum length of a directory id in characters
pub const MAX_ID_LEN: usize = 64;

/// Maximum length of an invite payload in bytes (8 KiB)
pub const MAX_INVITE_LEN: usize = 8 * 1024;
