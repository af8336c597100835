//! Rate limiter for relay operations
//!
//! Bounds how many rate-limited operations (registration, connection
//! requests) a single network origin may perform per window.
//!
//! # Policy
//!
//! Fixed window, not sliding:
//! - The first call from an origin opens a window with a count of 1
//! - Calls inside the window increment the count until the limit is reached
//! - Calls at the limit are denied without touching the record
//! - The first call after the window has elapsed opens a fresh window
//!
//! The table is an LRU bounded by `max_tracked_origins`, and a periodic sweep
//! drops records whose window has already elapsed.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use tether_core::{Clock, RateLimitConfig, SystemClock};

/// Window bookkeeping for a single origin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateRecord {
    /// Start of the current window (ms since epoch)
    pub window_start: u64,
    /// Operations admitted in the current window
    pub count: u32,
}

/// Fixed-window rate limiter keyed by origin address
#[derive(Clone)]
pub struct RateLimiter {
    max_requests: u32,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<LruCache<String, RateRecord>>>,
    denied: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Create a new rate limiter with default configuration
    pub fn new() -> Self {
        Self::with_config(&RateLimitConfig::default())
    }

    /// Create a new rate limiter with custom configuration
    pub fn with_config(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.max_tracked_origins).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_requests: config.max_requests,
            window_ms: config.window().as_millis() as u64,
            clock,
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            denied: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check and count an operation from `origin`
    ///
    /// Returns `true` if allowed, `false` if rate limited.
    pub fn admit(&self, origin: &str) -> bool {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match entries.get_mut(origin) {
            Some(record) if now.saturating_sub(record.window_start) <= self.window_ms => {
                if record.count >= self.max_requests {
                    self.denied.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Rate limiter: denied {} ({}/{} in window)",
                        origin, record.count, self.max_requests
                    );
                    return false;
                }
                record.count += 1;
                debug!(
                    "Rate limiter: admitted {} ({}/{})",
                    origin, record.count, self.max_requests
                );
                true
            }
            Some(record) => {
                *record = RateRecord {
                    window_start: now,
                    count: 1,
                };
                debug!("Rate limiter: window reset for {}", origin);
                true
            }
            None => {
                let fresh = RateRecord {
                    window_start: now,
                    count: 1,
                };
                if let Some((evicted, _)) = entries.push(origin.to_string(), fresh) {
                    debug!("Rate limiter: evicted least recent origin {}", evicted);
                }
                true
            }
        }
    }

    /// Current record for an origin, if tracked
    pub fn record(&self, origin: &str) -> Option<RateRecord> {
        self.entries.lock().peek(origin).copied()
    }

    /// Drop records whose window has elapsed
    ///
    /// A dropped origin starts a fresh window on its next call, exactly as an
    /// expired record would.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, r)| now.saturating_sub(r.window_start) > self.window_ms)
            .map(|(origin, _)| origin.clone())
            .collect();

        for origin in &expired {
            entries.pop(origin);
        }

        if !expired.is_empty() {
            debug!("Rate limiter: swept {} expired origins", expired.len());
        }
        expired.len()
    }

    /// Get statistics about rate limiter state
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_tracked: self.entries.lock().len(),
            total_denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    /// Number of tracked origins
    pub total_tracked: usize,
    /// Denials since startup
    pub total_denied: u64,
}
