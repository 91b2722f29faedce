//! Cache Entry Types

use std::time::{Duration, Instant};

use crate::runtime::expires_at;

/// A cached value with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    value: String,
    expiry: Instant,
    stamp: u64,
}

impl CacheEntry {
    /// Create an entry that expires `ttl` after `now`
    pub fn new(value: impl Into<String>, now: Instant, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expiry: expires_at(now, ttl),
            stamp: 0,
        }
    }

    /// Tag the entry with the write that produced it
    pub(crate) fn stamped(mut self, stamp: u64) -> Self {
        self.stamp = stamp;
        self
    }

    /// Identifies the write that stored this entry. Unique per cache.
    #[inline]
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Cached value
    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Absolute expiry instant
    #[inline]
    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// An entry is expired once `now` is strictly past its expiry.
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expiry
    }

    /// Time left before expiry, zero if already expired
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expiry.saturating_duration_since(now)
    }
}
