//! Process-local TTL cache
//!
//! Expiry is enforced on every read: an entry past its expiry is invisible even
//! if the background sweep has not reached it yet. The sweep only bounds memory.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::entry::CacheEntry;
use super::shard::ShardedMap;
use super::SHARD_COUNT;
use crate::error::{Error, Result};
use crate::runtime::{BackgroundTask, Clock};

/// TTL cache configuration
#[derive(Debug, Clone)]
pub struct TtlCacheConfig {
    /// TTL applied by [`TtlCache::insert`]
    pub default_ttl: Duration,
    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
}

impl Default for TtlCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl TtlCacheConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(Error::Config("cache default_ttl must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("cache sweep_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Stored entries, including expired ones not yet swept
    pub entries: usize,
    /// Reads that returned a live value
    pub hits: u64,
    /// Reads that found nothing usable
    pub misses: u64,
    /// Misses caused by an expired, unswept entry
    pub expired_reads: u64,
    /// Entries removed by sweeps
    pub swept: u64,
}

/// Receipt for a write, used to undo it with [`TtlCache::restore`].
#[derive(Debug, Clone)]
pub struct CacheWrite {
    stamp: u64,
    previous: Option<CacheEntry>,
}

impl CacheWrite {
    /// Entry the write replaced, if any
    pub fn previous(&self) -> Option<&CacheEntry> {
        self.previous.as_ref()
    }
}

/// Concurrent string-to-string cache with per-entry expiry.
pub struct TtlCache {
    entries: ShardedMap<String, CacheEntry, SHARD_COUNT>,
    config: TtlCacheConfig,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<BackgroundTask>>,
    stopped: AtomicBool,
    next_stamp: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_reads: AtomicU64,
    swept: AtomicU64,
}

impl TtlCache {
    /// Create a cache without a background sweep.
    pub fn new(config: TtlCacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            entries: ShardedMap::new(),
            config,
            clock,
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
            next_stamp: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_reads: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        })
    }

    /// Create a cache and start its periodic sweep. Needs a Tokio runtime.
    pub fn start(config: TtlCacheConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let cache = Arc::new(Self::new(config, clock)?);
        cache.spawn_sweeper();
        Ok(cache)
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = BackgroundTask::spawn_periodic(
            "ttl-cache-sweep",
            self.config.sweep_interval,
            move || match weak.upgrade() {
                Some(cache) => {
                    cache.sweep();
                    true
                }
                None => false,
            },
        );
        *self.sweeper.lock() = Some(task);
    }

    /// Unconditionally store `value` under `key` for `ttl`.
    ///
    /// The returned [`CacheWrite`] holds whatever entry was replaced.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> CacheWrite {
        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry::new(value, self.clock.now(), ttl).stamped(stamp);
        let previous = self.entries.insert(key.into(), entry);
        CacheWrite { stamp, previous }
    }

    /// Store with the configured default TTL
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) -> CacheWrite {
        self.set(key, value, self.config.default_ttl)
    }

    /// Undo `write` if `key` still holds the entry it stored.
    ///
    /// The replaced entry comes back, or the key is removed if there was
    /// none. A later write to `key` is left alone. Returns whether the undo
    /// happened.
    pub fn restore(&self, key: &str, write: CacheWrite) -> bool {
        let CacheWrite { stamp, previous } = write;
        self.entries
            .replace_if(key, |current| current.stamp() == stamp, previous)
    }

    /// Get a live value. Expired entries read as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut expired = false;
        let value = self.entries.read_with(key, |entry| {
            if entry.is_expired(now) {
                expired = true;
                None
            } else {
                Some(entry.value().to_string())
            }
        });

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            if expired {
                self.expired_reads.fetch_add(1, Ordering::Relaxed);
            }
        }
        value
    }

    /// Check for a live entry without touching hit/miss counters
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read_with(key, |entry| (!entry.is_expired(now)).then_some(()))
            .is_some()
    }

    /// Remove `key`. Idempotent; returns whether a live or expired entry was dropped.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict every entry
    pub fn clear(&self) -> usize {
        self.entries.clear()
    }

    /// Drop every entry past its expiry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let removed = self.entries.retain(|_, entry| !entry.is_expired(now));
        if removed > 0 {
            self.swept.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Stop the sweep and evict everything.
    ///
    /// A second call returns [`Error::AlreadyStopped`]. The cache stays usable
    /// after stopping, it just no longer sweeps.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStopped("ttl cache"));
        }
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        let evicted = self.clear();
        info!(evicted, "TTL cache stopped");
        Ok(())
    }

    /// Whether [`TtlCache::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get configuration
    pub fn config(&self) -> &TtlCacheConfig {
        &self.config
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_reads: self.expired_reads.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.len())
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
