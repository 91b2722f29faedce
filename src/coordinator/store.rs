//! Tiered Store Coordinator
//!
//! Reads fall through cache → fast tier → durable tier and populate the
//! faster tiers on the way back. Writes land in the cache synchronously and
//! reach the remote tiers through the write-behind queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::stats::{CoordinatorStats, ReadMetrics};
use crate::cache::{TtlCache, TtlCacheConfig};
use crate::error::{Error, Result};
use crate::limiter::{Decision, RateLimiter, RateLimiterConfig};
use crate::queue::{PendingWrite, WriteBehindQueue, WriteQueueConfig};
use crate::runtime::{Clock, SystemClock};
use crate::tiers::{
    fast_tier_key, with_deadline, DurableTier, FastTier, InMemoryDurableTier, InMemoryFastTier,
};

/// Tier that served a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadTier {
    /// Process-local cache
    Cache,
    /// Shared key-value store
    FastTier,
    /// Relational source of truth
    Durable,
}

impl std::fmt::Display for ReadTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadTier::Cache => write!(f, "cache"),
            ReadTier::FastTier => write!(f, "fast"),
            ReadTier::Durable => write!(f, "durable"),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Process cache (its `default_ttl` is the cache TTL)
    pub cache: TtlCacheConfig,
    /// Rate limiter
    pub limiter: RateLimiterConfig,
    /// Write-behind queue (its `fast_tier_ttl` applies to every fast-tier write)
    pub queue: WriteQueueConfig,
    /// Deadline for synchronous tier calls
    pub op_timeout: Duration,
    /// Deadline for fast-tier backfills after a durable hit
    pub backfill_timeout: Duration,
    /// Candidate codes tried by [`Coordinator::create`]
    pub create_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache: TtlCacheConfig::default(),
            limiter: RateLimiterConfig::default(),
            queue: WriteQueueConfig::default(),
            op_timeout: Duration::from_secs(5),
            backfill_timeout: Duration::from_millis(100),
            create_attempts: 10,
        }
    }
}

impl CoordinatorConfig {
    /// Validate this config and every component config
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.limiter.validate()?;
        self.queue.validate()?;
        if self.op_timeout.is_zero() || self.backfill_timeout.is_zero() {
            return Err(Error::Config(
                "op_timeout and backfill_timeout must be non-zero".into(),
            ));
        }
        if self.create_attempts == 0 {
            return Err(Error::Config("create_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Result of a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Long URL
    pub long: String,
    /// Tier that answered
    pub tier: ReadTier,
    /// Time spent resolving
    pub latency: Duration,
}

/// Tiered store for short code mappings.
///
/// Construct once at startup and share by reference (or `Arc`) with request
/// handlers. Every background task it owns stops in [`Coordinator::shutdown`].
pub struct Coordinator {
    cache: Arc<TtlCache>,
    limiter: Arc<RateLimiter>,
    queue: WriteBehindQueue,
    fast: Arc<dyn FastTier>,
    durable: Arc<dyn DurableTier>,
    config: CoordinatorConfig,
    reads: Arc<ReadMetrics>,
    stopped: AtomicBool,
}

impl Coordinator {
    /// Start a coordinator over the given tiers. Needs a Tokio runtime.
    pub fn start(
        config: CoordinatorConfig,
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
    ) -> Result<Self> {
        Self::start_with_clock(config, fast, durable, SystemClock::shared())
    }

    /// Start with an explicit clock for cache expiry and rate limiting
    pub fn start_with_clock(
        config: CoordinatorConfig,
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = TtlCache::start(config.cache.clone(), clock.clone())?;
        let limiter = RateLimiter::start(config.limiter.clone(), clock)?;
        let queue = WriteBehindQueue::start(config.queue.clone(), fast.clone(), durable.clone())?;

        info!(
            cache_ttl = ?config.cache.default_ttl,
            queue_capacity = config.queue.capacity,
            workers = config.queue.workers,
            "Coordinator started"
        );

        Ok(Self {
            cache,
            limiter,
            queue,
            fast,
            durable,
            config,
            reads: Arc::new(ReadMetrics::default()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start over in-memory tiers (for testing and the demo binary)
    pub fn in_memory(config: CoordinatorConfig) -> Result<Self> {
        Self::start(
            config,
            Arc::new(InMemoryFastTier::new()),
            Arc::new(InMemoryDurableTier::new()),
        )
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Resolve a short code to its long URL
    pub async fn get(&self, short: &str) -> Result<String> {
        self.lookup(short).await.map(|found| found.long)
    }

    /// Resolve a short code, reporting which tier answered.
    ///
    /// Tier errors and timeouts are returned immediately; the read path never
    /// retries.
    #[instrument(skip(self))]
    pub async fn lookup(&self, short: &str) -> Result<Lookup> {
        let start = Instant::now();
        let result = self.resolve(short).await;

        match &result {
            Ok((_, tier)) => {
                self.reads.record_hit(*tier);
                debug!(%tier, "Resolved short code");
            }
            Err(Error::NotFound { .. }) => self.reads.record_miss(),
            Err(e) => {
                self.reads.record_error();
                warn!("Lookup failed: {}", e);
            }
        }

        result.map(|(long, tier)| Lookup {
            long,
            tier,
            latency: start.elapsed(),
        })
    }

    async fn resolve(&self, short: &str) -> Result<(String, ReadTier)> {
        if let Some(long) = self.cache.get(short) {
            return Ok((long, ReadTier::Cache));
        }

        let key = fast_tier_key(short);
        let cached = with_deadline("fast.get", self.config.op_timeout, self.fast.get(&key)).await?;
        if let Some(long) = cached {
            self.cache.insert(short, long.clone());
            return Ok((long, ReadTier::FastTier));
        }

        let row = with_deadline(
            "durable.select",
            self.config.op_timeout,
            self.durable.select(short),
        )
        .await?;
        match row {
            Some(record) => {
                self.cache.insert(short, record.long.clone());
                self.backfill_fast_tier(key, record.long.clone());
                Ok((record.long, ReadTier::Durable))
            }
            None => Err(Error::not_found(short)),
        }
    }

    /// Copy a durable hit into the fast tier without holding up the reader
    fn backfill_fast_tier(&self, key: String, long: String) {
        let fast = self.fast.clone();
        let reads = self.reads.clone();
        let ttl = self.config.queue.fast_tier_ttl;
        let deadline = self.config.backfill_timeout;

        tokio::spawn(async move {
            if let Err(e) = with_deadline("fast.backfill", deadline, fast.set(&key, &long, ttl)).await
            {
                reads.record_backfill_failure();
                debug!(%key, "Fast tier backfill failed: {}", e);
            }
        });
    }

    /// Whether a short code is known to any tier.
    ///
    /// The cache is consulted first so writes still waiting in the queue are
    /// not reported missing.
    #[instrument(skip(self))]
    pub async fn exists(&self, short: &str) -> Result<bool> {
        if self.cache.contains(short) {
            return Ok(true);
        }
        let key = fast_tier_key(short);
        if with_deadline("fast.exists", self.config.op_timeout, self.fast.exists(&key)).await? {
            return Ok(true);
        }
        with_deadline(
            "durable.exists",
            self.config.op_timeout,
            self.durable.exists(short),
        )
        .await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a mapping. Returns once the cache holds it and the durable write
    /// is queued.
    ///
    /// A queued write that later exhausts its retries is logged by the queue
    /// and not reported here. On [`Error::QueueFull`] the cache slot goes
    /// back to what it held before this call, unless another write has
    /// replaced it since. An earlier accepted value for `short` stays visible.
    #[instrument(skip(self, long))]
    pub fn put(&self, short: &str, long: &str) -> Result<()> {
        let write = self.cache.insert(short, long);
        if let Err(e) = self.queue.enqueue(PendingWrite::new(short, long)) {
            self.cache.restore(short, write);
            warn!("Write not queued: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Allocate a short code for `long` using `generate` for candidates.
    ///
    /// A taken candidate or a full queue moves on to the next candidate. If
    /// the final attempt was refused by the queue, that [`Error::QueueFull`]
    /// is returned; otherwise [`Error::CodeSpaceExhausted`].
    #[instrument(skip(self, long, generate))]
    pub async fn create<G>(&self, long: &str, mut generate: G) -> Result<String>
    where
        G: FnMut() -> String,
    {
        let attempts = self.config.create_attempts;
        let mut last_full = None;

        for attempt in 1..=attempts {
            let short = generate();
            if self.exists(&short).await? {
                debug!(attempt, %short, "Candidate code taken");
                last_full = None;
                continue;
            }
            match self.put(&short, long) {
                Ok(()) => {
                    debug!(attempt, %short, "Short code allocated");
                    return Ok(short);
                }
                Err(e @ Error::QueueFull { .. }) => last_full = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_full.unwrap_or(Error::CodeSpaceExhausted { attempts }))
    }

    /// Point an existing short code at a new long URL.
    ///
    /// The durable row is updated synchronously. A code whose create is still
    /// waiting in the queue has no row yet and reports [`Error::NotFound`].
    #[instrument(skip(self, long))]
    pub async fn update(&self, short: &str, long: &str) -> Result<()> {
        let updated = with_deadline(
            "durable.update",
            self.config.op_timeout,
            self.durable.update(short, long),
        )
        .await?;
        if !updated {
            return Err(Error::not_found(short));
        }

        self.cache.insert(short, long);
        let key = fast_tier_key(short);
        let ttl = self.config.queue.fast_tier_ttl;
        if let Err(e) = with_deadline(
            "fast.set",
            self.config.op_timeout,
            self.fast.set(&key, long, ttl),
        )
        .await
        {
            // Durable is authoritative; a stale fast-tier copy expires with its TTL
            warn!("Fast tier refresh after update failed: {}", e);
        }
        Ok(())
    }

    /// Remove a mapping from every tier.
    ///
    /// Returns [`Error::NotFound`] only if no tier held the code.
    #[instrument(skip(self))]
    pub async fn delete(&self, short: &str) -> Result<()> {
        let cached = self.cache.delete(short);
        let key = fast_tier_key(short);
        let in_fast =
            with_deadline("fast.delete", self.config.op_timeout, self.fast.delete(&key)).await?;
        let in_durable = with_deadline(
            "durable.delete",
            self.config.op_timeout,
            self.durable.delete(short),
        )
        .await?;

        if !(cached || in_fast || in_durable) {
            return Err(Error::not_found(short));
        }
        info!(cached, in_fast, in_durable, "Deleted short code");
        Ok(())
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    /// Whether a request from `client` may proceed
    pub fn allow(&self, client: &str) -> bool {
        self.limiter.allow(client)
    }

    /// Rate limit decision for `client`, with retry hint
    pub fn check(&self, client: &str) -> Decision {
        self.limiter.check(client)
    }

    // =========================================================================
    // Lifecycle & introspection
    // =========================================================================

    /// Drain the write queue, then stop both sweeps.
    ///
    /// A second call returns [`Error::AlreadyStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStopped("coordinator"));
        }
        info!(pending = self.queue.pending(), "Coordinator shutting down");

        let drained = self.queue.shutdown().await;
        let cache = self.cache.stop().await;
        let limiter = self.limiter.stop().await;
        drained.and(cache).and(limiter)?;

        info!("Coordinator stopped");
        Ok(())
    }

    /// Whether [`Coordinator::shutdown`] has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Writes accepted but not yet attempted
    pub fn pending_writes(&self) -> usize {
        self.queue.pending()
    }

    /// Process cache
    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    /// Rate limiter
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Write-behind queue
    pub fn queue(&self) -> &WriteBehindQueue {
        &self.queue
    }

    /// Get configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Snapshot of every component's counters
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            reads: self.reads.snapshot(),
            cache: self.cache.stats(),
            limiter: self.limiter.stats(),
            queue: self.queue.stats(),
            fast_tier: self.fast.stats(),
            durable_tier: self.durable.stats(),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("cache", &self.cache)
            .field("limiter", &self.limiter)
            .field("queue", &self.queue)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
