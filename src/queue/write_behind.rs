//! Write-Behind Queue
//!
//! Bounded hand-off between request tasks and a fixed pool of persistence
//! workers.
//!
//! # Delivery Guarantees
//!
//! 1. `enqueue` never blocks; a full queue is reported as [`Error::QueueFull`]
//! 2. Each item is written to the fast tier, then to the durable tier with
//!    bounded retries
//! 3. An item whose durable write exhausts its retries is dropped and logged
//!    at error level. The caller already returned, so nothing is reported back
//! 4. `shutdown` refuses new items and returns only after every accepted item
//!    has been attempted
//! 5. A panic while processing one item is caught; the worker keeps draining

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::tiers::{fast_tier_key, with_deadline, DurableTier, FastTier, Record};

// =============================================================================
// Configuration
// =============================================================================

/// What a worker does when the fast-tier write fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastTierFailurePolicy {
    /// Drop the whole item and log it
    DropWrite,
    /// Log and still persist to the durable tier
    ContinueDurable,
}

/// Write-behind queue configuration
#[derive(Debug, Clone)]
pub struct WriteQueueConfig {
    /// Channel capacity
    pub capacity: usize,
    /// Number of workers draining the channel
    pub workers: usize,
    /// Deadline for each tier call
    pub op_timeout: Duration,
    /// TTL for fast-tier copies
    pub fast_tier_ttl: Duration,
    /// Durable write retries
    pub retry: RetryPolicy,
    /// Fast-tier failure handling
    pub on_fast_tier_failure: FastTierFailurePolicy,
    /// Start with workers paused
    pub start_paused: bool,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            workers: 5,
            op_timeout: Duration::from_secs(5),
            fast_tier_ttl: Duration::from_secs(24 * 60 * 60),
            retry: RetryPolicy::default(),
            on_fast_tier_failure: FastTierFailurePolicy::DropWrite,
            start_paused: false,
        }
    }
}

impl WriteQueueConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("queue needs at least one worker".into()));
        }
        if self.op_timeout.is_zero() {
            return Err(Error::Config("queue op_timeout must be non-zero".into()));
        }
        self.retry.validate()
    }
}

// =============================================================================
// Pending Write
// =============================================================================

/// A write accepted by the coordinator but not yet durable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingWrite {
    /// Short code
    pub short: String,
    /// Long URL
    pub long: String,
    /// When the caller issued the write
    pub requested_at: DateTime<Utc>,
}

impl PendingWrite {
    /// Create a pending write stamped now
    pub fn new(short: impl Into<String>, long: impl Into<String>) -> Self {
        Self {
            short: short.into(),
            long: long.into(),
            requested_at: Utc::now(),
        }
    }

    fn to_record(&self) -> Record {
        Record {
            short: self.short.clone(),
            long: self.long.clone(),
            created_at: self.requested_at,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Queue counters
#[derive(Debug, Default)]
pub struct QueueMetrics {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    committed: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
    fast_tier_failures: AtomicU64,
    dropped: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Items accepted
    pub enqueued: u64,
    /// Items refused (full or closed)
    pub rejected: u64,
    /// Items durably stored, including insert conflicts
    pub committed: u64,
    /// Durable inserts skipped because the code already existed
    pub conflicts: u64,
    /// Durable attempts beyond the first
    pub retries: u64,
    /// Fast-tier writes that failed
    pub fast_tier_failures: u64,
    /// Items lost (fast-tier drop, exhausted retries or panic)
    pub dropped: u64,
    /// Panics caught in workers
    pub panics: u64,
    /// Items accepted but not yet attempted to completion
    pub pending: usize,
}

// =============================================================================
// Queue
// =============================================================================

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct WorkerContext {
    rx: tokio::sync::Mutex<mpsc::Receiver<PendingWrite>>,
    fast: Arc<dyn FastTier>,
    durable: Arc<dyn DurableTier>,
    config: WriteQueueConfig,
    metrics: Arc<QueueMetrics>,
    pending: Arc<AtomicUsize>,
}

/// Bounded write-behind queue drained by a fixed worker pool.
pub struct WriteBehindQueue {
    tx: RwLock<Option<mpsc::Sender<PendingWrite>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    paused: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<QueueMetrics>,
    config: WriteQueueConfig,
}

impl WriteBehindQueue {
    /// Create the queue and spawn its workers. Needs a Tokio runtime.
    pub fn start(
        config: WriteQueueConfig,
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.capacity);
        let (paused, _) = watch::channel(config.start_paused);
        let metrics = Arc::new(QueueMetrics::default());
        let pending = Arc::new(AtomicUsize::new(0));

        let ctx = Arc::new(WorkerContext {
            rx: tokio::sync::Mutex::new(rx),
            fast,
            durable,
            config: config.clone(),
            metrics: metrics.clone(),
            pending: pending.clone(),
        });

        let workers = (0..config.workers)
            .map(|id| {
                let ctx = ctx.clone();
                let paused = paused.subscribe();
                tokio::spawn(run_worker(id, ctx, paused))
            })
            .collect();

        info!(
            "Write-behind queue started (capacity={}, workers={})",
            config.capacity, config.workers
        );

        Ok(Self {
            tx: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            paused,
            pending,
            metrics,
            config,
        })
    }

    /// Hand a write to the workers without waiting.
    pub fn enqueue(&self, write: PendingWrite) -> Result<()> {
        let guard = self.tx.read();
        let tx = match guard.as_ref() {
            Some(tx) => tx,
            None => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(Error::QueueClosed);
            }
        };

        // Count before sending so a fast worker can never decrement first
        self.pending.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(write) {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                match e {
                    mpsc::error::TrySendError::Full(w) => {
                        debug!(short = %w.short, "Write queue full");
                        Err(Error::QueueFull {
                            capacity: self.config.capacity,
                        })
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(Error::QueueClosed),
                }
            }
        }
    }

    /// Stop workers from taking new items. In-flight items finish.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Let workers take items again
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Whether workers are paused
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Items accepted and not yet fully attempted
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the queue still accepts writes
    pub fn is_open(&self) -> bool {
        self.tx.read().is_some()
    }

    /// Get configuration
    pub fn config(&self) -> &WriteQueueConfig {
        &self.config
    }

    /// Counter snapshot
    pub fn stats(&self) -> QueueStats {
        let m = &self.metrics;
        QueueStats {
            enqueued: m.enqueued.load(Ordering::Relaxed),
            rejected: m.rejected.load(Ordering::Relaxed),
            committed: m.committed.load(Ordering::Relaxed),
            conflicts: m.conflicts.load(Ordering::Relaxed),
            retries: m.retries.load(Ordering::Relaxed),
            fast_tier_failures: m.fast_tier_failures.load(Ordering::Relaxed),
            dropped: m.dropped.load(Ordering::Relaxed),
            panics: m.panics.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Close the input side and wait until every accepted item was attempted.
    ///
    /// A second call returns [`Error::AlreadyStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        let tx = self.tx.write().take();
        if tx.is_none() {
            return Err(Error::AlreadyStopped("write-behind queue"));
        }
        // Workers see the channel close once it is drained
        drop(tx);
        self.resume();

        info!(pending = self.pending(), "Draining write-behind queue");

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Write-behind worker ended abnormally: {}", e);
            }
        }

        let left = self.pending();
        if left != 0 {
            return Err(Error::Internal(format!(
                "{} writes still pending after workers exited",
                left
            )));
        }

        let stats = self.stats();
        info!(
            committed = stats.committed,
            dropped = stats.dropped,
            "Write-behind queue drained"
        );
        Ok(())
    }
}

impl std::fmt::Debug for WriteBehindQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindQueue")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .field("open", &self.is_open())
            .finish()
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Wait until the pause flag equals `paused`. False once the queue is gone.
async fn wait_paused(flag: &mut watch::Receiver<bool>, paused: bool) -> bool {
    flag.wait_for(|p| *p == paused).await.is_ok()
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>, mut paused: watch::Receiver<bool>) {
    debug!(worker = id, "Write-behind worker started");

    loop {
        if !wait_paused(&mut paused, false).await {
            // Queue handle dropped without shutdown
            break;
        }

        let next = tokio::select! {
            biased;
            _ = wait_paused(&mut paused, true) => continue,
            item = async { ctx.rx.lock().await.recv().await } => item,
        };

        let Some(write) = next else {
            break;
        };

        let _pending = PendingGuard(ctx.pending.clone());
        let short = write.short.clone();
        let outcome = AssertUnwindSafe(process(id, &ctx, write))
            .catch_unwind()
            .await;

        if let Err(panic) = outcome {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            ctx.metrics.panics.fetch_add(1, Ordering::Relaxed);
            ctx.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            error!(worker = id, %short, "Worker recovered from panic: {}", message);
        }
    }

    debug!(worker = id, "Write-behind worker exited");
}

#[instrument(skip(ctx, write), fields(short = %write.short))]
async fn process(worker: usize, ctx: &WorkerContext, write: PendingWrite) {
    let op_timeout = ctx.config.op_timeout;

    // Phase 1: fast tier
    let key = fast_tier_key(&write.short);
    let fast = with_deadline(
        "fast.set",
        op_timeout,
        ctx.fast.set(&key, &write.long, ctx.config.fast_tier_ttl),
    )
    .await;

    if let Err(e) = fast {
        ctx.metrics.fast_tier_failures.fetch_add(1, Ordering::Relaxed);
        match ctx.config.on_fast_tier_failure {
            FastTierFailurePolicy::DropWrite => {
                ctx.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(worker, "Fast tier write failed, dropping write: {}", e);
                return;
            }
            FastTierFailurePolicy::ContinueDurable => {
                warn!(worker, "Fast tier write failed, continuing to durable tier: {}", e);
            }
        }
    }

    // Phase 2: durable tier with retries
    let record = write.to_record();
    let result = ctx
        .config
        .retry
        .run("durable insert", |attempt| {
            if attempt > 1 {
                ctx.metrics.retries.fetch_add(1, Ordering::Relaxed);
            }
            let record = &record;
            async move {
                with_deadline("durable.insert", op_timeout, ctx.durable.insert_ignore(record)).await
            }
        })
        .await;

    match result {
        Ok(inserted) => {
            ctx.metrics.committed.fetch_add(1, Ordering::Relaxed);
            if !inserted {
                ctx.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(worker, "Short code already persisted, insert ignored");
            }
        }
        Err(failure) => {
            ctx.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            let err = Error::RetryExhausted {
                short: write.short.clone(),
                attempts: failure.attempts,
                last_error: failure.last_error.to_string(),
            };
            error!(worker, "Write lost: {}", err);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::{InMemoryDurableTier, InMemoryFastTier, TierStats};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    fn tiers() -> (Arc<InMemoryFastTier>, Arc<InMemoryDurableTier>) {
        (
            Arc::new(InMemoryFastTier::new()),
            Arc::new(InMemoryDurableTier::new()),
        )
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_reaches_both_tiers() {
        let (fast, durable) = tiers();
        let queue =
            WriteBehindQueue::start(WriteQueueConfig::default(), fast.clone(), durable.clone())
                .unwrap();

        queue
            .enqueue(PendingWrite::new("abc1234", "https://example.com/x"))
            .unwrap();
        queue.shutdown().await.unwrap();

        assert_eq!(
            durable.peek("abc1234").unwrap().long,
            "https://example.com/x"
        );
        assert_eq!(
            fast.peek("url:abc1234").as_deref(),
            Some("https://example.com/x")
        );
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_overflow_while_paused_returns_queue_full() {
        let (fast, durable) = tiers();
        let config = WriteQueueConfig {
            capacity: 8,
            start_paused: true,
            ..Default::default()
        };
        let queue = WriteBehindQueue::start(config, fast, durable.clone()).unwrap();

        for i in 0..8 {
            queue
                .enqueue(PendingWrite::new(format!("k{}", i), "https://example.com"))
                .unwrap();
        }
        for i in 8..12 {
            let err = queue
                .enqueue(PendingWrite::new(format!("k{}", i), "https://example.com"))
                .unwrap_err();
            assert_matches!(err, Error::QueueFull { capacity: 8 });
        }
        assert_eq!(queue.pending(), 8);
        assert_eq!(queue.stats().rejected, 4);
        assert!(durable.is_empty());

        queue.shutdown().await.unwrap();
        assert_eq!(durable.len(), 8);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_rejected() {
        let (fast, durable) = tiers();
        let queue = WriteBehindQueue::start(WriteQueueConfig::default(), fast, durable).unwrap();
        queue.shutdown().await.unwrap();

        assert!(!queue.is_open());
        assert_matches!(
            queue.enqueue(PendingWrite::new("late", "https://example.com")),
            Err(Error::QueueClosed)
        );
        assert_matches!(queue.shutdown().await, Err(Error::AlreadyStopped(_)));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_slow_writes() {
        let (fast, durable) = tiers();
        durable.faults().set_latency(Duration::from_millis(20));
        let queue =
            WriteBehindQueue::start(WriteQueueConfig::default(), fast, durable.clone()).unwrap();

        for i in 0..20 {
            queue
                .enqueue(PendingWrite::new(format!("slow{}", i), "https://example.com"))
                .unwrap();
        }
        queue.shutdown().await.unwrap();
        assert_eq!(durable.len(), 20);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_transient_durable_failure_retried() {
        let (fast, durable) = tiers();
        durable.faults().fail_next(2);
        let config = WriteQueueConfig {
            workers: 1,
            retry: fast_retry(),
            ..Default::default()
        };
        let queue = WriteBehindQueue::start(config, fast, durable.clone()).unwrap();

        queue
            .enqueue(PendingWrite::new("flaky", "https://example.com"))
            .unwrap();
        queue.shutdown().await.unwrap();

        assert!(durable.peek("flaky").is_some());
        let stats = queue.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_write() {
        let (fast, durable) = tiers();
        durable.faults().set_unreachable(true);
        let config = WriteQueueConfig {
            retry: fast_retry(),
            ..Default::default()
        };
        let queue = WriteBehindQueue::start(config, fast, durable.clone()).unwrap();

        queue
            .enqueue(PendingWrite::new("lost", "https://example.com"))
            .unwrap();
        queue.shutdown().await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.committed, 0);
        assert_eq!(durable.stats().failures, 3);
    }

    #[tokio::test]
    async fn test_fast_tier_failure_policy() {
        let (fast, durable) = tiers();
        fast.faults().set_unreachable(true);
        let queue = WriteBehindQueue::start(
            WriteQueueConfig::default(),
            fast.clone(),
            durable.clone(),
        )
        .unwrap();
        queue
            .enqueue(PendingWrite::new("dropped", "https://example.com"))
            .unwrap();
        queue.shutdown().await.unwrap();
        assert!(durable.peek("dropped").is_none());
        assert_eq!(queue.stats().fast_tier_failures, 1);
        assert_eq!(queue.stats().dropped, 1);

        let config = WriteQueueConfig {
            on_fast_tier_failure: FastTierFailurePolicy::ContinueDurable,
            ..Default::default()
        };
        let queue = WriteBehindQueue::start(config, fast, durable.clone()).unwrap();
        queue
            .enqueue(PendingWrite::new("kept", "https://example.com"))
            .unwrap();
        queue.shutdown().await.unwrap();
        assert!(durable.peek("kept").is_some());
        assert_eq!(queue.stats().dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_timeout_counts_as_retryable() {
        let (fast, durable) = tiers();
        durable.faults().set_latency(Duration::from_secs(10));
        let config = WriteQueueConfig {
            workers: 1,
            op_timeout: Duration::from_secs(1),
            retry: fast_retry(),
            ..Default::default()
        };
        let queue = WriteBehindQueue::start(config, fast, durable).unwrap();
        queue
            .enqueue(PendingWrite::new("slow", "https://example.com"))
            .unwrap();
        queue.shutdown().await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.dropped, 1);
    }

    /// Durable tier that panics on one poisoned code
    struct PoisonedDurable {
        inner: InMemoryDurableTier,
    }

    #[async_trait]
    impl DurableTier for PoisonedDurable {
        async fn insert_ignore(&self, record: &Record) -> Result<bool> {
            if record.short == "poison" {
                panic!("poisoned record");
            }
            self.inner.insert_ignore(record).await
        }
        async fn select(&self, short: &str) -> Result<Option<Record>> {
            self.inner.select(short).await
        }
        async fn update(&self, short: &str, long: &str) -> Result<bool> {
            self.inner.update(short, long).await
        }
        async fn delete(&self, short: &str) -> Result<bool> {
            self.inner.delete(short).await
        }
        async fn exists(&self, short: &str) -> Result<bool> {
            self.inner.exists(short).await
        }
        fn stats(&self) -> TierStats {
            self.inner.stats()
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panic() {
        let fast = Arc::new(InMemoryFastTier::new());
        let durable = Arc::new(PoisonedDurable {
            inner: InMemoryDurableTier::new(),
        });
        let config = WriteQueueConfig {
            workers: 1,
            ..Default::default()
        };
        let queue = WriteBehindQueue::start(config, fast, durable.clone()).unwrap();

        queue
            .enqueue(PendingWrite::new("poison", "https://example.com"))
            .unwrap();
        queue
            .enqueue(PendingWrite::new("after", "https://example.com"))
            .unwrap();
        queue.shutdown().await.unwrap();

        // The single worker kept going after the panic
        assert!(durable.inner.peek("after").is_some());
        let stats = queue.stats();
        assert_eq!(stats.panics, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(WriteQueueConfig::default().validate().is_ok());
        let no_workers = WriteQueueConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(no_workers.validate().is_err());
    }
}
