//! Per-key token bucket rate limiter

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use super::bucket::{Decision, Visitor};
use crate::error::{Error, Result};
use crate::runtime::{BackgroundTask, Clock};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests allowed per window
    pub rate: u32,
    /// Refill window
    pub window: Duration,
    /// Visitors whose last refill is older than this are evicted
    pub idle_horizon: Duration,
    /// Interval between idle sweeps
    pub sweep_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 100,
            window: Duration::from_secs(60),
            idle_horizon: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(Error::Config("limiter rate must be at least 1".into()));
        }
        if self.window.is_zero() || self.sweep_interval.is_zero() {
            return Err(Error::Config(
                "limiter window and sweep_interval must be non-zero".into(),
            ));
        }
        // An active key refills at least once per window; a shorter horizon
        // would evict it and hand it a fresh bucket.
        if self.idle_horizon < self.window {
            return Err(Error::Config(format!(
                "limiter idle_horizon ({:?}) must be >= window ({:?})",
                self.idle_horizon, self.window
            )));
        }
        Ok(())
    }
}

/// Point-in-time limiter counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Tracked keys
    pub visitors: usize,
    /// Requests allowed
    pub allowed: u64,
    /// Requests denied
    pub denied: u64,
    /// Visitors removed by idle sweeps
    pub evicted: u64,
}

/// Token bucket rate limiter keyed by client.
///
/// The visitor map lock is held only to find or create a bucket; the refill
/// and decrement run under that bucket's own mutex.
pub struct RateLimiter {
    visitors: RwLock<HashMap<String, Arc<Mutex<Visitor>>>>,
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<BackgroundTask>>,
    stopped: AtomicBool,
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter without a background idle sweep.
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            visitors: RwLock::new(HashMap::new()),
            config,
            clock,
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    /// Create a limiter and start its idle sweep. Needs a Tokio runtime.
    pub fn start(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let limiter = Arc::new(Self::new(config, clock)?);
        let weak: Weak<Self> = Arc::downgrade(&limiter);
        let task = BackgroundTask::spawn_periodic(
            "rate-limiter-idle-sweep",
            limiter.config.sweep_interval,
            move || match weak.upgrade() {
                Some(limiter) => {
                    limiter.evict_idle();
                    true
                }
                None => false,
            },
        );
        *limiter.sweeper.lock() = Some(task);
        Ok(limiter)
    }

    fn visitor(&self, key: &str, now: Instant) -> Arc<Mutex<Visitor>> {
        if let Some(visitor) = self.visitors.read().get(key) {
            return visitor.clone();
        }
        let mut visitors = self.visitors.write();
        visitors
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Visitor::new(self.config.rate, now))))
            .clone()
    }

    /// Check and consume a token for `key`.
    pub fn check(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let visitor = self.visitor(key, now);
        let decision = visitor
            .lock()
            .try_acquire(now, self.config.rate, self.config.window);

        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            debug!(key, retry_after = ?decision.retry_after, "Rate limit exceeded");
        }
        decision
    }

    /// Whether a request from `key` may proceed
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).allowed
    }

    /// Remove visitors idle beyond the horizon. Returns the number removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let horizon = self.config.idle_horizon;
        let mut visitors = self.visitors.write();
        let before = visitors.len();
        // A visitor still referenced outside the map is mid-`check`
        visitors.retain(|_, visitor| {
            Arc::strong_count(visitor) > 1 || !visitor.lock().is_idle(now, horizon)
        });
        let removed = before - visitors.len();
        drop(visitors);

        if removed > 0 {
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Evicted idle rate-limit visitors");
        }
        removed
    }

    /// Tokens left for `key`, if it is tracked
    pub fn tokens(&self, key: &str) -> Option<u32> {
        self.visitors.read().get(key).map(|v| v.lock().tokens())
    }

    /// Whether `key` has live state
    pub fn contains(&self, key: &str) -> bool {
        self.visitors.read().contains_key(key)
    }

    /// Number of tracked keys
    pub fn visitor_count(&self) -> usize {
        self.visitors.read().len()
    }

    /// Get configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Stop the idle sweep and forget every visitor. A second call errors.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStopped("rate limiter"));
        }
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        self.visitors.write().clear();
        info!("Rate limiter stopped");
        Ok(())
    }

    /// Counter snapshot
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            visitors: self.visitor_count(),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("visitors", &self.visitor_count())
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
