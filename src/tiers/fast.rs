//! Fast Tier - shared low-latency key-value store
//!
//! Second read tier behind the process-local cache. Holds copies of durable
//! data with a TTL; losing an entry here never loses data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::fault::FaultInjector;
use super::TierStats;
use crate::error::{Error, Result};
use crate::runtime::{expires_at, Clock, SystemClock};

/// Key-value store with TTL support.
#[async_trait]
pub trait FastTier: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value that expires after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get store statistics
    fn stats(&self) -> TierStats;
}

/// In-memory fast tier
/// Uses DashMap for concurrent access; expiry is checked on read.
pub struct InMemoryFastTier {
    storage: DashMap<String, (String, Instant)>,
    clock: Arc<dyn Clock>,
    faults: FaultInjector,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

impl Default for InMemoryFastTier {
    fn default() -> Self {
        Self::with_clock(SystemClock::shared())
    }
}

impl InMemoryFastTier {
    /// Create a new in-memory fast tier
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with an explicit clock for TTL checks
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            storage: DashMap::new(),
            clock,
            faults: FaultInjector::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Fault switches for this store
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Raw lookup that bypasses faults and counters
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.storage
            .get(key)
            .filter(|e| now <= e.1)
            .map(|e| e.0.clone())
    }

    async fn guard(&self, op: &str) -> Result<()> {
        if self.faults.trip().await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::FastTierUnreachable(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl FastTier for InMemoryFastTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.guard("get").await?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.guard("set").await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let expiry = expires_at(self.clock.now(), ttl);
        self.storage
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.guard("delete").await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.guard("exists").await?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.peek(key).is_some())
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: self.storage.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualClock;

    #[tokio::test]
    async fn test_set_get_delete() {
        let tier = InMemoryFastTier::new();
        tier.set("url:abc", "https://example.com", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            tier.get("url:abc").await.unwrap().as_deref(),
            Some("https://example.com")
        );
        assert!(tier.exists("url:abc").await.unwrap());
        assert!(tier.delete("url:abc").await.unwrap());
        assert!(!tier.delete("url:abc").await.unwrap());
        assert_eq!(tier.get("url:abc").await.unwrap(), None);

        let stats = tier.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.deletes, 2);
    }

    #[tokio::test]
    async fn test_ttl_respected() {
        let clock = ManualClock::new();
        let tier = InMemoryFastTier::with_clock(clock.clone());
        tier.set("k", "v", Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_secs(11));
        assert_eq!(tier.get("k").await.unwrap(), None);
        assert!(!tier.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_ttl_does_not_overflow() {
        let clock = ManualClock::new();
        let tier = InMemoryFastTier::with_clock(clock.clone());
        tier.set("k", "v", Duration::MAX).await.unwrap();

        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(tier.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_unreachable_surfaces_error() {
        let tier = InMemoryFastTier::new();
        tier.faults().set_unreachable(true);

        let err = tier.get("k").await.unwrap_err();
        assert!(matches!(err, Error::FastTierUnreachable(_)));
        assert_eq!(tier.stats().failures, 1);
    }
}
