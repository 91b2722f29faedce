//! Coordinator Metrics
//!
//! Read-path counters plus a combined snapshot of every component.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::CacheStats;
use crate::limiter::LimiterStats;
use crate::queue::QueueStats;
use crate::tiers::TierStats;

use super::store::ReadTier;

/// Read-path counters
#[derive(Debug, Default)]
pub struct ReadMetrics {
    cache_hits: AtomicU64,
    fast_tier_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    backfill_failures: AtomicU64,
}

impl ReadMetrics {
    pub fn record_hit(&self, tier: ReadTier) {
        let counter = match tier {
            ReadTier::Cache => &self.cache_hits,
            ReadTier::FastTier => &self.fast_tier_hits,
            ReadTier::Durable => &self.durable_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill_failure(&self) {
        self.backfill_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReadStats {
        ReadStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fast_tier_hits: self.fast_tier_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            backfill_failures: self.backfill_failures.load(Ordering::Relaxed),
        }
    }
}

/// Read-path snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadStats {
    /// Served from the process cache
    pub cache_hits: u64,
    /// Served from the fast tier
    pub fast_tier_hits: u64,
    /// Served from the durable tier
    pub durable_hits: u64,
    /// Absent from every tier
    pub misses: u64,
    /// Reads failed by a tier error or timeout
    pub errors: u64,
    /// Fast-tier backfills that failed or timed out
    pub backfill_failures: u64,
}

impl ReadStats {
    /// Lookups that found a value
    pub fn hits(&self) -> u64 {
        self.cache_hits + self.fast_tier_hits + self.durable_hits
    }

    /// Fraction of found values served without a remote call
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.hits();
        if hits == 0 {
            0.0
        } else {
            self.cache_hits as f64 / hits as f64
        }
    }
}

/// Point-in-time view of the whole coordinator
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub reads: ReadStats,
    pub cache: CacheStats,
    pub limiter: LimiterStats,
    pub queue: QueueStats,
    pub fast_tier: TierStats,
    pub durable_tier: TierStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_counters_by_tier() {
        let metrics = ReadMetrics::default();
        metrics.record_hit(ReadTier::Cache);
        metrics.record_hit(ReadTier::Cache);
        metrics.record_hit(ReadTier::Cache);
        metrics.record_hit(ReadTier::Durable);
        metrics.record_miss();

        let stats = metrics.snapshot();
        assert_eq!(stats.hits(), 4);
        assert_eq!(stats.misses, 1);
        assert!((stats.cache_hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_ratio_is_zero() {
        assert_eq!(ReadStats::default().cache_hit_ratio(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CoordinatorStats::default();
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["reads"]["cache_hits"], 0);
        assert_eq!(json["queue"]["pending"], 0);
    }
}
