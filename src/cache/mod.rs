//! Process-Local TTL Cache
//!
//! The first read tier: a sharded in-memory map from short code to long URL
//! with per-entry expiry.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  TtlCache                    │
//! │  ┌────────┐ ┌────────┐        ┌────────┐     │
//! │  │Shard 0 │ │Shard 1 │  ...   │Shard 63│     │
//! │  │RwLock  │ │RwLock  │        │RwLock  │     │
//! │  └────────┘ └────────┘        └────────┘     │
//! │        ▲ lazy expiry on every read           │
//! │        └─ periodic sweep (default 30s)       │
//! └──────────────────────────────────────────────┘
//! ```

mod entry;
mod shard;
mod ttl;

pub use entry::CacheEntry;
pub use shard::{Shard, ShardedMap};
pub use ttl::{CacheStats, CacheWrite, TtlCache, TtlCacheConfig};

/// Number of shards in the cache map
pub const SHARD_COUNT: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        // Power of 2 enables fast modulo via bitwise AND
        assert!(SHARD_COUNT.is_power_of_two());
    }
}
