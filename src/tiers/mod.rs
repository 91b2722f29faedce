//! Storage Tiers
//!
//! The two remote tiers behind the process-local cache, expressed as ports the
//! coordinator drives. Production adapters (a Redis-style store, a SQL table)
//! implement these traits; the in-memory versions back tests and the demo
//! binary.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────────┐    ┌──────────────────────┐
//! │  TtlCache    │ →  │  FastTier        │ →  │  DurableTier         │
//! │  (process)   │    │  get/set/del+TTL │    │  insert-ignore/select│
//! │              │    │  "url:<short>"   │    │  update/delete       │
//! └──────────────┘    └──────────────────┘    └──────────────────────┘
//! ```

mod durable;
mod fast;
mod fault;
mod record;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

pub use durable::{DurableTier, InMemoryDurableTier};
pub use fast::{FastTier, InMemoryFastTier};
pub use fault::FaultInjector;
pub use record::Record;

/// Namespace prefix for fast-tier keys
pub const FAST_TIER_PREFIX: &str = "url:";

/// Fast-tier key for a short code
pub fn fast_tier_key(short: &str) -> String {
    format!("{}{}", FAST_TIER_PREFIX, short)
}

/// Run a tier call under a deadline. Expiry maps to [`Error::Timeout`].
pub async fn with_deadline<T, F>(operation: &'static str, after: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, call)
        .await
        .unwrap_or(Err(Error::Timeout { operation, after }))
}

/// Tier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Stored keys
    pub entries: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
    /// Calls that failed
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_tier_key_namespaced() {
        assert_eq!(fast_tier_key("abc1234"), "url:abc1234");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        };
        let err = with_deadline("fast.get", Duration::from_secs(1), slow)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::Timeout {
                operation: "fast.get",
                after: Duration::from_secs(1)
            }
        );
        assert!(err.is_retryable());
    }
}
