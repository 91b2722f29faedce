//! LinkStor - Tiered Storage Coordinator for Short Links
//!
//! Serves short code lookups from the fastest tier that has them and absorbs
//! writes asynchronously so request latency never waits on the durable store.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!  get/put/del ──▶│               Coordinator                │
//!                 │  ┌──────────┐ ┌───────────┐ ┌──────────┐ │
//!                 │  │ TtlCache │ │RateLimiter│ │WriteQueue│ │
//!                 │  └──────────┘ └───────────┘ └────┬─────┘ │
//!                 └──────────┬───────────────────────┼───────┘
//!                            ▼                       ▼
//!                     ┌────────────┐          ┌─────────────┐
//!                     │  FastTier  │          │ DurableTier │
//!                     └────────────┘          └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Process-local TTL cache with lazy expiry and periodic sweep
//! - [`coordinator`] - Read-through / write-behind orchestration
//! - [`error`] - Error types
//! - [`limiter`] - Per-key token bucket rate limiter
//! - [`queue`] - Bounded write-behind queue and retry policy
//! - [`runtime`] - Clock abstraction and cancellable background tasks
//! - [`tiers`] - Fast and durable tier ports with in-memory implementations

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod runtime;
pub mod tiers;

// Re-export commonly used types
pub use cache::{TtlCache, TtlCacheConfig};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorStats, Lookup, ReadTier};
pub use error::{Error, Result};
pub use limiter::{client_key, Decision, RateLimiter, RateLimiterConfig};
pub use queue::{Backoff, PendingWrite, RetryPolicy, WriteBehindQueue, WriteQueueConfig};
pub use runtime::{Clock, ManualClock, SystemClock};
pub use tiers::{DurableTier, FastTier, InMemoryDurableTier, InMemoryFastTier, Record};
