//! Tiered Store Coordinator
//!
//! Owns the cache, rate limiter and write-behind queue, and drives the two
//! remote tiers.
//!
//! # Read path
//!
//! ```text
//! get(short)
//!   ├─ TtlCache hit ─────────────────────────────▶ Cache
//!   ├─ FastTier hit ──▶ fill cache ──────────────▶ FastTier
//!   ├─ DurableTier hit ─▶ fill cache + spawn fast backfill ─▶ Durable
//!   └─ miss everywhere ──────────────────────────▶ NotFound
//! ```
//!
//! # Write path
//!
//! `put` sets the cache, then enqueues. The caller gets success as soon as
//! the write is queued; durable persistence happens later and its failure is
//! only visible in logs and [`QueueStats`](crate::queue::QueueStats). This is
//! the accepted inconsistency window of write-behind.

mod stats;
mod store;

pub use stats::{CoordinatorStats, ReadMetrics, ReadStats};
pub use store::{Coordinator, CoordinatorConfig, Lookup, ReadTier};
