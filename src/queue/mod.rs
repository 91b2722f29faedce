//! Write-Behind Persistence
//!
//! Decouples request latency from remote-tier latency. Writes are accepted
//! into a bounded channel and persisted by a fixed pool of workers.
//!
//! ```text
//!  put() ──try_send──▶ [ bounded channel ] ──▶ worker 0..N
//!                                              │
//!                                              ├─ FastTier::set (TTL)
//!                                              └─ DurableTier::insert_ignore
//!                                                 (RetryPolicy, per-call timeout)
//! ```

mod retry;
mod write_behind;

pub use retry::{Backoff, RetryFailure, RetryPolicy};
pub use write_behind::{
    FastTierFailurePolicy, PendingWrite, QueueStats, WriteBehindQueue, WriteQueueConfig,
};
