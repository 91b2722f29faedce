//! Per-Key Rate Limiter
//!
//! Token bucket with lazy refill: nothing runs per key between requests. Each
//! [`RateLimiter::check`] refills the key's bucket if a full window has passed,
//! then spends one token. A low-frequency sweep drops keys that went quiet.
//!
//! # Bucket initialisation
//!
//! A new key's bucket starts full (`rate` tokens) and the request that creates
//! it is charged like any other, leaving `rate - 1`. The first request from a
//! key therefore always succeeds, which is why `rate` must be at least 1.

mod bucket;
mod key;
mod token_bucket;

pub use bucket::{Decision, Visitor};
pub use key::client_key;
pub use token_bucket::{LimiterStats, RateLimiter, RateLimiterConfig};
