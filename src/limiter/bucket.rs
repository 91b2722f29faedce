//! Per-key token bucket state

use std::time::{Duration, Instant};

use serde::Serialize;

/// Outcome of a single rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Tokens left in the current window after this request
    pub remaining: u32,
    /// Time until the bucket refills; zero when allowed
    pub retry_after: Duration,
}

/// Token bucket for one key.
///
/// Buckets start full and the creating request spends one token like any
/// other, so the very first request from a key always succeeds and leaves
/// `rate - 1` tokens.
#[derive(Debug, Clone)]
pub struct Visitor {
    tokens: u32,
    last_refill: Instant,
}

impl Visitor {
    /// A full bucket refilled at `now`
    pub fn new(rate: u32, now: Instant) -> Self {
        Self {
            tokens: rate,
            last_refill: now,
        }
    }

    /// Lazily refill, then spend a token if one is available.
    pub fn try_acquire(&mut self, now: Instant, rate: u32, window: Duration) -> Decision {
        let mut elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed >= window {
            self.tokens = rate;
            self.last_refill = now;
            elapsed = Duration::ZERO;
        }

        if self.tokens == 0 {
            return Decision {
                allowed: false,
                remaining: 0,
                retry_after: window - elapsed,
            };
        }

        self.tokens -= 1;
        Decision {
            allowed: true,
            remaining: self.tokens,
            retry_after: Duration::ZERO,
        }
    }

    /// Tokens currently available
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Instant of the last refill
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Idle once the last refill is further back than `horizon`.
    pub fn is_idle(&self, now: Instant, horizon: Duration) -> bool {
        now.saturating_duration_since(self.last_refill) > horizon
    }
}
