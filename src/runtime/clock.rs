//! Time sources

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Upper bound applied to TTLs that would overflow `Instant`
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Instant `ttl` after `now`, saturating at a century on overflow.
pub fn expires_at(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + MAX_TTL)
}

/// Source of monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle, the form every component takes.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Starts at the instant it was created and only moves on [`ManualClock::advance`].
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now() - t0, Duration::from_secs(30));
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn test_expires_at_saturates() {
        let now = Instant::now();
        assert_eq!(expires_at(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(expires_at(now, Duration::MAX), now + MAX_TTL);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
