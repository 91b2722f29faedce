//! Fault injection for in-memory tiers

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Switches that make an in-memory tier behave like a struggling remote store.
#[derive(Debug, Default)]
pub struct FaultInjector {
    unreachable: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
}

impl FaultInjector {
    /// Create an injector with every fault disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Apply configured latency, then report whether this call should fail.
    pub async fn trip(&self) -> bool {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let faults = FaultInjector::new();
        faults.fail_next(2);
        assert!(faults.trip().await);
        assert!(faults.trip().await);
        assert!(!faults.trip().await);
    }

    #[tokio::test]
    async fn test_unreachable_until_cleared() {
        let faults = FaultInjector::new();
        faults.set_unreachable(true);
        assert!(faults.trip().await);
        assert!(faults.trip().await);
        faults.set_unreachable(false);
        assert!(!faults.trip().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_applied() {
        let faults = FaultInjector::new();
        faults.set_latency(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        faults.trip().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
