//! Durable Tier - authoritative relational store
//!
//! Source of truth for short code mappings. The backing table is keyed by the
//! short code with a uniqueness constraint; concurrent inserts of the same code
//! resolve by ignoring the loser rather than erroring.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::fault::FaultInjector;
use super::record::Record;
use super::TierStats;
use crate::error::{Error, Result};

/// Relational-style store with a unique key column.
#[async_trait]
pub trait DurableTier: Send + Sync {
    /// Insert unless the short code exists. Returns whether a row was written.
    async fn insert_ignore(&self, record: &Record) -> Result<bool>;

    /// Fetch a record by short code
    async fn select(&self, short: &str) -> Result<Option<Record>>;

    /// Replace the long URL of an existing record. Returns whether it existed.
    async fn update(&self, short: &str, long: &str) -> Result<bool>;

    /// Delete by short code. Returns whether it existed.
    async fn delete(&self, short: &str) -> Result<bool>;

    /// Check if a short code exists
    async fn exists(&self, short: &str) -> Result<bool>;

    /// Get store statistics
    fn stats(&self) -> TierStats;
}

/// In-memory durable tier
/// Uses DashMap for concurrent access; the map key is the uniqueness constraint.
#[derive(Default)]
pub struct InMemoryDurableTier {
    rows: DashMap<String, Record>,
    faults: FaultInjector,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
    conflicts: AtomicU64,
}

impl InMemoryDurableTier {
    /// Create a new in-memory durable tier
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault switches for this store
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Raw lookup that bypasses faults and counters
    pub fn peek(&self, short: &str) -> Option<Record> {
        self.rows.get(short).map(|r| r.clone())
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inserts skipped because the code already existed
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    async fn guard(&self, op: &str) -> Result<()> {
        if self.faults.trip().await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::DurableUnreachable(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableTier for InMemoryDurableTier {
    async fn insert_ignore(&self, record: &Record) -> Result<bool> {
        self.guard("insert").await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.rows.entry(record.short.clone()) {
            Entry::Occupied(_) => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn select(&self, short: &str) -> Result<Option<Record>> {
        self.guard("select").await?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.peek(short))
    }

    async fn update(&self, short: &str, long: &str) -> Result<bool> {
        self.guard("update").await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.rows.get_mut(short) {
            Some(mut row) => {
                row.long = long.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, short: &str) -> Result<bool> {
        self.guard("delete").await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.rows.remove(short).is_some())
    }

    async fn exists(&self, short: &str) -> Result<bool> {
        self.guard("exists").await?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.rows.contains_key(short))
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: self.rows.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_ignore_on_conflict() {
        let tier = InMemoryDurableTier::new();
        let first = Record::new("abc1234", "https://example.com/first");
        let second = Record::new("abc1234", "https://example.com/second");

        assert!(tier.insert_ignore(&first).await.unwrap());
        assert!(!tier.insert_ignore(&second).await.unwrap());

        let stored = tier.select("abc1234").await.unwrap().unwrap();
        assert_eq!(stored.long, "https://example.com/first");
        assert_eq!(tier.conflicts(), 1);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let tier = InMemoryDurableTier::new();
        assert!(!tier.update("missing", "x").await.unwrap());

        tier.insert_ignore(&Record::new("k", "https://a.example"))
            .await
            .unwrap();
        assert!(tier.update("k", "https://b.example").await.unwrap());
        assert_eq!(tier.peek("k").unwrap().long, "https://b.example");

        assert!(tier.delete("k").await.unwrap());
        assert!(!tier.exists("k").await.unwrap());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        use std::sync::Arc;

        let tier = Arc::new(InMemoryDurableTier::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let tier = tier.clone();
            handles.push(tokio::spawn(async move {
                tier.insert_ignore(&Record::new("race", format!("https://example.com/{}", i)))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(tier.conflicts(), 15);
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let tier = InMemoryDurableTier::new();
        tier.faults().fail_next(1);

        let record = Record::new("k", "v");
        let err = tokio_test::assert_err!(tier.insert_ignore(&record).await);
        assert!(matches!(err, Error::DurableUnreachable(_)));
        assert!(tokio_test::assert_ok!(tier.insert_ignore(&record).await));
        assert_eq!(tier.stats().failures, 1);
    }
}
