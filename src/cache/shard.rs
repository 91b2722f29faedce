//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards, each guarded by its own
//! `RwLock`. Readers of a shard run in parallel; writers and sweeps take the
//! shard exclusively, so unrelated keys rarely contend.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single shard containing a hashmap and counters
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Get the number of entries in this shard
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    /// Look up a key under the read lock and map the value through `f`.
    pub fn read_with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> Option<R>) -> Option<R>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.map.read();
        guard.get(key).and_then(f)
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write().insert(key, value)
    }

    /// Remove a value, returning it if present
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write().remove(key)
    }

    /// Replace or remove the value under `key` only if `pred` holds for it.
    ///
    /// The check and the change happen under one write lock. `None` removes
    /// the key. Returns whether the value matched.
    pub fn replace_if<Q>(
        &self,
        key: &Q,
        pred: impl FnOnce(&V) -> bool,
        replacement: Option<V>,
    ) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.map.write();
        if !guard.get(key).is_some_and(pred) {
            return false;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        match replacement {
            Some(value) => {
                if let Some(slot) = guard.get_mut(key) {
                    *slot = value;
                }
            }
            None => {
                guard.remove(key);
            }
        }
        true
    }

    /// Keep only entries matching `keep`, returning how many were dropped.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        let before = guard.len();
        guard.retain(|k, v| keep(k, v));
        before - guard.len()
    }

    /// Clear all entries, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut guard = self.map.write();
        let dropped = guard.len();
        guard.clear();
        dropped
    }
}

/// Sharded map with a power-of-two shard count
pub struct ShardedMap<K, V, const N: usize = 64> {
    shards: Box<[Shard<K, V>]>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Shard<K, V>> = (0..N).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    /// Get the shard count
    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Get total read count
    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    /// Get total write count
    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }

    /// Iterate over the shards
    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter()
    }
}

impl<K: Eq + Hash, V, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard_for<Q>(&self, key: &Q) -> &Shard<K, V>
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    /// Look up a key and map the value through `f` while holding the read lock.
    pub fn read_with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> Option<R>) -> Option<R>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).read_with(key, f)
    }

    /// Insert a value
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    /// Remove a value
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove(key)
    }

    /// Conditional replace, see [`Shard::replace_if`]
    pub fn replace_if<Q>(
        &self,
        key: &Q,
        pred: impl FnOnce(&V) -> bool,
        replacement: Option<V>,
    ) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).replace_if(key, pred, replacement)
    }

    /// Retain entries across all shards, one shard lock at a time.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        self.shards.iter().map(|s| s.retain(&mut keep)).sum()
    }

    /// Clear all shards
    pub fn clear(&self) -> usize {
        self.shards.iter().map(|s| s.clear()).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_insert_read_remove() {
        let shard: Shard<String, i32> = Shard::new();
        assert!(shard.is_empty());

        assert!(shard.insert("key1".to_string(), 42).is_none());
        assert_eq!(shard.insert("key1".to_string(), 43), Some(42));
        assert_eq!(shard.len(), 1);

        assert_eq!(shard.read_with("key1", |v| Some(*v)), Some(43));
        assert_eq!(shard.remove("key1"), Some(43));
        assert!(shard.is_empty());
        assert_eq!(shard.write_count(), 3);
        assert_eq!(shard.read_count(), 1);
    }

    #[test]
    fn test_replace_if_only_on_match() {
        let map: ShardedMap<String, i32, 8> = ShardedMap::new();
        map.insert("k".to_string(), 1);

        assert!(!map.replace_if("k", |v| *v == 2, Some(10)));
        assert_eq!(map.read_with("k", |v| Some(*v)), Some(1));

        assert!(map.replace_if("k", |v| *v == 1, Some(10)));
        assert_eq!(map.read_with("k", |v| Some(*v)), Some(10));

        assert!(map.replace_if("k", |v| *v == 10, None));
        assert!(map.is_empty());
        assert!(!map.replace_if("k", |_| true, Some(1)));
        assert!(map.is_empty());
    }

    #[test]
    fn test_read_with_filter_hides_value() {
        let map: ShardedMap<String, i32, 8> = ShardedMap::new();
        map.insert("odd".to_string(), 3);

        let even = map.read_with("odd", |v| (v % 2 == 0).then_some(*v));
        assert_eq!(even, None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_sharded_map_distributes_and_retains() {
        let map: ShardedMap<u32, u32, 16> = ShardedMap::new();
        for i in 0..1000 {
            map.insert(i, i);
        }
        assert_eq!(map.len(), 1000);
        assert!(map.shards().filter(|s| !s.is_empty()).count() > 1);

        let dropped = map.retain(|_, v| v % 2 == 0);
        assert_eq!(dropped, 500);
        assert_eq!(map.len(), 500);

        assert_eq!(map.clear(), 500);
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        use std::sync::Arc;

        let map: Arc<ShardedMap<u64, u64, 32>> = Arc::new(ShardedMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        map.insert(t * 1000 + i, i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 2000);
    }
}
