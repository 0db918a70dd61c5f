//! LRU Cache
//!
//! O(1) least-recently-used cache with per-entry TTL.
//!
//! # Design
//!
//! - `HashMap<K, usize>` maps keys to slots in a dense arena of nodes
//! - Nodes form an index-linked doubly linked list, head = most recently used
//! - Removal swaps the last slot into the hole so the arena never fragments
//! - Expired entries are dropped lazily on read and by a periodic sweeper
//! - Memory usage is tracked incrementally and re-estimated every
//!   `reestimate_every` mutations

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::entry::{CacheEntry, Weigher};

/// LRU cache configuration
#[derive(Debug, Clone)]
pub struct LruConfig {
    /// Maximum number of entries (hard cap)
    pub max_size: usize,
    /// TTL applied when `set` is called without one (`None` = no expiry)
    pub default_ttl: Option<Duration>,
    /// Number of mutations between full memory re-estimates
    pub reestimate_every: u64,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Some(Duration::from_secs(300)),
            reestimate_every: 1000,
        }
    }
}

/// LRU cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LruStats {
    pub entries: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub memory_bytes: usize,
    pub hit_rate: f64,
}

struct Node<K, V> {
    key: K,
    entry: CacheEntry<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena-backed LRU cache
pub struct LruCache<K, V> {
    config: LruConfig,
    map: HashMap<K, usize>,
    slots: Vec<Node<K, V>>,
    head: Option<usize>,
    tail: Option<usize>,
    weigher: Option<Arc<dyn Weigher<K, V>>>,
    memory_bytes: usize,
    mutations: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("config", &self.config)
            .field("entries", &self.map.len())
            .field("memory_bytes", &self.memory_bytes)
            .finish()
    }
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new cache with default configuration
    pub fn new() -> Self {
        Self::with_config(LruConfig::default())
    }

    /// Create a new cache with custom configuration
    pub fn with_config(config: LruConfig) -> Self {
        let capacity = config.max_size.min(4096);
        Self {
            config,
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            weigher: None,
            memory_bytes: 0,
            mutations: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    /// Use `weigher` for memory estimates instead of the static type size
    pub fn with_weigher(mut self, weigher: Arc<dyn Weigher<K, V>>) -> Self {
        self.weigher = Some(weigher);
        self.reestimate();
        self
    }

    /// Get a value, promoting it to most recently used
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        let Some(&idx) = self.map.get(key) else {
            self.misses += 1;
            return None;
        };

        if self.node(idx).entry.is_expired_at(now) {
            self.remove_slot(idx);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        self.detach(idx);
        self.push_front(idx);
        self.hits += 1;

        let node = self.node_mut(idx);
        node.entry.touch(now);
        Some(node.entry.value.clone())
    }

    /// Look at an entry without promoting it or counting a hit
    pub fn peek(&self, key: &K) -> Option<&CacheEntry<V>> {
        let idx = *self.map.get(key)?;
        let entry = &self.node(idx).entry;
        (!entry.is_expired_at(Instant::now())).then_some(entry)
    }

    /// Insert or replace a value; `None` falls back to the default TTL.
    /// Returns the key evicted to make room, if any.
    pub fn set(&mut self, key: K, value: V, ttl: Option<Duration>) -> Option<K> {
        let ttl = ttl.or(self.config.default_ttl);
        self.insert(key, value, ttl)
    }

    /// Insert or replace a value with exactly `ttl` (`None` = never expires)
    pub fn insert(&mut self, key: K, value: V, ttl: Option<Duration>) -> Option<K> {
        let now = Instant::now();
        let size = self.weigh(&key, &value);

        if let Some(&idx) = self.map.get(&key) {
            let node = self.node_mut(idx);
            let old_size = node.entry.size;
            node.entry = CacheEntry::new(value, ttl, size, now);
            self.memory_bytes = self.memory_bytes.saturating_sub(old_size) + size;
            self.detach(idx);
            self.push_front(idx);
            self.record_mutation();
            return None;
        }

        let mut evicted = None;
        if self.map.len() >= self.config.max_size.max(1) {
            if let Some(tail) = self.tail {
                let node = self.remove_slot(tail);
                self.evictions += 1;
                trace!(entries = self.map.len(), "evicted least recently used entry");
                evicted = Some(node.key);
            }
        }

        let node = Node {
            key: key.clone(),
            entry: CacheEntry::new(value, ttl, size, now),
            prev: None,
            next: None,
        };
        self.slots.push(node);
        let idx = self.slots.len() - 1;
        self.map.insert(key, idx);
        self.push_front(idx);
        self.memory_bytes += size;
        self.record_mutation();

        evicted
    }

    /// Remove an entry
    pub fn delete(&mut self, key: &K) -> bool {
        match self.map.get(key) {
            Some(&idx) => {
                self.remove_slot(idx);
                self.record_mutation();
                true
            }
            None => false,
        }
    }

    /// Check for a live entry without promoting it
    pub fn has(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.head = None;
        self.tail = None;
        self.memory_bytes = 0;
        self.mutations = 0;
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    /// Drop every expired entry; returns the number removed
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .slots
            .iter()
            .filter(|node| node.entry.is_expired_at(now))
            .map(|node| node.key.clone())
            .collect();

        for key in &expired {
            if let Some(&idx) = self.map.get(key) {
                self.remove_slot(idx);
            }
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    /// Current statistics
    pub fn stats(&self) -> LruStats {
        let lookups = self.hits + self.misses;
        LruStats {
            entries: self.map.len(),
            max_size: self.config.max_size,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            memory_bytes: self.memory_bytes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
        }
    }

    // =========================================================================
    // List maintenance
    // =========================================================================

    #[inline]
    fn node(&self, idx: usize) -> &Node<K, V> {
        &self.slots[idx]
    }

    #[inline]
    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        &mut self.slots[idx]
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Node<K, V> {
        self.detach(idx);
        let node = self.slots.swap_remove(idx);
        self.map.remove(&node.key);
        self.memory_bytes = self.memory_bytes.saturating_sub(node.entry.size);

        // The former last node now lives at `idx`; repoint its neighbours
        if idx < self.slots.len() {
            let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
            match prev {
                Some(p) => self.slots[p].next = Some(idx),
                None => self.head = Some(idx),
            }
            match next {
                Some(n) => self.slots[n].prev = Some(idx),
                None => self.tail = Some(idx),
            }
            if let Some(slot) = self.map.get_mut(&self.slots[idx].key) {
                *slot = idx;
            }
        }
        node
    }

    fn weigh(&self, key: &K, value: &V) -> usize {
        match &self.weigher {
            Some(w) => w.weigh(key, value),
            None => std::mem::size_of::<K>() + std::mem::size_of::<V>(),
        }
    }

    fn record_mutation(&mut self) {
        self.mutations += 1;
        if self.config.reestimate_every > 0 && self.mutations % self.config.reestimate_every == 0 {
            self.reestimate();
        }
    }

    /// Recompute every entry size from scratch
    fn reestimate(&mut self) {
        let mut total = 0;
        for idx in 0..self.slots.len() {
            let size = self.weigh(&self.slots[idx].key, &self.slots[idx].entry.value);
            self.slots[idx].entry.size = size;
            total += size;
        }
        trace!(old = self.memory_bytes, new = total, "re-estimated cache memory");
        self.memory_bytes = total;
    }
}

impl<K, V> Default for LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically purge expired entries until `shutdown` is cancelled
pub fn spawn_sweeper<K, V>(
    cache: Arc<Mutex<LruCache<K, V>>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = cache.lock().purge_expired();
                    if purged > 0 {
                        debug!(purged, "swept expired cache entries");
                    }
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn cache(max_size: usize) -> LruCache<String, u32> {
        LruCache::with_config(LruConfig {
            max_size,
            default_ttl: None,
            reestimate_every: 4,
        })
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let mut c = cache(2);
        c.set("a".into(), 1, None);
        c.set("b".into(), 2, None);
        assert_eq!(c.get(&"a".into()), Some(1));

        let evicted = c.set("c".into(), 3, None);
        assert_eq!(evicted, Some("b".to_string()));
        assert!(c.has(&"a".into()));
        assert!(!c.has(&"b".into()));
        assert_eq!(c.keys(), vec!["c".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_overwrite_promotes_without_eviction() {
        let mut c = cache(2);
        c.set("a".into(), 1, None);
        c.set("b".into(), 2, None);
        assert_eq!(c.set("a".into(), 10, None), None);
        assert_eq!(c.len(), 2);
        assert_eq!(c.keys()[0], "a");
        assert_eq!(c.get(&"a".into()), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_get_is_a_miss() {
        let mut c = cache(10);
        c.set("k".into(), 1, Some(Duration::from_millis(50)));
        assert_eq!(c.get(&"k".into()), Some(1));

        tokio::time::advance(Duration::from_millis(51)).await;
        assert_eq!(c.get(&"k".into()), None);
        assert_eq!(c.len(), 0);

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let c = Arc::new(Mutex::new(cache(10)));
        c.lock().set("short".into(), 1, Some(Duration::from_millis(10)));
        c.lock().set("long".into(), 2, Some(Duration::from_secs(60)));

        let token = CancellationToken::new();
        let handle = spawn_sweeper(c.clone(), Duration::from_millis(100), token.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(c.lock().len(), 1);
        assert!(c.lock().has(&"long".into()));

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_delete_keeps_arena_dense() {
        let mut c = cache(3);
        c.set("a".into(), 1, None);
        c.set("b".into(), 2, None);
        c.set("c".into(), 3, None);
        assert!(c.delete(&"a".into()));
        assert!(!c.delete(&"a".into()));
        assert_eq!(c.slots.len(), 2);
        assert_eq!(c.keys(), vec!["c".to_string(), "b".to_string()]);
        assert_eq!(c.get(&"b".into()), Some(2));
        assert_eq!(c.keys(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_memory_tracking() {
        struct LenWeigher;
        impl Weigher<String, u32> for LenWeigher {
            fn weigh(&self, key: &String, _value: &u32) -> usize {
                key.len()
            }
        }

        let mut c = cache(10).with_weigher(Arc::new(LenWeigher));
        c.set("abc".into(), 1, None);
        c.set("de".into(), 2, None);
        assert_eq!(c.stats().memory_bytes, 5);
        c.delete(&"abc".into());
        assert_eq!(c.stats().memory_bytes, 2);
        c.clear();
        assert_eq!(c.stats().memory_bytes, 0);
        assert!(c.is_empty());
    }

    proptest! {
        #[test]
        fn prop_matches_reference_model(ops in prop::collection::vec((0u8..3, 0u8..8), 1..200)) {
            let mut c = cache(4);
            // Reference: front = most recently used
            let mut model: VecDeque<(String, u32)> = VecDeque::new();

            for (op, k) in ops {
                let key = format!("k{}", k);
                match op {
                    0 => {
                        c.set(key.clone(), k as u32, None);
                        model.retain(|(mk, _)| mk != &key);
                        model.push_front((key, k as u32));
                        model.truncate(4);
                    }
                    1 => {
                        let got = c.get(&key);
                        let pos = model.iter().position(|(mk, _)| mk == &key);
                        let expected = pos.map(|p| {
                            let item = model.remove(p).unwrap();
                            let v = item.1;
                            model.push_front(item);
                            v
                        });
                        prop_assert_eq!(got, expected);
                    }
                    _ => {
                        let removed = c.delete(&key);
                        let before = model.len();
                        model.retain(|(mk, _)| mk != &key);
                        prop_assert_eq!(removed, before != model.len());
                    }
                }
                prop_assert!(c.len() <= 4);
                let keys: Vec<String> = model.iter().map(|(k, _)| k.clone()).collect();
                prop_assert_eq!(c.keys(), keys);
            }
        }
    }
}
