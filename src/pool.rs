//! Tiered Object Pool
//!
//! Reuses short-lived objects (call contexts) instead of reallocating them.
//!
//! # Design
//!
//! - Two free lists: a small *hot* tier checked first and a larger *cold* tier
//! - Released objects are `reset` and re-`validate`d before being pooled
//! - Objects that fail validation are dropped and never handed out again
//! - [`TieredPool::adapt`] shifts capacity towards whichever tier is serving
//!   acquisitions, never exceeding `max_total`

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Hooks an object must provide to be pooled
pub trait Poolable: Send {
    /// Clear per-use state before the object goes back to the pool
    fn reset(&mut self);

    /// Whether the object is still fit for reuse
    fn validate(&self) -> bool {
        true
    }
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub hot_capacity: usize,
    pub cold_capacity: usize,
    /// Upper bound on `hot_capacity + cold_capacity` after adaptation
    pub max_total: usize,
    /// Hot-hit ratio above which `adapt` grows the hot tier
    pub hot_ratio_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 16,
            cold_capacity: 64,
            max_total: 256,
            hot_ratio_threshold: 0.5,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub acquired: u64,
    pub hot_hits: u64,
    pub cold_hits: u64,
    pub misses: u64,
    pub released: u64,
    pub discarded: u64,
    pub invalid: u64,
    pub hot_len: usize,
    pub cold_len: usize,
    pub hot_capacity: usize,
    pub cold_capacity: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    hot_hits: u64,
    cold_hits: u64,
    misses: u64,
}

struct PoolInner<T> {
    hot: Vec<T>,
    cold: Vec<T>,
    hot_capacity: usize,
    cold_capacity: usize,
    stats: PoolStats,
    window: Window,
}

/// Hot/cold tiered pool
pub struct TieredPool<T> {
    factory: Box<dyn Fn() -> T + Send + Sync>,
    config: PoolConfig,
    inner: Mutex<PoolInner<T>>,
}

impl<T> std::fmt::Debug for TieredPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredPool")
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Poolable> TieredPool<T> {
    /// Create a pool that builds new objects with `factory`
    pub fn new(config: PoolConfig, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let inner = PoolInner {
            hot: Vec::with_capacity(config.hot_capacity),
            cold: Vec::new(),
            hot_capacity: config.hot_capacity,
            cold_capacity: config.cold_capacity,
            stats: PoolStats::default(),
            window: Window::default(),
        };
        Self {
            factory: Box::new(factory),
            config,
            inner: Mutex::new(inner),
        }
    }

    /// Take an object: hot tier, then cold tier, then the factory
    pub fn acquire(&self) -> T {
        {
            let mut inner = self.inner.lock();
            inner.stats.acquired += 1;

            while let Some(obj) = inner.hot.pop() {
                if obj.validate() {
                    inner.stats.hot_hits += 1;
                    inner.window.hot_hits += 1;
                    return obj;
                }
                inner.stats.invalid += 1;
            }
            while let Some(obj) = inner.cold.pop() {
                if obj.validate() {
                    inner.stats.cold_hits += 1;
                    inner.window.cold_hits += 1;
                    return obj;
                }
                inner.stats.invalid += 1;
            }

            inner.stats.misses += 1;
            inner.stats.created += 1;
            inner.window.misses += 1;
        }
        (self.factory)()
    }

    /// Return an object to the pool
    pub fn release(&self, mut obj: T) {
        obj.reset();
        let mut inner = self.inner.lock();
        inner.stats.released += 1;

        if !obj.validate() {
            inner.stats.invalid += 1;
            return;
        }
        if inner.hot.len() < inner.hot_capacity {
            inner.hot.push(obj);
        } else if inner.cold.len() < inner.cold_capacity {
            inner.cold.push(obj);
        } else {
            inner.stats.discarded += 1;
        }
    }

    /// Take `n` objects
    pub fn acquire_batch(&self, n: usize) -> Vec<T> {
        (0..n).map(|_| self.acquire()).collect()
    }

    /// Return several objects
    pub fn release_batch(&self, objs: impl IntoIterator<Item = T>) {
        for obj in objs {
            self.release(obj);
        }
    }

    /// Rebalance tier capacities from the acquisitions seen since the last call.
    ///
    /// Returns the new `(hot_capacity, cold_capacity)`.
    pub fn adapt(&self) -> (usize, usize) {
        let mut inner = self.inner.lock();
        let window = std::mem::take(&mut inner.window);
        let total = window.hot_hits + window.cold_hits + window.misses;
        if total == 0 {
            return (inner.hot_capacity, inner.cold_capacity);
        }

        let hot_ratio = window.hot_hits as f64 / total as f64;
        let grow_hot = hot_ratio >= self.config.hot_ratio_threshold;
        let (grow, other) = if grow_hot {
            (inner.hot_capacity, inner.cold_capacity)
        } else {
            (inner.cold_capacity, inner.hot_capacity)
        };

        let step = (grow / 4).max(1);
        let headroom = self.config.max_total.saturating_sub(grow + other);
        let (new_grow, new_other) = if headroom > 0 {
            (grow + step.min(headroom), other)
        } else {
            // At the ceiling: borrow capacity from the other tier, keeping it non-empty
            let shift = step.min(other.saturating_sub(1));
            (grow + shift, other - shift)
        };

        if grow_hot {
            inner.hot_capacity = new_grow;
            inner.cold_capacity = new_other;
        } else {
            inner.cold_capacity = new_grow;
            inner.hot_capacity = new_other;
        }
        let (hot_cap, cold_cap) = (inner.hot_capacity, inner.cold_capacity);
        inner.hot.truncate(hot_cap);
        inner.cold.truncate(cold_cap);

        debug!(hot_ratio, hot_cap, cold_cap, "Adapted pool tiers");
        (hot_cap, cold_cap)
    }

    /// Number of objects currently pooled
    pub fn pooled(&self) -> usize {
        let inner = self.inner.lock();
        inner.hot.len() + inner.cold.len()
    }

    /// Drop every pooled object
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.hot.clear();
        inner.cold.clear();
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            hot_len: inner.hot.len(),
            cold_len: inner.cold.len(),
            hot_capacity: inner.hot_capacity,
            cold_capacity: inner.cold_capacity,
            ..inner.stats.clone()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Buffer {
        id: u32,
        data: Vec<u8>,
        broken: bool,
    }

    impl Poolable for Buffer {
        fn reset(&mut self) {
            self.data.clear();
        }

        fn validate(&self) -> bool {
            !self.broken
        }
    }

    fn pool(hot: usize, cold: usize, max_total: usize) -> (TieredPool<Buffer>, Arc<AtomicU32>) {
        let next = Arc::new(AtomicU32::new(0));
        let counter = next.clone();
        let pool = TieredPool::new(
            PoolConfig {
                hot_capacity: hot,
                cold_capacity: cold,
                max_total,
                ..Default::default()
            },
            move || Buffer {
                id: counter.fetch_add(1, Ordering::SeqCst),
                data: Vec::new(),
                broken: false,
            },
        );
        (pool, next)
    }

    #[test]
    fn test_release_resets_and_reuses() {
        let (pool, created) = pool(2, 2, 8);
        let mut buf = pool.acquire();
        buf.data.extend_from_slice(b"hello");
        let id = buf.id;
        pool.release(buf);

        let again = pool.acquire();
        assert_eq!(again.id, id);
        assert!(again.data.is_empty());
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().hot_hits, 1);
    }

    #[test]
    fn test_overflow_goes_cold_then_dropped() {
        let (pool, _) = pool(1, 1, 8);
        let items = pool.acquire_batch(3);
        pool.release_batch(items);

        let stats = pool.stats();
        assert_eq!(stats.hot_len, 1);
        assert_eq!(stats.cold_len, 1);
        assert_eq!(stats.discarded, 1);
        assert!(pool.pooled() <= stats.hot_capacity + stats.cold_capacity);
    }

    #[test]
    fn test_invalid_object_never_handed_out() {
        let (pool, created) = pool(4, 4, 8);
        let mut buf = pool.acquire();
        buf.broken = true;
        pool.release(buf);
        assert_eq!(pool.pooled(), 0);

        let fresh = pool.acquire();
        assert!(!fresh.broken);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().invalid, 1);
    }

    #[test]
    fn test_adapt_grows_hot_tier_on_hot_hits() {
        let (pool, _) = pool(4, 4, 10);
        for _ in 0..10 {
            let b = pool.acquire();
            pool.release(b);
        }
        // 1 miss then 9 hot hits
        assert_eq!(pool.adapt(), (5, 4));
        // Without new traffic nothing changes
        assert_eq!(pool.adapt(), (5, 4));
    }

    #[test]
    fn test_adapt_respects_max_total() {
        let (pool, _) = pool(4, 4, 8);
        let b = pool.acquire();
        pool.release(b);
        for _ in 0..4 {
            let b = pool.acquire();
            pool.release(b);
        }
        let (hot, cold) = pool.adapt();
        assert_eq!(hot + cold, 8);
        assert_eq!((hot, cold), (5, 3));
    }

    #[test]
    fn test_adapt_grows_cold_on_misses() {
        let (pool, _) = pool(2, 2, 16);
        let _held = pool.acquire_batch(4);
        assert_eq!(pool.adapt(), (2, 3));
    }

    #[test]
    fn test_clear() {
        let (pool, _) = pool(2, 2, 8);
        let items = pool.acquire_batch(3);
        pool.release_batch(items);
        pool.clear();
        assert_eq!(pool.pooled(), 0);
    }
}
