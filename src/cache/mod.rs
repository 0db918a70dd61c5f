//! Response Cache
//!
//! - [`lru`] - O(1) LRU with TTL, backing store for everything else
//! - [`entry`] - entry metadata and size estimation
//! - [`manager`] - per-method keys, memory / persistent modes

pub mod entry;
pub mod lru;
pub mod manager;

pub use entry::{CacheEntry, JsonWeigher, Weigher};
pub use lru::{LruCache, LruConfig, LruStats};
pub use manager::{cache_key, CacheConfig, CacheManager, CacheMode, CacheStats};
