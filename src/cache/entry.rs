//! Cache Entry Types

use std::time::Duration;

use tokio::time::Instant;

/// Shortest TTL an entry may carry, keeps `expires_at > created_at`
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// A cached value with its lifecycle metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Cached value
    pub value: V,
    /// Insertion time
    pub created_at: Instant,
    /// Expiration time (`None` = no expiry)
    pub expires_at: Option<Instant>,
    /// Last read or write
    pub last_accessed_at: Instant,
    /// Number of reads served
    pub access_count: u64,
    /// Estimated size in bytes
    pub size: usize,
}

impl<V> CacheEntry<V> {
    /// Create a new entry stamped at `now`
    pub fn new(value: V, ttl: Option<Duration>, size: usize, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl.max(MIN_TTL))),
            last_accessed_at: now,
            access_count: 0,
            size,
        }
    }

    /// Check if the entry is logically absent at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Remaining lifetime, `None` if the entry never expires
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Record a read
    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }
}

/// Estimates the in-memory footprint of cached values
pub trait Weigher<K, V>: Send + Sync {
    /// Approximate size of one entry in bytes
    fn weigh(&self, key: &K, value: &V) -> usize;
}

/// Weigher that counts the serialized JSON length of the value plus the key length
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWeigher;

impl Weigher<String, serde_json::Value> for JsonWeigher {
    fn weigh(&self, key: &String, value: &serde_json::Value) -> usize {
        key.len() + serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry() {
        let now = Instant::now();
        let entry = CacheEntry::new(1u32, Some(Duration::from_millis(100)), 4, now);
        assert!(entry.expires_at.unwrap() > entry.created_at);
        assert!(!entry.is_expired_at(now + Duration::from_millis(100)));
        assert!(entry.is_expired_at(now + Duration::from_millis(101)));
    }

    #[test]
    fn test_zero_ttl_is_clamped() {
        let now = Instant::now();
        let entry = CacheEntry::new("v", Some(Duration::ZERO), 1, now);
        assert!(entry.expires_at.unwrap() > entry.created_at);
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let now = Instant::now();
        let mut entry = CacheEntry::new("v", None, 1, now);
        assert!(!entry.is_expired_at(now + Duration::from_secs(86_400)));
        assert_eq!(entry.remaining_ttl(now), None);
        entry.touch(now);
        assert_eq!(entry.access_count, 1);
    }
}
