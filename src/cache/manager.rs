//! Cache Manager
//!
//! Per-method response cache sitting in front of the transport.
//!
//! Keys have the form `{method}::{fingerprint}`. In [`CacheMode::Memory`]
//! entries live only in the LRU; in [`CacheMode::Persistent`] every write is
//! mirrored into a [`Storage`] backend and memory misses fall back to it.
//! Storage failures never fail a call: they count as a miss and are logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::entry::JsonWeigher;
use super::lru::{self, LruCache, LruConfig, LruStats};
use crate::domain::ports::Storage;

/// Where cached responses are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Memory,
    Persistent,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub mode: CacheMode,
    /// Maximum in-memory entries
    pub max_size: usize,
    /// TTL for entries written without an explicit one
    pub default_ttl_ms: u64,
    /// Expired-entry sweep period (0 disables the sweeper)
    pub sweep_interval_ms: u64,
    /// Prefix for keys written to persistent storage
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CacheMode::Memory,
            max_size: 1000,
            default_ttl_ms: 300_000,
            sweep_interval_ms: 60_000,
            key_prefix: "callgate:".to_string(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub mode: CacheMode,
    pub hits: u64,
    pub misses: u64,
    pub storage_hits: u64,
    pub storage_errors: u64,
    pub hit_rate: f64,
    pub memory: LruStats,
}

/// What a persistent entry looks like on disk
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    /// Unix epoch millis (`None` = no expiry)
    expires_at_ms: Option<i64>,
}

/// Build the cache key for a method and a parameter fingerprint
pub fn cache_key(method: &str, fingerprint: &str) -> String {
    format!("{}::{}", method, fingerprint)
}

/// Response cache with optional persistent backing
pub struct CacheManager {
    config: CacheConfig,
    memory: Arc<Mutex<LruCache<String, Value>>>,
    storage: Option<Arc<dyn Storage>>,
    hits: AtomicU64,
    misses: AtomicU64,
    storage_hits: AtomicU64,
    storage_errors: AtomicU64,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

impl CacheManager {
    /// Create a memory-only cache manager
    pub fn new(config: CacheConfig) -> Self {
        let lru = LruCache::with_config(LruConfig {
            max_size: config.max_size,
            default_ttl: ttl_from_ms(config.default_ttl_ms),
            ..Default::default()
        })
        .with_weigher(Arc::new(JsonWeigher));

        Self {
            config,
            memory: Arc::new(Mutex::new(lru)),
            storage: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            storage_hits: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
        }
    }

    /// Attach a storage backend used when the mode is [`CacheMode::Persistent`]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Check if caching is enabled globally
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Default TTL for entries
    pub fn default_ttl(&self) -> Option<Duration> {
        ttl_from_ms(self.config.default_ttl_ms)
    }

    fn persistent(&self) -> Option<&Arc<dyn Storage>> {
        match self.config.mode {
            CacheMode::Persistent => self.storage.as_ref(),
            CacheMode::Memory => None,
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Look up a cached response
    pub async fn get(&self, key: &str) -> Option<Value> {
        let key = key.to_string();
        let cached = self.memory.lock().get(&key);
        if let Some(value) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(storage) = self.persistent() {
            if let Some(value) = self.load_from_storage(storage, &key).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.storage_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn load_from_storage(&self, storage: &Arc<dyn Storage>, key: &str) -> Option<Value> {
        let skey = self.storage_key(key);
        let raw = match storage.get(&skey).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.storage_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache storage read failed");
                return None;
            }
        };

        let stored: StoredEntry = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding corrupt cache entry");
                self.remove_from_storage(storage, &skey).await;
                return None;
            }
        };

        let remaining = match stored.expires_at_ms {
            Some(at) => {
                let left = at - chrono::Utc::now().timestamp_millis();
                if left <= 0 {
                    self.remove_from_storage(storage, &skey).await;
                    return None;
                }
                Some(Duration::from_millis(left as u64))
            }
            None => None,
        };

        // Promote into memory for subsequent reads
        self.memory
            .lock()
            .insert(key.to_string(), stored.value.clone(), remaining);
        debug!(key = %key, "Promoted cache entry from storage");
        Some(stored.value)
    }

    /// Store a response
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.or_else(|| self.default_ttl());
        self.memory.lock().set(key.to_string(), value.clone(), ttl);

        if let Some(storage) = self.persistent() {
            let stored = StoredEntry {
                value,
                expires_at_ms: ttl.map(|t| {
                    let ttl_ms = t.as_millis().min(i64::MAX as u128) as i64;
                    chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms)
                }),
            };
            let raw = match serde_json::to_string(&stored) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key = %key, error = %e, "Cache entry not serializable");
                    return;
                }
            };
            if let Err(e) = storage.set(&self.storage_key(key), raw).await {
                self.storage_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache storage write failed");
            }
        }
    }

    /// Remove one cached response
    pub async fn invalidate(&self, key: &str) -> bool {
        let removed = self.memory.lock().delete(&key.to_string());
        if let Some(storage) = self.persistent() {
            self.remove_from_storage(storage, &self.storage_key(key)).await;
        }
        removed
    }

    /// Remove every cached response of `method`; returns the memory entries dropped
    pub async fn clear_method(&self, method: &str) -> usize {
        let prefix = cache_key(method, "");
        let removed = {
            let mut memory = self.memory.lock();
            let keys: Vec<String> = memory
                .keys()
                .into_iter()
                .filter(|k| k.starts_with(&prefix))
                .collect();
            for key in &keys {
                memory.delete(key);
            }
            keys.len()
        };

        if let Some(storage) = self.persistent() {
            let storage_prefix = self.storage_key(&prefix);
            match storage.keys().await {
                Ok(keys) => {
                    for key in keys.iter().filter(|k| k.starts_with(&storage_prefix)) {
                        self.remove_from_storage(storage, key).await;
                    }
                }
                Err(e) => {
                    self.storage_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(method = %method, error = %e, "Cache storage listing failed");
                }
            }
        }

        debug!(method = %method, removed, "Cleared method cache");
        removed
    }

    /// Remove everything
    pub async fn clear(&self) {
        self.memory.lock().clear();
        if let Some(storage) = self.persistent() {
            if let Err(e) = storage.clear().await {
                self.storage_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Cache storage clear failed");
            }
        }
    }

    /// Drop expired in-memory entries
    pub fn purge_expired(&self) -> usize {
        self.memory.lock().purge_expired()
    }

    /// Start the periodic expiry sweep, if configured
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.sweep_interval_ms == 0 {
            return None;
        }
        Some(lru::spawn_sweeper(
            self.memory.clone(),
            Duration::from_millis(self.config.sweep_interval_ms),
            shutdown,
        ))
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            mode: self.config.mode,
            hits,
            misses,
            storage_hits: self.storage_hits.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            memory: self.memory.lock().stats(),
        }
    }

    async fn remove_from_storage(&self, storage: &Arc<dyn Storage>, storage_key: &str) {
        if let Err(e) = storage.remove(storage_key).await {
            self.storage_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %storage_key, error = %e, "Cache storage remove failed");
        }
    }
}

fn ttl_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// =============================================================================
// Tests
// =============================================================================
