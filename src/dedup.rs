//! Request Deduplicator
//!
//! Collapses identical concurrent calls into one underlying execution.
//!
//! The first caller for a key becomes the leader: its future is wrapped in a
//! [`Shared`] and registered. Callers arriving while it is in flight join the
//! shared future and observe the same value or the same error. The entry is
//! removed by the wrapped future itself when it settles, so a later call for
//! the same key starts a fresh execution.
//!
//! Entries older than `max_wait` are treated as stale: they are replaced on
//! the next call and removed by the periodic sweep.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;

/// Deduplicator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Maximum in-flight keys; the oldest is evicted beyond this
    pub max_pending: usize,
    /// Age after which an in-flight entry no longer accepts joiners
    pub max_wait_ms: u64,
    /// Stale-entry sweep period (0 disables the sweeper)
    pub sweep_interval_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pending: 1000,
            max_wait_ms: 30_000,
            sweep_interval_ms: 10_000,
        }
    }
}

/// Deduplicator statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub pending: usize,
    pub executed: u64,
    pub joined: u64,
    pub evicted: u64,
    pub stale_removed: u64,
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

struct PendingCall<T: Clone> {
    future: SharedResult<T>,
    created_at: Instant,
    ref_count: usize,
    generation: u64,
}

type PendingMap<T> = Arc<Mutex<HashMap<String, PendingCall<T>>>>;

/// In-flight call sharing keyed by fingerprint
pub struct Deduplicator<T: Clone> {
    config: DedupConfig,
    pending: PendingMap<T>,
    next_generation: AtomicU64,
    executed: AtomicU64,
    joined: AtomicU64,
    evicted: AtomicU64,
    stale_removed: Arc<AtomicU64>,
}

impl<T: Clone> std::fmt::Debug for Deduplicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("config", &self.config)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            executed: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            stale_removed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn max_wait(&self) -> Duration {
        Duration::from_millis(self.config.max_wait_ms)
    }

    /// Run `f` unless an identical call is already in flight
    pub async fn execute<F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.execute_joined(key, f).await.0
    }

    /// Like [`Self::execute`], also reporting whether this caller joined
    /// an existing call instead of starting one
    pub async fn execute_joined<F, Fut>(&self, key: &str, f: F) -> (Result<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.config.enabled {
            return (f().await, false);
        }

        if let Some(shared) = self.try_join(key) {
            return (shared.await, true);
        }

        // Build the future outside the lock, then re-check: another caller
        // may have registered in the meantime. Futures are lazy, so losing
        // the race never starts a second execution.
        let fut = f();
        let (shared, joined) = {
            let mut pending = self.pending.lock();
            match Self::live_entry(&mut pending, key, self.max_wait()) {
                Some(call) => {
                    call.ref_count += 1;
                    (call.future.clone(), true)
                }
                None => {
                    if pending.contains_key(key) {
                        pending.remove(key);
                        self.stale_removed.fetch_add(1, Ordering::Relaxed);
                    }
                    self.evict_if_full(&mut pending);

                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let shared = self.wrap(key, generation, fut);
                    pending.insert(
                        key.to_string(),
                        PendingCall {
                            future: shared.clone(),
                            created_at: Instant::now(),
                            ref_count: 1,
                            generation,
                        },
                    );
                    self.executed.fetch_add(1, Ordering::Relaxed);
                    (shared, false)
                }
            }
        };

        if joined {
            self.joined.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Joined in-flight call");
        }
        (shared.await, joined)
    }

    fn try_join(&self, key: &str) -> Option<SharedResult<T>> {
        let mut pending = self.pending.lock();
        let call = Self::live_entry(&mut pending, key, self.max_wait())?;
        call.ref_count += 1;
        let shared = call.future.clone();
        drop(pending);

        self.joined.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "Joined in-flight call");
        Some(shared)
    }

    fn live_entry<'a>(
        pending: &'a mut HashMap<String, PendingCall<T>>,
        key: &str,
        max_wait: Duration,
    ) -> Option<&'a mut PendingCall<T>> {
        pending
            .get_mut(key)
            .filter(|call| call.created_at.elapsed() < max_wait)
    }

    fn evict_if_full(&self, pending: &mut HashMap<String, PendingCall<T>>) {
        while !pending.is_empty() && pending.len() >= self.config.max_pending.max(1) {
            let oldest = pending
                .iter()
                .min_by_key(|(_, call)| call.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    pending.remove(&k);
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %k, "Evicted oldest in-flight call");
                }
                None => break,
            }
        }
    }

    /// Wrap `fut` so it removes its own entry when it settles
    fn wrap<Fut>(&self, key: &str, generation: u64, fut: Fut) -> SharedResult<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let pending = self.pending.clone();
        let key = key.to_string();
        async move {
            let result = fut.await;
            let mut map = pending.lock();
            if map.get(&key).is_some_and(|c| c.generation == generation) {
                map.remove(&key);
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Remove entries older than `max_wait`; returns the number removed
    pub fn sweep_stale(&self) -> usize {
        sweep(&self.pending, self.max_wait(), &self.stale_removed)
    }

    /// Start the periodic stale sweep, if configured
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.sweep_interval_ms == 0 || !self.config.enabled {
            return None;
        }
        let pending = self.pending.clone();
        let stale_removed = self.stale_removed.clone();
        let max_wait = self.max_wait();
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = sweep(&pending, max_wait, &stale_removed);
                        if removed > 0 {
                            debug!(removed, "Swept stale in-flight calls");
                        }
                    }
                }
            }
        }))
    }

    /// Check if a call for `key` is in flight
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Callers sharing the in-flight call for `key`
    pub fn ref_count(&self, key: &str) -> usize {
        self.pending.lock().get(key).map_or(0, |c| c.ref_count)
    }

    /// Forget every in-flight entry; callers already waiting still settle
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            pending: self.pending.lock().len(),
            executed: self.executed.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            stale_removed: self.stale_removed.load(Ordering::Relaxed),
        }
    }
}

fn sweep<T: Clone>(pending: &PendingMap<T>, max_wait: Duration, counter: &AtomicU64) -> usize {
    let mut map = pending.lock();
    let before = map.len();
    map.retain(|_, call| call.created_at.elapsed() < max_wait);
    let removed = before - map.len();
    counter.fetch_add(removed as u64, Ordering::Relaxed);
    removed
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn dedup() -> Arc<Deduplicator<u32>> {
        Arc::new(Deduplicator::new(DedupConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let dedup = dedup.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    dedup
                        .execute("k", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(42)
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = dedup.stats();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.joined, 9);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_shared_too() {
        let dedup = dedup();
        let a = dedup.execute("k", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(Error::http(503, "down"))
        });
        let b = dedup.execute("k", || async { Ok(1) });

        let (a, b) = tokio::join!(a, b);
        assert_matches!(a, Err(Error::Http { status: 503, .. }));
        assert_matches!(b, Err(Error::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_entry_removed_after_settle() {
        let dedup = dedup();
        assert_eq!(dedup.execute("k", || async { Ok(1) }).await.unwrap(), 1);
        assert!(!dedup.is_pending("k"));
        // A fresh call runs again
        assert_eq!(dedup.execute("k", || async { Ok(2) }).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_are_replaced_and_swept() {
        let dedup = Arc::new(Deduplicator::new(DedupConfig {
            max_wait_ms: 100,
            ..Default::default()
        }));

        let slow = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute("k", || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(dedup.is_pending("k"));

        // Past max_wait the stale entry no longer accepts joiners
        let fresh = dedup.execute("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(fresh, 2);
        assert_eq!(dedup.stats().stale_removed, 1);

        slow.abort();
        assert_eq!(dedup.sweep_stale(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let dedup = Arc::new(Deduplicator::new(DedupConfig {
            max_pending: 2,
            ..Default::default()
        }));
        let mut handles = Vec::new();
        for key in ["a", "b", "c"] {
            let dedup = dedup.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .execute(key, || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(0)
                    })
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(!dedup.is_pending("a"));
        assert!(dedup.is_pending("b"));
        assert!(dedup.is_pending("c"));
        assert_eq!(dedup.stats().evicted, 1);

        // Evicted callers still get their result
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_disabled_runs_every_call() {
        let dedup: Deduplicator<u32> = Deduplicator::new(DedupConfig {
            enabled: false,
            ..Default::default()
        });
        let (_, joined) = dedup.execute_joined("k", || async { Ok(1) }).await;
        assert!(!joined);
        assert_eq!(dedup.stats().executed, 0);
    }
}
