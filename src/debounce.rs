//! Debounce Engine
//!
//! Collapses bursts of calls per key so only the last one runs.
//!
//! Every call installs a slot holding the sending half of a control channel
//! and spawns a timer task that waits for either the delay to elapse or a
//! control message. A newer call for the same key replaces the slot, which
//! drops the older sender: the older timer task exits without running and
//! its caller is abandoned (its future never settles).
//!
//! ```text
//! t=0   call A ──► slot A, timer A
//! t=30  call B ──► slot B, timer A exits, A abandoned
//! t=60  call C ──► slot C, timer B exits, B abandoned
//! t=160 timer C fires ──► run C, settle C
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Debounce configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub enabled: bool,
    /// Delay applied to methods that opt in without their own value
    pub default_delay_ms: u64,
    /// Maximum concurrent slots; the oldest is flushed beyond this
    pub max_pending: usize,
    /// Slots older than this are rejected with `DebounceTimeout`
    pub max_age_ms: u64,
    /// Sweep period for aged slots (0 disables the sweeper)
    pub sweep_interval_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_delay_ms: 300,
            max_pending: 1000,
            max_age_ms: 60_000,
            sweep_interval_ms: 10_000,
        }
    }
}

/// Debounce statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebounceStats {
    pub pending: usize,
    pub scheduled: u64,
    pub executed: u64,
    pub superseded: u64,
    pub flushed: u64,
    pub rejected: u64,
}

enum Control {
    Flush,
    Reject(Error),
}

struct Slot {
    id: u64,
    control: oneshot::Sender<Control>,
    created_at: Instant,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    executed: AtomicU64,
    superseded: AtomicU64,
    flushed: AtomicU64,
    rejected: AtomicU64,
}

type SlotMap = Arc<Mutex<HashMap<String, Slot>>>;

/// Per-key delayed execution
pub struct Debouncer {
    config: DebounceConfig,
    slots: SlotMap,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("config", &self.config)
            .field("pending", &self.slots.lock().len())
            .finish()
    }
}

impl Debouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Configured default delay
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.config.default_delay_ms)
    }

    /// Run `f` after `delay` unless another call for `key` arrives first.
    ///
    /// A zero delay still defers to a spawned task. Superseded callers
    /// never resolve.
    pub async fn execute<T, F, Fut>(&self, key: &str, delay: Duration, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.try_execute(key, delay, f).await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    /// Like [`Self::execute`], but resolves to `None` once a newer call for
    /// `key` supersedes this one
    pub async fn try_execute<T, F, Fut>(&self, key: &str, delay: Duration, f: F) -> Option<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.destroyed.load(Ordering::Acquire) {
            return Some(Err(Error::EngineDestroyed));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel::<Result<T>>();

        {
            let mut slots = self.slots.lock();
            if !slots.contains_key(key) && slots.len() >= self.config.max_pending.max(1) {
                flush_oldest(&mut slots, &self.counters);
            }
            let previous = slots.insert(
                key.to_string(),
                Slot {
                    id,
                    control: control_tx,
                    created_at: Instant::now(),
                },
            );
            if previous.is_some() {
                self.counters.superseded.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Superseded debounced call");
            }
        }
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);

        let slots = self.slots.clone();
        let counters = self.counters.clone();
        let key_owned = key.to_string();
        tokio::spawn(async move {
            let flushed = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                msg = control_rx => match msg {
                    Ok(Control::Flush) => true,
                    Ok(Control::Reject(e)) => {
                        let _ = result_tx.send(Err(e));
                        return;
                    }
                    // Sender dropped: superseded by a newer call
                    Err(_) => return,
                },
            };

            if !flushed {
                let mut slots = slots.lock();
                match slots.get(&key_owned) {
                    Some(slot) if slot.id == id => {
                        slots.remove(&key_owned);
                    }
                    _ => return,
                }
            }

            counters.executed.fetch_add(1, Ordering::Relaxed);
            let result = f().await;
            let _ = result_tx.send(result);
        });

        result_rx.await.ok()
    }

    /// Run the pending call for `key` now
    pub fn flush(&self, key: &str) -> bool {
        let slot = self.slots.lock().remove(key);
        match slot {
            Some(slot) => {
                self.counters.flushed.fetch_add(1, Ordering::Relaxed);
                slot.control.send(Control::Flush).is_ok()
            }
            None => false,
        }
    }

    /// Drop the pending call for `key`, rejecting its caller with `Cancelled`
    pub fn cancel(&self, key: &str) -> bool {
        let slot = self.slots.lock().remove(key);
        match slot {
            Some(slot) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let _ = slot
                    .control
                    .send(Control::Reject(Error::Cancelled(format!("debounce {} cancelled", key))));
                true
            }
            None => false,
        }
    }

    /// Number of keys with a pending call
    pub fn pending_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Reject slots older than `max_age` with `DebounceTimeout`
    pub fn sweep_expired(&self) -> usize {
        sweep(
            &self.slots,
            Duration::from_millis(self.config.max_age_ms),
            &self.counters,
        )
    }

    /// Start the periodic aged-slot sweep, if configured
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.sweep_interval_ms == 0 || !self.config.enabled {
            return None;
        }
        let slots = self.slots.clone();
        let counters = self.counters.clone();
        let max_age = Duration::from_millis(self.config.max_age_ms);
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = sweep(&slots, max_age, &counters);
                        if expired > 0 {
                            debug!(expired, "Rejected aged debounced calls");
                        }
                    }
                }
            }
        }))
    }

    /// Reject every pending call with `EngineDestroyed` and refuse new ones
    pub fn destroy(&self) -> usize {
        self.destroyed.store(true, Ordering::Release);
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for slot in drained {
            let _ = slot.control.send(Control::Reject(Error::EngineDestroyed));
        }
        self.counters
            .rejected
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> DebounceStats {
        DebounceStats {
            pending: self.slots.lock().len(),
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            superseded: self.counters.superseded.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

fn flush_oldest(slots: &mut HashMap<String, Slot>, counters: &Counters) {
    let oldest = slots
        .iter()
        .min_by_key(|(_, slot)| slot.created_at)
        .map(|(k, _)| k.clone());
    if let Some(slot) = oldest.and_then(|k| slots.remove(&k)) {
        counters.flushed.fetch_add(1, Ordering::Relaxed);
        let _ = slot.control.send(Control::Flush);
    }
}

fn sweep(slots: &SlotMap, max_age: Duration, counters: &Counters) -> usize {
    let expired: Vec<(String, Slot)> = {
        let mut map = slots.lock();
        let keys: Vec<String> = map
            .iter()
            .filter(|(_, slot)| slot.created_at.elapsed() >= max_age)
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| map.remove(&k).map(|slot| (k, slot)))
            .collect()
    };

    let count = expired.len();
    for (key, slot) in expired {
        let _ = slot.control.send(Control::Reject(Error::DebounceTimeout { key }));
    }
    counters.rejected.fetch_add(count as u64, Ordering::Relaxed);
    count
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_pending, assert_ready, task};

    fn debouncer() -> Arc<Debouncer> {
        Arc::new(Debouncer::new(DebounceConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_only_last_call() {
        let debouncer = debouncer();
        let start = Instant::now();
        let runs = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (at, arg) in [(0u64, "a"), (30, "b"), (60, "c")] {
            tokio::time::sleep_until(start + Duration::from_millis(at)).await;
            let debouncer = debouncer.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                debouncer
                    .execute("search", Duration::from_millis(100), move || async move {
                        runs.lock().push((arg, start.elapsed()));
                        Ok(arg)
                    })
                    .await
            }));
        }

        let last = handles.pop().unwrap();
        assert_eq!(last.await.unwrap().unwrap(), "c");

        let runs = runs.lock().clone();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, "c");
        assert_eq!(runs[0].1, Duration::from_millis(160));

        // Earlier callers are abandoned, not rejected
        tokio::time::sleep(Duration::from_secs(5)).await;
        for handle in handles {
            assert!(!handle.is_finished());
            handle.abort();
        }
        assert_eq!(debouncer.stats().superseded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_execute_reports_superseded_call() {
        let debouncer = debouncer();
        let d = debouncer.clone();
        let older = tokio::spawn(async move {
            d.try_execute("k", Duration::from_millis(100), || async { Ok("old") })
                .await
        });
        tokio::task::yield_now().await;

        let newer = debouncer
            .try_execute("k", Duration::from_millis(100), || async { Ok("new") })
            .await;

        assert_matches!(newer, Some(Ok("new")));
        assert_matches!(older.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_is_never_synchronous() {
        let debouncer = debouncer();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();

        let mut fut = task::spawn(debouncer.execute("k", Duration::ZERO, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }));
        assert_pending!(fut.poll());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let out = assert_ready!(fut.poll());
        assert_eq!(out.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_immediately() {
        let debouncer = debouncer();
        let start = Instant::now();
        let d = debouncer.clone();
        let handle = tokio::spawn(async move {
            d.execute("k", Duration::from_secs(10), || async { Ok(7) }).await
        });
        tokio::task::yield_now().await;

        assert!(debouncer.flush("k"));
        assert_eq!(handle.await.unwrap().unwrap(), 7);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!debouncer.flush("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_caller() {
        let debouncer = debouncer();
        let d = debouncer.clone();
        let handle = tokio::spawn(async move {
            d.execute("k", Duration::from_secs(1), || async { Ok(1) }).await
        });
        tokio::task::yield_now().await;

        assert!(debouncer.cancel("k"));
        assert_matches!(handle.await.unwrap(), Err(Error::Cancelled(_)));
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_rejects_aged_slots() {
        let debouncer = Arc::new(Debouncer::new(DebounceConfig {
            max_age_ms: 1_000,
            ..Default::default()
        }));
        let d = debouncer.clone();
        let handle = tokio::spawn(async move {
            d.execute("slow", Duration::from_secs(60), || async { Ok(1) }).await
        });
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(debouncer.sweep_expired(), 1);
        assert_matches!(handle.await.unwrap(), Err(Error::DebounceTimeout { key }) if key == "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_rejects_all_and_refuses_new_calls() {
        let debouncer = debouncer();
        let mut handles = Vec::new();
        for key in ["a", "b"] {
            let d = debouncer.clone();
            handles.push(tokio::spawn(async move {
                d.execute(key, Duration::from_secs(1), || async { Ok(1) }).await
            }));
        }
        tokio::task::yield_now().await;

        assert_eq!(debouncer.destroy(), 2);
        for handle in handles {
            assert_matches!(handle.await.unwrap(), Err(Error::EngineDestroyed));
        }
        let late = debouncer
            .execute("c", Duration::ZERO, || async { Ok(1) })
            .await;
        assert_matches!(late, Err(Error::EngineDestroyed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_flushes_oldest() {
        let debouncer = Arc::new(Debouncer::new(DebounceConfig {
            max_pending: 1,
            ..Default::default()
        }));
        let d = debouncer.clone();
        let first = tokio::spawn(async move {
            d.execute("a", Duration::from_secs(60), || async { Ok("a") }).await
        });
        tokio::task::yield_now().await;

        let d = debouncer.clone();
        let second = tokio::spawn(async move {
            d.execute("b", Duration::from_millis(10), || async { Ok("b") }).await
        });

        assert_eq!(first.await.unwrap().unwrap(), "a");
        assert_eq!(second.await.unwrap().unwrap(), "b");
        assert_eq!(debouncer.stats().flushed, 1);
    }
}
