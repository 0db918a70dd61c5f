//! Token-Bucket Throttler
//!
//! Rate limits outgoing attempts with a token bucket: `max_burst` tokens,
//! refilled continuously at `requests_per_second`.
//!
//! Callers that find the bucket empty join a FIFO wait list. A driver task
//! runs only while the list is non-empty: it sleeps until the next token is
//! due and releases waiters in arrival order. Over any window the number of
//! grants stays within `max_burst + requests_per_second * window`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
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

/// Slack for floating-point refill arithmetic
const TOKEN_EPSILON: f64 = 1e-9;

/// Longest the driver sleeps before re-checking the bucket
const MAX_TOKEN_WAIT: Duration = Duration::from_secs(1);

/// Throttle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Sustained rate
    pub requests_per_second: f64,
    /// Bucket size (maximum burst)
    pub max_burst: u32,
    /// Waiters older than this are rejected by the sweeper
    pub stale_timeout_ms: u64,
    /// Stale-waiter sweep period (0 disables the sweeper)
    pub sweep_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 10.0,
            max_burst: 20,
            stale_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl ThrottleConfig {
    /// Enabled throttle with the given rate and burst
    pub fn new(requests_per_second: f64, max_burst: u32) -> Self {
        Self {
            enabled: true,
            requests_per_second,
            max_burst,
            ..Default::default()
        }
    }
}

/// Throttle statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThrottleStats {
    pub enabled: bool,
    pub tokens: f64,
    pub queued: usize,
    pub granted: u64,
    pub waited: u64,
    pub timed_out: u64,
    pub requests_per_second: f64,
    pub max_burst: u32,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_burst: u32) -> Self {
        Self {
            tokens: max_burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, config: &ThrottleConfig, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let rate = config.requests_per_second.max(0.0);
        self.tokens = (self.tokens + elapsed * rate).min(config.max_burst as f64);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens + TOKEN_EPSILON >= 1.0
    }

    fn consume(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
    }

    fn time_until_next_token(&self, config: &ThrottleConfig) -> Duration {
        if self.has_token() {
            Duration::ZERO
        } else {
            // A zero, tiny or non-finite rate has no representable wait
            Duration::try_from_secs_f64((1.0 - self.tokens) / config.requests_per_second)
                .map_or(MAX_TOKEN_WAIT, |wait| wait.min(MAX_TOKEN_WAIT))
        }
    }
}

struct Waiter {
    tx: oneshot::Sender<Result<()>>,
    enqueued_at: Instant,
}

struct ThrottleState {
    bucket: TokenBucket,
    waiters: VecDeque<Waiter>,
    driver_running: bool,
    destroyed: bool,
    granted: u64,
    waited: u64,
    timed_out: u64,
}

/// FIFO token-bucket rate limiter
pub struct Throttler {
    config: ThrottleConfig,
    enabled: AtomicBool,
    state: Arc<Mutex<ThrottleState>>,
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Self {
        let state = ThrottleState {
            bucket: TokenBucket::new(config.max_burst),
            waiters: VecDeque::new(),
            driver_running: false,
            destroyed: false,
            granted: 0,
            waited: 0,
            timed_out: 0,
        };
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn throttling on or off; turning it off releases every waiter
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            let drained: Vec<Waiter> = self.state.lock().waiters.drain(..).collect();
            for waiter in drained {
                let _ = waiter.tx.send(Ok(()));
            }
        }
    }

    /// Take a token without waiting; fails while earlier callers are queued
    pub fn try_acquire(&self) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let mut state = self.state.lock();
        if state.destroyed || !state.waiters.is_empty() {
            return false;
        }
        state.bucket.refill(&self.config, Instant::now());
        if state.bucket.has_token() {
            state.bucket.consume();
            state.granted += 1;
            true
        } else {
            false
        }
    }

    /// Wait for a token
    pub async fn acquire(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let rx = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::ThrottleDestroyed);
            }
            state.bucket.refill(&self.config, Instant::now());
            if state.waiters.is_empty() && state.bucket.has_token() {
                state.bucket.consume();
                state.granted += 1;
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                tx,
                enqueued_at: Instant::now(),
            });
            state.waited += 1;
            trace!(queued = state.waiters.len(), "Throttled, waiting for token");

            if !state.driver_running {
                state.driver_running = true;
                tokio::spawn(drive(self.state.clone(), self.config.clone()));
            }
            rx
        };

        rx.await.unwrap_or(Err(Error::ThrottleDestroyed))
    }

    /// Reject waiters queued for longer than `timeout` with `ThrottleTimeout`
    pub fn clear_stale_requests(&self, timeout: Duration) -> usize {
        clear_stale(&self.state, timeout)
    }

    /// Start the periodic stale-waiter sweep, if configured
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.sweep_interval_ms == 0 || !self.config.enabled {
            return None;
        }
        let state = self.state.clone();
        let timeout = Duration::from_millis(self.config.stale_timeout_ms);
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let cleared = clear_stale(&state, timeout);
                        if cleared > 0 {
                            debug!(cleared, "Rejected stale throttled requests");
                        }
                    }
                }
            }
        }))
    }

    /// Reject every waiter with `ThrottleDestroyed` and refuse new ones
    pub fn destroy(&self) -> usize {
        let drained: Vec<Waiter> = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.waiters.drain(..).collect()
        };
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(Error::ThrottleDestroyed));
        }
        count
    }

    /// Callers waiting for a token
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn stats(&self) -> ThrottleStats {
        let mut state = self.state.lock();
        state.bucket.refill(&self.config, Instant::now());
        ThrottleStats {
            enabled: self.is_enabled(),
            tokens: state.bucket.tokens,
            queued: state.waiters.len(),
            granted: state.granted,
            waited: state.waited,
            timed_out: state.timed_out,
            requests_per_second: self.config.requests_per_second,
            max_burst: self.config.max_burst,
        }
    }
}

/// Release waiters as tokens become available; exits when the list drains
async fn drive(state: Arc<Mutex<ThrottleState>>, config: ThrottleConfig) {
    loop {
        let wait = {
            let mut state = state.lock();
            state.bucket.refill(&config, Instant::now());
            while state.bucket.has_token() {
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                // A dropped receiver means the caller went away; keep the token
                if waiter.tx.send(Ok(())).is_ok() {
                    state.bucket.consume();
                    state.granted += 1;
                }
            }
            if state.waiters.is_empty() {
                state.driver_running = false;
                return;
            }
            state.bucket.time_until_next_token(&config)
        };
        tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
    }
}

fn clear_stale(state: &Mutex<ThrottleState>, timeout: Duration) -> usize {
    let stale: Vec<Waiter> = {
        let mut state = state.lock();
        let (stale, fresh): (Vec<Waiter>, Vec<Waiter>) = state
            .waiters
            .drain(..)
            .partition(|w| w.enqueued_at.elapsed() >= timeout);
        state.waiters = fresh.into();
        state.timed_out += stale.len() as u64;
        stale
    };
    let count = stale.len();
    for waiter in stale {
        let _ = waiter.tx.send(Err(Error::ThrottleTimeout(timeout)));
    }
    count
}

// =============================================================================
// Tests
// =============================================================================
