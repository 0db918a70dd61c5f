//! Circuit Breaker
//!
//! Per-method fault isolation with the classic three states:
//!
//! ```text
//!            failure_count >= failure_threshold
//!   Closed ─────────────────────────────────────► Open
//!     ▲                                            │
//!     │ success_count >= success_threshold         │ now >= next_try_at
//!     │                                            ▼ (next call passes)
//!     └────────────────────────────────────── HalfOpen
//!                 any failure ──► Open
//! ```
//!
//! A half-open circuit admits at most `success_threshold` trial calls. If
//! those have not settled within another `half_open_after`, a fresh round
//! of trials is admitted.
//!
//! State is created lazily on first use and dropped by [`CircuitBreakerRegistry::sweep`]
//! once a method has been closed, failure-free and idle for `state_expiry`.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Trial successes that close it again
    pub success_threshold: u32,
    /// Time an open circuit waits before letting a trial call through
    pub half_open_after_ms: u64,
    /// Idle time after which a healthy method's state is dropped
    pub state_expiry_ms: u64,
    /// Sweep period (0 disables the sweeper)
    pub sweep_interval_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 1,
            half_open_after_ms: 30_000,
            state_expiry_ms: 300_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    fn half_open_after(&self) -> Duration {
        Duration::from_millis(self.half_open_after_ms)
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass
    Closed,
    /// Failing fast - calls are rejected
    Open,
    /// Probing recovery - a few trial calls pass, one failure re-opens
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change, reported to the caller for events and metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub method: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of one method's breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Time until an open circuit admits a trial call
    pub retry_after_ms: Option<u64>,
}

/// Aggregate breaker statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub tracked: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub rejected: u64,
    pub trips: u64,
}

#[derive(Debug)]
struct MethodCircuit {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Trial calls admitted in the current half-open round
    trials: u32,
    next_try_at: Option<Instant>,
    last_activity: Instant,
}

impl MethodCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            trials: 0,
            next_try_at: None,
            last_activity: Instant::now(),
        }
    }

    fn open(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.trials = 0;
        self.next_try_at = Some(now + config.half_open_after());
    }

    fn start_trials(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        self.trials = 1;
        self.next_try_at = Some(now + config.half_open_after());
    }
}

/// Breakers for every method of an engine
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, MethodCircuit>,
    rejected: std::sync::atomic::AtomicU64,
    trips: std::sync::atomic::AtomicU64,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            rejected: Default::default(),
            trips: Default::default(),
        }
    }

    /// Engine-wide configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Admission check with the engine-wide configuration
    pub fn check(&self, method: &str) -> Result<Option<CircuitTransition>> {
        self.check_with(method, &self.config)
    }

    /// Admission check.
    ///
    /// Rejects with `CircuitOpen` while the circuit is open; once
    /// `next_try_at` has passed the circuit moves to half-open and the call
    /// goes through as a trial. Calls beyond `success_threshold` trials are
    /// rejected while the circuit stays half-open.
    pub fn check_with(
        &self,
        method: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<Option<CircuitTransition>> {
        if !config.enabled {
            return Ok(None);
        }
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(method.to_string())
            .or_insert_with(MethodCircuit::new);
        circuit.last_activity = now;

        let next_try_at = circuit.next_try_at.unwrap_or(now);
        match circuit.state {
            CircuitState::Closed => return Ok(None),
            CircuitState::HalfOpen if circuit.trials < config.success_threshold.max(1) => {
                circuit.trials += 1;
                return Ok(None);
            }
            CircuitState::HalfOpen if now >= next_try_at => {
                debug!(method = %method, "Half-open trials stalled, admitting a new round");
                circuit.start_trials(config, now);
                return Ok(None);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }

        if now < next_try_at {
            self.rejected
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(Error::CircuitOpen {
                method: method.to_string(),
                retry_after: next_try_at - now,
            });
        }

        circuit.state = CircuitState::HalfOpen;
        circuit.success_count = 0;
        circuit.start_trials(config, now);
        info!(method = %method, "Circuit breaker half-open, admitting trial calls");
        Ok(Some(CircuitTransition {
            method: method.to_string(),
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        }))
    }

    pub fn record_success(&self, method: &str) -> Option<CircuitTransition> {
        self.record_success_with(method, &self.config)
    }

    /// Record a successful attempt
    pub fn record_success_with(
        &self,
        method: &str,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitTransition> {
        if !config.enabled {
            return None;
        }
        let mut circuit = self
            .circuits
            .entry(method.to_string())
            .or_insert_with(MethodCircuit::new);
        circuit.last_activity = Instant::now();

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count < config.success_threshold.max(1) {
                    return None;
                }
                circuit.state = CircuitState::Closed;
                circuit.failure_count = 0;
                circuit.success_count = 0;
                circuit.trials = 0;
                circuit.next_try_at = None;
                info!(method = %method, "Circuit breaker closed (recovered)");
                Some(CircuitTransition {
                    method: method.to_string(),
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                })
            }
            CircuitState::Open => {
                debug!(method = %method, "Success recorded while circuit is open");
                None
            }
        }
    }

    pub fn record_failure(&self, method: &str) -> Option<CircuitTransition> {
        self.record_failure_with(method, &self.config)
    }

    /// Record a failed attempt
    pub fn record_failure_with(
        &self,
        method: &str,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitTransition> {
        if !config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(method.to_string())
            .or_insert_with(MethodCircuit::new);
        circuit.last_activity = now;
        circuit.failure_count = circuit.failure_count.saturating_add(1);

        let from = circuit.state;
        match from {
            CircuitState::Closed if circuit.failure_count >= config.failure_threshold.max(1) => {}
            CircuitState::HalfOpen => {}
            _ => return None,
        }

        circuit.open(config, now);
        self.trips.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        warn!(
            method = %method,
            failures = circuit.failure_count,
            half_open_after_ms = config.half_open_after_ms,
            "Circuit breaker opened"
        );
        Some(CircuitTransition {
            method: method.to_string(),
            from,
            to: CircuitState::Open,
        })
    }

    /// Current state of `method` (closed if never seen)
    pub fn state(&self, method: &str) -> CircuitState {
        self.circuits
            .get(method)
            .map_or(CircuitState::Closed, |c| c.state)
    }

    /// Detailed view of `method`
    pub fn snapshot(&self, method: &str) -> Option<CircuitSnapshot> {
        let now = Instant::now();
        self.circuits.get(method).map(|c| CircuitSnapshot {
            state: c.state,
            failure_count: c.failure_count,
            success_count: c.success_count,
            retry_after_ms: match (c.state, c.next_try_at) {
                (CircuitState::Open, Some(at)) => {
                    Some(at.saturating_duration_since(now).as_millis() as u64)
                }
                _ => None,
            },
        })
    }

    /// Forget `method`'s state (back to closed)
    pub fn reset(&self, method: &str) -> bool {
        let removed = self.circuits.remove(method).is_some();
        if removed {
            info!(method = %method, "Circuit breaker reset");
        }
        removed
    }

    /// Open `method`'s circuit regardless of its failure count
    pub fn force_open(&self, method: &str) -> Option<CircuitTransition> {
        let mut circuit = self
            .circuits
            .entry(method.to_string())
            .or_insert_with(MethodCircuit::new);
        let from = circuit.state;
        circuit.open(&self.config, Instant::now());
        warn!(method = %method, "Circuit breaker forced open");
        (from != CircuitState::Open).then(|| CircuitTransition {
            method: method.to_string(),
            from,
            to: CircuitState::Open,
        })
    }

    /// Drop closed, failure-free state idle for longer than `state_expiry`
    pub fn sweep(&self) -> usize {
        let expiry = Duration::from_millis(self.config.state_expiry_ms);
        let before = self.circuits.len();
        self.circuits.retain(|_, c| {
            !(c.state == CircuitState::Closed
                && c.failure_count == 0
                && c.last_activity.elapsed() > expiry)
        });
        before.saturating_sub(self.circuits.len())
    }

    pub fn stats(&self) -> BreakerStats {
        let mut stats = BreakerStats {
            tracked: self.circuits.len(),
            rejected: self.rejected.load(std::sync::atomic::Ordering::Relaxed),
            trips: self.trips.load(std::sync::atomic::Ordering::Relaxed),
            ..Default::default()
        };
        for circuit in self.circuits.iter() {
            match circuit.state {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
        }
        stats
    }
}

/// Periodically sweep dormant breaker state until `shutdown` is cancelled
pub fn spawn_sweeper(
    registry: std::sync::Arc<CircuitBreakerRegistry>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let period = registry.config.sweep_interval_ms;
    if period == 0 || !registry.config.enabled {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(period));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.sweep();
                    if removed > 0 {
                        debug!(removed, "Swept dormant circuit state");
                    }
                }
            }
        }
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            half_open_after_ms: 30_000,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle() {
        let cb = registry();

        assert!(cb.check("m").unwrap().is_none());
        assert!(cb.record_failure("m").is_none());
        assert!(cb.record_failure("m").is_none());
        let opened = cb.record_failure("m").unwrap();
        assert_eq!((opened.from, opened.to), (CircuitState::Closed, CircuitState::Open));

        // Rejected while open
        assert_matches!(
            cb.check("m"),
            Err(Error::CircuitOpen { retry_after, .. }) if retry_after == Duration::from_secs(30)
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = cb.check("m").unwrap().unwrap();
        assert_eq!(trial.to, CircuitState::HalfOpen);

        let closed = cb.record_success("m").unwrap();
        assert_eq!(closed.to, CircuitState::Closed);
        assert_eq!(cb.state("m"), CircuitState::Closed);
        assert_eq!(cb.snapshot("m").unwrap().failure_count, 0);
        assert_eq!(cb.stats().trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = registry();
        for _ in 0..3 {
            cb.record_failure("m");
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        cb.check("m").unwrap();

        let reopened = cb.record_failure("m").unwrap();
        assert_eq!(reopened.from, CircuitState::HalfOpen);
        assert_eq!(cb.state("m"), CircuitState::Open);
        assert!(cb.check("m").is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = registry();
        cb.record_failure("m");
        cb.record_failure("m");
        cb.record_success("m");
        cb.record_failure("m");
        cb.record_failure("m");
        assert_eq!(cb.state("m"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_above_one() {
        let cb = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            half_open_after_ms: 10,
            ..Default::default()
        });
        cb.record_failure("m");
        tokio::time::advance(Duration::from_millis(10)).await;
        cb.check("m").unwrap();

        assert!(cb.record_success("m").is_none());
        assert_eq!(cb.state("m"), CircuitState::HalfOpen);
        assert!(cb.record_success("m").is_some());
        assert_eq!(cb.state("m"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let cb = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            half_open_after_ms: 1_000,
            ..Default::default()
        });
        cb.record_failure("m");
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert!(cb.check("m").unwrap().is_some());
        assert!(cb.check("m").unwrap().is_none());
        assert_matches!(cb.check("m"), Err(Error::CircuitOpen { .. }));
        assert_eq!(cb.state("m"), CircuitState::HalfOpen);
        assert_eq!(cb.stats().rejected, 1);

        // Trials that never report back do not wedge the circuit
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cb.check("m").unwrap().is_none());

        cb.record_success("m");
        assert!(cb.record_success("m").is_some());
        assert!(cb.check("m").is_ok());
    }

    #[test]
    fn test_methods_are_isolated() {
        let cb = registry();
        for _ in 0..3 {
            cb.record_failure("a");
        }
        assert!(cb.check("a").is_err());
        assert!(cb.check("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_dormant_healthy_state() {
        let cb = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            state_expiry_ms: 1_000,
            ..Default::default()
        });
        cb.check("healthy").unwrap();
        cb.record_failure("flaky");

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(cb.sweep(), 1);
        assert!(cb.snapshot("healthy").is_none());
        assert!(cb.snapshot("flaky").is_some());
    }

    #[test]
    fn test_force_open_and_reset() {
        let cb = registry();
        assert!(cb.force_open("m").is_some());
        assert!(cb.check("m").is_err());
        assert!(cb.reset("m"));
        assert!(cb.check("m").is_ok());
    }

    #[test]
    fn test_disabled_never_rejects() {
        let cb = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            ..Default::default()
        });
        cb.record_failure("m");
        assert!(cb.check("m").is_ok());
        assert_eq!(cb.stats().tracked, 0);
    }
}
