//! Retry policy: backoff curves, jitter, error classification and budgets.
//!
//! The policy is pure. It answers two questions for the orchestrator's retry
//! loop: "may this failure be retried?" and "how long to wait first?".
//! Attempts are numbered from 0, so the delay before the first retry is
//! `delay_for(0, ..)`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCode};

/// Backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base`
    Fixed,
    /// `base * (attempt + 1)`
    Linear,
    /// `base * 2^attempt`
    #[default]
    Exponential,
    /// `base * fib(attempt + 1)`
    Fibonacci,
    /// uniform in `[base, previous * 3]`
    DecorrelatedJitter,
    /// `base * (attempt + 1)^degree`
    Polynomial,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retrying)
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffKind,
    /// Symmetric jitter as a fraction of the delay, in `[0, 1]`
    pub jitter_ratio: f64,
    /// Classify errors and never retry permanent ones
    pub smart: bool,
    /// Total time after which no further retries are scheduled
    pub budget_ms: Option<u64>,
    pub polynomial_degree: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff: BackoffKind::Exponential,
            jitter_ratio: 0.0,
            smart: false,
            budget_ms: None,
            polynomial_degree: 2,
        }
    }
}

impl RetryConfig {
    /// Shorthand for `max_retries` retries with a fixed delay
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: delay.as_millis() as u64,
            backoff: BackoffKind::Fixed,
            ..Default::default()
        }
    }
}

/// How an error is expected to behave on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// May succeed if retried
    Transient,
    /// Will never succeed if retried
    Permanent,
    /// Not enough information; the predicate decides
    Unknown,
}

impl ErrorClass {
    /// Classify by HTTP status first, then by error code
    pub fn of(error: &Error) -> Self {
        if let Some(status) = error.status() {
            return match status {
                408 | 425 | 429 => ErrorClass::Transient,
                501 | 505 => ErrorClass::Permanent,
                s if s >= 500 => ErrorClass::Transient,
                s if s >= 400 => ErrorClass::Permanent,
                _ => ErrorClass::Unknown,
            };
        }
        match error.code() {
            ErrorCode::Network | ErrorCode::Timeout | ErrorCode::ThrottleTimeout => {
                ErrorClass::Transient
            }
            ErrorCode::Validation
            | ErrorCode::Cancelled
            | ErrorCode::CircuitOpen
            | ErrorCode::MethodNotFound
            | ErrorCode::EngineDestroyed
            | ErrorCode::Config => ErrorClass::Permanent,
            _ => ErrorClass::Unknown,
        }
    }
}

/// Caller-supplied retry predicate, given the error and the attempt number
pub type RetryPredicate = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

/// Immutable retry policy for one call
#[derive(Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
        }
    }

    /// Replace the default predicate (`Error::is_retryable`)
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Decide whether the failure of `attempt` may be retried.
    ///
    /// `elapsed` is the time spent on the call so far and is checked against
    /// the budget.
    pub fn should_retry(&self, error: &Error, attempt: u32, elapsed: Duration) -> bool {
        if attempt >= self.config.max_retries || error.is_caller_side() {
            return false;
        }
        if let Some(budget) = self.config.budget_ms {
            if elapsed >= Duration::from_millis(budget) {
                return false;
            }
        }
        if self.config.smart {
            match ErrorClass::of(error) {
                ErrorClass::Permanent => return false,
                ErrorClass::Transient if self.predicate.is_none() => return true,
                _ => {}
            }
        }
        match &self.predicate {
            Some(predicate) => predicate(error, attempt),
            None => error.is_retryable(),
        }
    }

    /// Un-jittered delay before retrying after `attempt`, clamped to `max_delay`.
    ///
    /// `previous` is the last delay used, consulted by decorrelated jitter only.
    pub fn delay_for(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let step = f64::from(attempt.saturating_add(1));

        let millis = match self.config.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base * step,
            BackoffKind::Exponential => base * 2f64.powi(attempt.min(1_023) as i32),
            BackoffKind::Fibonacci => base * fibonacci(attempt.saturating_add(1)),
            BackoffKind::Polynomial => base * step.powi(self.config.polynomial_degree as i32),
            BackoffKind::DecorrelatedJitter => {
                let prev = previous.map_or(base, |d| d.as_millis() as f64);
                let upper = (prev * 3.0).min(max).max(base);
                if upper > base {
                    base + fastrand::f64() * (upper - base)
                } else {
                    base
                }
            }
        };

        Duration::from_millis(millis.min(max).max(0.0) as u64)
    }

    /// Apply symmetric jitter of `±delay * jitter_ratio`
    pub fn jitter(&self, delay: Duration) -> Duration {
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + (fastrand::f64() * 2.0 - 1.0) * ratio;
        delay.mul_f64(factor.max(0.0))
    }

    /// Delay to actually sleep before the next attempt
    pub fn next_delay(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        self.jitter(self.delay_for(attempt, previous))
    }
}

fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (0f64, 1f64);
    for _ in 0..n.min(1_476) {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffKind) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff,
            ..Default::default()
        })
    }

    fn ms(d: Duration) -> u64 {
        d.as_millis() as u64
    }

    #[test]
    fn test_exponential_attempt_three() {
        assert_eq!(ms(policy(BackoffKind::Exponential).delay_for(3, None)), 8_000);
        assert_eq!(ms(policy(BackoffKind::Exponential).delay_for(10, None)), 30_000);
    }

    #[test]
    fn test_backoff_curves() {
        let fixed = policy(BackoffKind::Fixed);
        let linear = policy(BackoffKind::Linear);
        let fib = policy(BackoffKind::Fibonacci);
        let poly = policy(BackoffKind::Polynomial);

        let curve = |p: &RetryPolicy| (0..5).map(|a| ms(p.delay_for(a, None))).collect::<Vec<_>>();
        assert_eq!(curve(&fixed), vec![1_000; 5]);
        assert_eq!(curve(&linear), vec![1_000, 2_000, 3_000, 4_000, 5_000]);
        assert_eq!(curve(&fib), vec![1_000, 1_000, 2_000, 3_000, 5_000]);
        assert_eq!(curve(&poly), vec![1_000, 4_000, 9_000, 16_000, 25_000]);
    }

    #[test]
    fn test_decorrelated_jitter_bounds() {
        let p = policy(BackoffKind::DecorrelatedJitter);
        let mut prev = None;
        for attempt in 0..50 {
            let d = p.delay_for(attempt, prev);
            let upper = prev.map_or(1_000, |p: Duration| (ms(p) * 3).min(30_000));
            assert!(ms(d) >= 1_000 && ms(d) <= upper.max(1_000), "{d:?}");
            prev = Some(d);
        }
    }

    #[test]
    fn test_jitter_is_symmetric_and_bounded() {
        let p = RetryPolicy::new(RetryConfig {
            jitter_ratio: 0.5,
            ..Default::default()
        });
        for _ in 0..100 {
            let d = ms(p.jitter(Duration::from_millis(1_000)));
            assert!((500..=1_500).contains(&d), "{d}");
        }
    }

    #[test]
    fn test_should_retry_respects_max_and_predicate() {
        let p = policy(BackoffKind::Fixed);
        let unavailable = Error::http(503, "unavailable");
        let bad_request = Error::http(400, "bad");

        assert!(p.should_retry(&unavailable, 0, Duration::ZERO));
        assert!(!p.should_retry(&unavailable, 5, Duration::ZERO));
        assert!(!p.should_retry(&bad_request, 0, Duration::ZERO));
        assert!(!p.should_retry(&Error::Cancelled("x".into()), 0, Duration::ZERO));

        let always = p.with_predicate(Arc::new(|_, _| true));
        assert!(always.should_retry(&bad_request, 0, Duration::ZERO));
    }

    #[test]
    fn test_smart_mode_never_retries_permanent() {
        let p = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            smart: true,
            ..Default::default()
        })
        .with_predicate(Arc::new(|_, _| true));

        assert!(!p.should_retry(&Error::http(404, "missing"), 0, Duration::ZERO));
        assert!(p.should_retry(&Error::http(502, "bad gateway"), 0, Duration::ZERO));
        assert!(p.should_retry(&Error::Internal("?".into()), 0, Duration::ZERO));
    }

    #[test]
    fn test_budget_short_circuits() {
        let p = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            budget_ms: Some(2_000),
            ..Default::default()
        });
        let err = Error::Network("reset".into());
        assert!(p.should_retry(&err, 1, Duration::from_millis(1_999)));
        assert!(!p.should_retry(&err, 1, Duration::from_millis(2_000)));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(ErrorClass::of(&Error::http(429, "slow down")), ErrorClass::Transient);
        assert_eq!(ErrorClass::of(&Error::http(501, "nope")), ErrorClass::Permanent);
        assert_eq!(ErrorClass::of(&Error::http(403, "no")), ErrorClass::Permanent);
        assert_eq!(ErrorClass::of(&Error::Network("x".into())), ErrorClass::Transient);
        assert_eq!(ErrorClass::of(&Error::Storage("x".into())), ErrorClass::Unknown);
    }
}
