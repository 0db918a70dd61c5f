//! Engine configuration.
//!
//! Every section has serde defaults, so a YAML file only needs the keys it
//! changes:
//!
//! ```yaml
//! name: billing
//! cache:
//!   default_ttl_ms: 60000
//! retry:
//!   max_retries: 3
//!   backoff: exponential
//! circuit_breaker:
//!   failure_threshold: 5
//! throttle:
//!   enabled: true
//!   requests_per_second: 20
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::debounce::DebounceConfig;
use crate::dedup::DedupConfig;
use crate::error::{Error, Result};
use crate::fingerprint::FingerprintConfig;
use crate::pool::PoolConfig;
use crate::queue::QueueConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::throttle::ThrottleConfig;

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name, used in logs
    pub name: String,
    /// Per-attempt transport timeout applied when a call sets none
    pub default_timeout_ms: Option<u64>,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub debounce: DebounceConfig,
    pub dedup: DedupConfig,
    pub queue: QueueConfig,
    pub throttle: ThrottleConfig,
    pub pool: PoolConfig,
    pub fingerprint: FingerprintConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "callgate".to_string(),
            default_timeout_ms: None,
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            debounce: DebounceConfig::default(),
            dedup: DedupConfig::default(),
            queue: QueueConfig::default(),
            throttle: ThrottleConfig::default(),
            pool: PoolConfig::default(),
            fingerprint: FingerprintConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Reject values the engines cannot run with
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config(msg.to_string()))
            }
        }

        check(self.cache.max_size > 0, "cache.max_size must be greater than 0")?;
        check(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "retry.base_delay_ms must not exceed retry.max_delay_ms",
        )?;
        check(
            (0.0..=1.0).contains(&self.retry.jitter_ratio),
            "retry.jitter_ratio must be within [0, 1]",
        )?;
        check(
            self.circuit_breaker.failure_threshold > 0,
            "circuit_breaker.failure_threshold must be greater than 0",
        )?;
        check(
            self.circuit_breaker.success_threshold > 0,
            "circuit_breaker.success_threshold must be greater than 0",
        )?;
        check(self.queue.concurrency > 0, "queue.concurrency must be greater than 0")?;
        check(
            self.throttle.requests_per_second > 0.0 && self.throttle.requests_per_second.is_finite(),
            "throttle.requests_per_second must be a positive number",
        )?;
        check(self.throttle.max_burst > 0, "throttle.max_burst must be greater than 0")?;
        check(
            self.pool.hot_capacity + self.pool.cold_capacity <= self.pool.max_total,
            "pool.hot_capacity + pool.cold_capacity must not exceed pool.max_total",
        )?;
        check(
            self.fingerprint.sample_threshold > self.fingerprint.sample_head,
            "fingerprint.sample_threshold must exceed fingerprint.sample_head",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffKind;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
name: billing
retry:
  max_retries: 3
  backoff: fibonacci
throttle:
  enabled: true
  requests_per_second: 5
"#,
        )
        .unwrap();

        assert_eq!(config.name, "billing");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.backoff, BackoffKind::Fibonacci);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!(config.throttle.enabled);
        assert_eq!(config.throttle.max_burst, 20);
        assert_eq!(config.queue.concurrency, 6);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_matches!(
            EngineConfig::from_yaml_str("queue:\n  concurrency: 0\n"),
            Err(Error::Config(msg)) if msg.contains("queue.concurrency")
        );
        assert_matches!(
            EngineConfig::from_yaml_str("retry:\n  jitter_ratio: 1.5\n"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_malformed_yaml() {
        assert_matches!(
            EngineConfig::from_yaml_str("retry: [unterminated"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            EngineConfig::from_file("/nonexistent/callgate.yaml"),
            Err(Error::Config(_))
        );
    }
}
