//! Engine Events
//!
//! Immutable records of significant occurrences during call orchestration,
//! published through the [`EventPublisher`](super::ports::EventPublisher) port.
//!
//! # Example
//!
//! ```ignore
//! let event = EngineEvent::call_succeeded("getUser", 2, Duration::from_millis(40));
//! publisher.publish(event).await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    // =========================================================================
    // Call Events
    // =========================================================================
    /// A call was answered from the cache.
    CacheHit {
        method: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A cache lookup missed.
    CacheMiss {
        method: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A call joined an identical in-flight call.
    DedupJoined {
        method: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A call completed successfully.
    CallSucceeded {
        method: String,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A call failed after exhausting its attempts.
    CallFailed {
        method: String,
        code: String,
        message: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// An error middleware turned a failure into a value.
    CallRecovered {
        method: String,
        code: String,
        timestamp: DateTime<Utc>,
    },

    /// A failed attempt will be retried.
    RetryScheduled {
        method: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Resilience Events
    // =========================================================================
    /// A circuit breaker changed state.
    CircuitStateChanged {
        method: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Lifecycle Events
    // =========================================================================
    /// A method was registered (or replaced).
    MethodRegistered {
        method: String,
        replaced: bool,
        timestamp: DateTime<Utc>,
    },

    /// A plugin was installed.
    PluginInstalled {
        plugin: String,
        timestamp: DateTime<Utc>,
    },

    /// A plugin was uninstalled.
    PluginUninstalled {
        plugin: String,
        timestamp: DateTime<Utc>,
    },

    /// The engine was destroyed.
    EngineDestroyed {
        rejected: usize,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::CacheHit { timestamp, .. }
            | EngineEvent::CacheMiss { timestamp, .. }
            | EngineEvent::DedupJoined { timestamp, .. }
            | EngineEvent::CallSucceeded { timestamp, .. }
            | EngineEvent::CallFailed { timestamp, .. }
            | EngineEvent::CallRecovered { timestamp, .. }
            | EngineEvent::RetryScheduled { timestamp, .. }
            | EngineEvent::CircuitStateChanged { timestamp, .. }
            | EngineEvent::MethodRegistered { timestamp, .. }
            | EngineEvent::PluginInstalled { timestamp, .. }
            | EngineEvent::PluginUninstalled { timestamp, .. }
            | EngineEvent::EngineDestroyed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::CacheHit { .. } => "CacheHit",
            EngineEvent::CacheMiss { .. } => "CacheMiss",
            EngineEvent::DedupJoined { .. } => "DedupJoined",
            EngineEvent::CallSucceeded { .. } => "CallSucceeded",
            EngineEvent::CallFailed { .. } => "CallFailed",
            EngineEvent::CallRecovered { .. } => "CallRecovered",
            EngineEvent::RetryScheduled { .. } => "RetryScheduled",
            EngineEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            EngineEvent::MethodRegistered { .. } => "MethodRegistered",
            EngineEvent::PluginInstalled { .. } => "PluginInstalled",
            EngineEvent::PluginUninstalled { .. } => "PluginUninstalled",
            EngineEvent::EngineDestroyed { .. } => "EngineDestroyed",
        }
    }

    /// Get the method name if applicable.
    pub fn method(&self) -> Option<&str> {
        match self {
            EngineEvent::CacheHit { method, .. }
            | EngineEvent::CacheMiss { method, .. }
            | EngineEvent::DedupJoined { method, .. }
            | EngineEvent::CallSucceeded { method, .. }
            | EngineEvent::CallFailed { method, .. }
            | EngineEvent::CallRecovered { method, .. }
            | EngineEvent::RetryScheduled { method, .. }
            | EngineEvent::CircuitStateChanged { method, .. }
            | EngineEvent::MethodRegistered { method, .. } => Some(method),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl EngineEvent {
    pub fn cache_hit(method: impl Into<String>, key: impl Into<String>) -> Self {
        EngineEvent::CacheHit {
            method: method.into(),
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn cache_miss(method: impl Into<String>, key: impl Into<String>) -> Self {
        EngineEvent::CacheMiss {
            method: method.into(),
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn dedup_joined(method: impl Into<String>, key: impl Into<String>) -> Self {
        EngineEvent::DedupJoined {
            method: method.into(),
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a CallSucceeded event.
    pub fn call_succeeded(method: impl Into<String>, attempts: u32, duration: Duration) -> Self {
        EngineEvent::CallSucceeded {
            method: method.into(),
            attempts,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    /// Create a CallFailed event from the final error.
    pub fn call_failed(method: impl Into<String>, error: &crate::Error, attempts: u32) -> Self {
        EngineEvent::CallFailed {
            method: method.into(),
            code: error.code().to_string(),
            message: error.to_string(),
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn call_recovered(method: impl Into<String>, error: &crate::Error) -> Self {
        EngineEvent::CallRecovered {
            method: method.into(),
            code: error.code().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create a RetryScheduled event.
    pub fn retry_scheduled(
        method: impl Into<String>,
        attempt: u32,
        delay: Duration,
        error: &crate::Error,
    ) -> Self {
        EngineEvent::RetryScheduled {
            method: method.into(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            reason: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create a CircuitStateChanged event.
    pub fn circuit_state_changed(
        method: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        EngineEvent::CircuitStateChanged {
            method: method.into(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn method_registered(method: impl Into<String>, replaced: bool) -> Self {
        EngineEvent::MethodRegistered {
            method: method.into(),
            replaced,
            timestamp: Utc::now(),
        }
    }

    pub fn plugin_installed(plugin: impl Into<String>) -> Self {
        EngineEvent::PluginInstalled {
            plugin: plugin.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn plugin_uninstalled(plugin: impl Into<String>) -> Self {
        EngineEvent::PluginUninstalled {
            plugin: plugin.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn engine_destroyed(rejected: usize) -> Self {
        EngineEvent::EngineDestroyed {
            rejected,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::call_succeeded("getUser", 3, Duration::from_millis(120));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"CallSucceeded\""));
        assert!(json.contains("getUser"));

        let deserialized: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "CallSucceeded");
    }

    #[test]
    fn test_failed_event_carries_error_code() {
        let err = crate::Error::http(503, "unavailable");
        match EngineEvent::call_failed("listItems", &err, 3) {
            EngineEvent::CallFailed { code, attempts, .. } => {
                assert_eq!(code, "SERVER_ERROR");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_method_extraction() {
        let event = EngineEvent::circuit_state_changed("search", "closed", "open");
        assert_eq!(event.method(), Some("search"));
        assert_eq!(event.event_type(), "CircuitStateChanged");
        assert_eq!(EngineEvent::plugin_installed("auth").method(), None);
    }
}
