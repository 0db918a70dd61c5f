//! Error types for callgate
//!
//! Every failure surfaced to a caller is an [`Error`] carrying a stable,
//! machine-readable [`ErrorCode`], so callers branch on `code()` rather than
//! on message text. The error is `Clone` because one in-flight result may be
//! handed to many deduplicated callers.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Network,
    Timeout,
    Cancelled,
    ServerError,
    ClientError,
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    CircuitOpen,
    QueueOverflow,
    QueueCleared,
    ThrottleDestroyed,
    ThrottleTimeout,
    DebounceTimeout,
    PluginDependency,
    Plugin,
    MethodNotFound,
    EngineDestroyed,
    Config,
    Storage,
    Internal,
}

impl ErrorCode {
    /// Stable string form of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Network => "NETWORK",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ClientError => "CLIENT_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::QueueOverflow => "QUEUE_OVERFLOW",
            ErrorCode::QueueCleared => "QUEUE_CLEARED",
            ErrorCode::ThrottleDestroyed => "THROTTLE_DESTROYED",
            ErrorCode::ThrottleTimeout => "THROTTLE_TIMEOUT",
            ErrorCode::DebounceTimeout => "DEBOUNCE_TIMEOUT",
            ErrorCode::PluginDependency => "PLUGIN_DEPENDENCY",
            ErrorCode::Plugin => "PLUGIN",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::EngineDestroyed => "ENGINE_DESTROYED",
            ErrorCode::Config => "CONFIG",
            ErrorCode::Storage => "STORAGE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while orchestrating a call
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Network or connection failure
    #[error("Network error: {0}")]
    Network(String),

    /// Attempt exceeded its deadline
    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// Call was cancelled by its caller
    #[error("Call cancelled: {0}")]
    Cancelled(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Response rejected by the method's validator
    #[error("Validation failed for {method}: {reason}")]
    Validation { method: String, reason: String },

    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// Circuit breaker rejected the call without reaching the transport
    #[error("Circuit breaker is open for {method}, next trial in {retry_after:?}")]
    CircuitOpen { method: String, retry_after: Duration },

    /// Priority queue is at capacity
    #[error("Request queue is full ({max_length} tasks)")]
    QueueOverflow { max_length: usize },

    /// Queued task was cleared before it started
    #[error("Queued request was cleared before it started")]
    QueueCleared,

    /// Throttler was torn down while the caller waited for a token
    #[error("Throttler destroyed")]
    ThrottleDestroyed,

    /// Throttled caller waited longer than the stale timeout
    #[error("Throttled request waited longer than {0:?}")]
    ThrottleTimeout(Duration),

    /// Debounced call outlived the maximum slot age
    #[error("Debounced call for {key} expired before it ran")]
    DebounceTimeout { key: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Plugin dependency missing or still required
    #[error("Plugin {plugin} depends on {dependency}")]
    PluginDependency { plugin: String, dependency: String },

    /// Other plugin lifecycle failure
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// No method registered under this name
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Engine was destroyed
    #[error("Engine has been destroyed")]
    EngineDestroyed,

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an HTTP status error
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Error::Http {
            status,
            message: message.into(),
        }
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Network(_) => ErrorCode::Network,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Cancelled(_) => ErrorCode::Cancelled,
            Error::Http { status, .. } => match *status {
                401 => ErrorCode::Unauthorized,
                403 => ErrorCode::Forbidden,
                404 => ErrorCode::NotFound,
                s if s >= 500 => ErrorCode::ServerError,
                _ => ErrorCode::ClientError,
            },
            Error::Validation { .. } => ErrorCode::Validation,
            Error::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Error::QueueOverflow { .. } => ErrorCode::QueueOverflow,
            Error::QueueCleared => ErrorCode::QueueCleared,
            Error::ThrottleDestroyed => ErrorCode::ThrottleDestroyed,
            Error::ThrottleTimeout(_) => ErrorCode::ThrottleTimeout,
            Error::DebounceTimeout { .. } => ErrorCode::DebounceTimeout,
            Error::PluginDependency { .. } => ErrorCode::PluginDependency,
            Error::Plugin(_) => ErrorCode::Plugin,
            Error::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Error::EngineDestroyed => ErrorCode::EngineDestroyed,
            Error::Config(_) => ErrorCode::Config,
            Error::Storage(_) => ErrorCode::Storage,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// HTTP status, if the error came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Default retry predicate: connection failures, timeouts, 408, 429 and 5xx
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout { .. } => true,
            Error::Http { status, .. } => matches!(*status, 408 | 429) || *status >= 500,
            _ => false,
        }
    }

    /// Errors raised on the caller's side rather than by the remote service
    pub fn is_caller_side(&self) -> bool {
        matches!(
            self,
            Error::Cancelled(_) | Error::EngineDestroyed | Error::CircuitOpen { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", e))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {}", e))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_codes() {
        assert_eq!(Error::http(503, "unavailable").code(), ErrorCode::ServerError);
        assert_eq!(Error::http(401, "nope").code(), ErrorCode::Unauthorized);
        assert_eq!(Error::http(403, "nope").code(), ErrorCode::Forbidden);
        assert_eq!(Error::http(404, "gone").code(), ErrorCode::NotFound);
        assert_eq!(Error::http(422, "bad").code(), ErrorCode::ClientError);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::http(503, "").is_retryable());
        assert!(Error::http(429, "").is_retryable());
        assert!(!Error::http(400, "").is_retryable());
        assert!(!Error::MethodNotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_code_strings() {
        assert_eq!(ErrorCode::CircuitOpen.as_str(), "CIRCUIT_OPEN");
        assert_eq!(ErrorCode::QueueOverflow.to_string(), "QUEUE_OVERFLOW");
        let json = serde_json::to_string(&ErrorCode::EngineDestroyed).unwrap();
        assert_eq!(json, "\"ENGINE_DESTROYED\"");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Validation {
            method: "getUser".into(),
            reason: "missing id".into(),
        };
        assert_eq!(err.to_string(), "Validation failed for getUser: missing id");
        assert_eq!(err.status(), None);
        assert_eq!(Error::http(500, "boom").status(), Some(500));
    }
}
