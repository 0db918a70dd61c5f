//! Domain Ports (Port/Adapter Pattern)
//!
//! The engine depends only on these traits. Adapters in [`crate::adapters`]
//! provide the concrete HTTP client, persistent storage and event sinks.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Engine                             │
//! │   Transport  │  Storage  │  EventPublisher                │
//! └──────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Adapters                            │
//! │  ReqwestTransport │ EchoTransport │ MemoryStorage │ ...   │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::events::EngineEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// HTTP verb of a request template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Patch => write!(f, "PATCH"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// A concrete request handed to the transport
#[derive(Debug, Clone, Default)]
pub struct RequestSpec {
    pub method: HttpMethod,
    /// Absolute URL or a path the transport resolves against its base URL
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Per-attempt deadline, set by the engine from the call options
    pub timeout: Option<Duration>,
    /// Fires when the caller cancels or the engine is destroyed
    pub cancel: Option<CancellationToken>,
}

impl RequestSpec {
    /// Create a request with the given verb and URL
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            ..Default::default()
        }
    }

    /// GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// POST request with a JSON body
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Set the JSON body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// URL with the query string appended, parameters percent-encoded
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, sep, query)
    }
}

/// What the transport returns for a completed exchange
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransportResponse {
    pub data: Value,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

impl TransportResponse {
    /// 200 response carrying `data`
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            status: 200,
            headers: BTreeMap::new(),
        }
    }

    /// Check for a 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// =============================================================================
// Transport Port
// =============================================================================

/// Port for executing HTTP requests.
///
/// Implementations either return an error for non-2xx statuses or hand the
/// response back; the engine converts any status >= 400 into
/// [`crate::Error::Http`] either way.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one request
    async fn request(&self, spec: RequestSpec) -> Result<TransportResponse>;

    /// Adapter name for logs
    fn name(&self) -> &str {
        "transport"
    }
}

// =============================================================================
// Storage Port
// =============================================================================

/// Port for string key/value persistence used by the persistent cache mode
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every stored key
    async fn clear(&self) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing engine events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event
    async fn publish(&self, event: EngineEvent) -> Result<()>;

    /// Publish multiple events
    async fn publish_all(&self, events: Vec<EngineEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_url_encodes_query() {
        let spec = RequestSpec::get("https://api.test/search")
            .query("q", "rust lang")
            .query("page", "2");
        assert_eq!(spec.full_url(), "https://api.test/search?page=2&q=rust%20lang");

        let spec = RequestSpec::get("/items?sort=asc").query("limit", "5");
        assert_eq!(spec.full_url(), "/items?sort=asc&limit=5");
    }

    #[test]
    fn test_request_builders() {
        let spec = RequestSpec::post("/users", json!({"name": "a"})).header("x-trace", "1");
        assert_eq!(spec.method, HttpMethod::Post);
        assert_eq!(spec.headers.get("x-trace").map(String::as_str), Some("1"));
        assert_eq!(spec.body, Some(json!({"name": "a"})));
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_response_status() {
        assert!(TransportResponse::ok(json!(null)).is_success());
        let resp = TransportResponse {
            status: 503,
            ..Default::default()
        };
        assert!(!resp.is_success());
    }
}
