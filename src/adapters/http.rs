//! HTTP Transport Adapter
//!
//! Implements the [`Transport`] port over a `reqwest` client. Relative request
//! URLs are resolved against a configured base URL.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::ports::{HttpMethod, RequestSpec, Transport, TransportResponse};
use crate::error::{Error, Result};

/// Configuration for [`ReqwestTransport`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// Base URL relative request URLs are joined to
    pub base_url: String,
    /// Client-level timeout, applied when a request carries none
    pub timeout_ms: u64,
    pub user_agent: String,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_ms: 30_000,
            user_agent: format!("callgate/{}", env!("CARGO_PKG_VERSION")),
            default_headers: BTreeMap::new(),
        }
    }
}

/// `reqwest`-backed transport
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
    config: HttpTransportConfig,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.base_url.as_str())
            .field("timeout_ms", &self.config.timeout_ms)
            .finish()
    }
}

impl ReqwestTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            Error::Config(format!("Invalid base URL '{}': {}", config.base_url, e))
        })?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid header name '{}': {}", name, e)))?;
            let value = value
                .parse::<reqwest::header::HeaderValue>()
                .map_err(|e| Error::Config(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(base_url = %base_url, timeout_ms = config.timeout_ms, "Created HTTP transport");

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Resolve `spec`'s URL (with query string) against the base URL
    pub fn resolve(&self, spec: &RequestSpec) -> Result<Url> {
        self.base_url
            .join(&spec.full_url())
            .map_err(|e| Error::Network(format!("Invalid URL '{}': {}", spec.url, e)))
    }
}

fn map_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            operation: "HTTP request".to_string(),
            duration: timeout,
        }
    } else {
        Error::Network(e.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(&self, spec: RequestSpec) -> Result<TransportResponse> {
        let url = self.resolve(&spec)?;
        let timeout = spec
            .timeout
            .unwrap_or(Duration::from_millis(self.config.timeout_ms));

        debug!(method = %spec.method, url = %url, "Sending HTTP request");

        let mut builder = self
            .client
            .request(map_method(spec.method), url)
            .timeout(timeout);
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect::<BTreeMap<_, _>>();
        let text = response
            .text()
            .await
            .map_err(|e| map_send_error(e, timeout))?;

        // Non-JSON bodies are carried as a string
        let data = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status >= 400 {
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    reqwest::StatusCode::from_u16(status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("request failed")
                        .to_string()
                });
            return Err(Error::http(status, message));
        }

        Ok(TransportResponse {
            data,
            status,
            headers,
        })
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}
