//! Request, response and error middleware.
//!
//! Request middleware rewrites the outgoing [`RequestSpec`] of every attempt.
//! Response middleware post-processes successful values. Error middleware runs
//! in registration order on each failed attempt; the first one to return
//! `Some(value)` recovers the call, which then skips any further retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::domain::ports::RequestSpec;
use crate::error::{Error, ErrorCode, Result};

#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "request"
    }

    async fn on_request(&self, method: &str, request: RequestSpec) -> Result<RequestSpec>;
}

#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "response"
    }

    async fn on_response(&self, method: &str, value: Value) -> Result<Value>;
}

#[async_trait]
pub trait ErrorMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "error"
    }

    /// Return a value to recover from `error`, or `None` to pass it on
    async fn on_error(&self, method: &str, error: &Error, attempt: u32) -> Option<Value>;
}

/// Ordered middleware chains of one engine
#[derive(Default)]
pub struct MiddlewareChain {
    request: RwLock<Vec<Arc<dyn RequestMiddleware>>>,
    response: RwLock<Vec<Arc<dyn ResponseMiddleware>>>,
    error: RwLock<Vec<Arc<dyn ErrorMiddleware>>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("request", &self.request.read().len())
            .field("response", &self.response.read().len())
            .field("error", &self.error.read().len())
            .finish()
    }
}

impl MiddlewareChain {
    pub fn push_request(&self, m: Arc<dyn RequestMiddleware>) {
        self.request.write().push(m);
    }

    pub fn push_response(&self, m: Arc<dyn ResponseMiddleware>) {
        self.response.write().push(m);
    }

    pub fn push_error(&self, m: Arc<dyn ErrorMiddleware>) {
        self.error.write().push(m);
    }

    pub async fn run_request(&self, method: &str, mut request: RequestSpec) -> Result<RequestSpec> {
        let chain = self.request.read().clone();
        for m in chain {
            request = m.on_request(method, request).await?;
        }
        Ok(request)
    }

    pub async fn run_response(&self, method: &str, mut value: Value) -> Result<Value> {
        let chain = self.response.read().clone();
        for m in chain {
            value = m.on_response(method, value).await?;
        }
        Ok(value)
    }

    /// First recovery value offered by the error chain
    pub async fn recover(&self, method: &str, error: &Error, attempt: u32) -> Option<Value> {
        let chain = self.error.read().clone();
        for m in chain {
            if let Some(value) = m.on_error(method, error, attempt).await {
                debug!(method = %method, middleware = %m.name(), code = %error.code(), "Error recovered by middleware");
                return Some(value);
            }
        }
        None
    }

    pub fn clear(&self) {
        self.request.write().clear();
        self.response.write().clear();
        self.error.write().clear();
    }
}

// =============================================================================
// Stock Middleware
// =============================================================================

/// Adds fixed headers to every request that does not already carry them
#[derive(Debug, Clone, Default)]
pub struct HeaderMiddleware {
    headers: BTreeMap<String, String>,
}

impl HeaderMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl RequestMiddleware for HeaderMiddleware {
    fn name(&self) -> &str {
        "headers"
    }

    async fn on_request(&self, _method: &str, mut request: RequestSpec) -> Result<RequestSpec> {
        for (k, v) in &self.headers {
            request.headers.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(request)
    }
}

/// Tags every attempt with a fresh `x-request-id` unless one is already set
#[derive(Debug, Clone)]
pub struct RequestIdMiddleware {
    header: String,
}

impl Default for RequestIdMiddleware {
    fn default() -> Self {
        Self {
            header: "x-request-id".to_string(),
        }
    }
}

impl RequestIdMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

#[async_trait]
impl RequestMiddleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        "request-id"
    }

    async fn on_request(&self, _method: &str, mut request: RequestSpec) -> Result<RequestSpec> {
        request
            .headers
            .entry(self.header.clone())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string());
        Ok(request)
    }
}

/// Answers failed calls with a fixed value when the error code matches
#[derive(Debug, Clone)]
pub struct FallbackMiddleware {
    codes: Vec<ErrorCode>,
    methods: Option<Vec<String>>,
    value: Value,
}

impl FallbackMiddleware {
    pub fn new(codes: impl IntoIterator<Item = ErrorCode>, value: Value) -> Self {
        Self {
            codes: codes.into_iter().collect(),
            methods: None,
            value,
        }
    }

    /// Restrict the fallback to the named methods
    pub fn for_methods(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl ErrorMiddleware for FallbackMiddleware {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn on_error(&self, method: &str, error: &Error, _attempt: u32) -> Option<Value> {
        if let Some(methods) = &self.methods {
            if !methods.iter().any(|m| m == method) {
                return None;
            }
        }
        self.codes
            .contains(&error.code())
            .then(|| self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl ResponseMiddleware for Upper {
        async fn on_response(&self, _method: &str, value: Value) -> Result<Value> {
            Ok(match value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            })
        }
    }

    struct Suffix(&'static str);

    #[async_trait]
    impl ResponseMiddleware for Suffix {
        async fn on_response(&self, _method: &str, value: Value) -> Result<Value> {
            Ok(json!(format!("{}{}", value.as_str().unwrap_or_default(), self.0)))
        }
    }

    #[tokio::test]
    async fn test_response_chain_runs_in_order() {
        let chain = MiddlewareChain::default();
        chain.push_response(Arc::new(Upper));
        chain.push_response(Arc::new(Suffix("!")));
        let out = chain.run_response("m", json!("hi")).await.unwrap();
        assert_eq!(out, json!("HI!"));
    }

    #[tokio::test]
    async fn test_header_middleware_keeps_existing() {
        let chain = MiddlewareChain::default();
        chain.push_request(Arc::new(
            HeaderMiddleware::new()
                .header("x-client", "callgate")
                .header("accept", "application/json"),
        ));
        let req = RequestSpec::get("/x").header("accept", "text/plain");
        let out = chain.run_request("m", req).await.unwrap();
        assert_eq!(out.headers["x-client"], "callgate");
        assert_eq!(out.headers["accept"], "text/plain");
    }

    #[tokio::test]
    async fn test_request_id_is_unique_per_attempt() {
        let chain = MiddlewareChain::default();
        chain.push_request(Arc::new(RequestIdMiddleware::new()));

        let a = chain.run_request("m", RequestSpec::get("/x")).await.unwrap();
        let b = chain.run_request("m", RequestSpec::get("/x")).await.unwrap();
        assert_eq!(a.headers["x-request-id"].len(), 36);
        assert_ne!(a.headers["x-request-id"], b.headers["x-request-id"]);

        let pinned = RequestSpec::get("/x").header("x-request-id", "fixed");
        let out = chain.run_request("m", pinned).await.unwrap();
        assert_eq!(out.headers["x-request-id"], "fixed");
    }

    #[tokio::test]
    async fn test_fallback_matches_code_and_method() {
        let chain = MiddlewareChain::default();
        chain.push_error(Arc::new(
            FallbackMiddleware::new([ErrorCode::ServerError], json!({"stale": true}))
                .for_methods(["getUser"]),
        ));

        let unavailable = Error::http(503, "down");
        assert_eq!(
            chain.recover("getUser", &unavailable, 0).await,
            Some(json!({"stale": true}))
        );
        assert_eq!(chain.recover("other", &unavailable, 0).await, None);
        assert_eq!(
            chain.recover("getUser", &Error::http(404, "missing"), 0).await,
            None
        );
    }
}
