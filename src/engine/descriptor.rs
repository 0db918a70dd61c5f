//! Method descriptors and per-call options.
//!
//! A [`MethodDescriptor`] is the immutable template the engine invokes by
//! name. Every per-method override is an `Option`; `None` inherits the
//! engine-wide setting.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::ports::{HttpMethod, RequestSpec};
use crate::error::Result;
use crate::resilience::{CircuitBreakerConfig, RetryConfig, RetryPolicy};

/// Builds the transport request from call parameters
pub type RequestBuilder = Arc<dyn Fn(&Value) -> Result<RequestSpec> + Send + Sync>;

/// Reshapes a successful response body
pub type Transform = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Accepts a response body or explains why not
pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

pub type SuccessCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&crate::Error) + Send + Sync>;

/// Per-method cache override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOverride {
    pub enabled: bool,
    /// TTL for this method's entries (`None` = cache default)
    pub ttl: Option<Duration>,
}

/// Named call template
#[derive(Clone)]
pub struct MethodDescriptor {
    pub(crate) name: String,
    pub(crate) build: RequestBuilder,
    pub(crate) transform: Option<Transform>,
    pub(crate) validate: Option<Validator>,
    pub(crate) cache: Option<CacheOverride>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) circuit_breaker: Option<CircuitBreakerConfig>,
    /// Debouncing is opt-in per method; `Some` carries the delay
    pub(crate) debounce: Option<Duration>,
    pub(crate) dedup: Option<bool>,
    pub(crate) queued: Option<bool>,
    pub(crate) priority: Option<i32>,
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("transform", &self.transform.is_some())
            .field("validate", &self.validate.is_some())
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("debounce", &self.debounce)
            .field("dedup", &self.dedup)
            .field("queued", &self.queued)
            .field("priority", &self.priority)
            .finish()
    }
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        build: impl Fn(&Value) -> Result<RequestSpec> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            build: Arc::new(build),
            transform: None,
            validate: None,
            cache: None,
            retry: None,
            circuit_breaker: None,
            debounce: None,
            dedup: None,
            queued: None,
            priority: None,
        }
    }

    /// REST-style template: `GET`/`DELETE` send object params as the query
    /// string, other verbs send the params as the JSON body.
    pub fn rest(name: impl Into<String>, method: HttpMethod, path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(name, move |params| {
            let mut spec = RequestSpec::new(method, path.clone());
            match method {
                HttpMethod::Get | HttpMethod::Delete => {
                    if let Value::Object(map) = params {
                        for (k, v) in map {
                            let v = match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            spec = spec.query(k.clone(), v);
                        }
                    }
                }
                _ => {
                    if !params.is_null() {
                        spec = spec.with_body(params.clone());
                    }
                }
            }
            Ok(spec)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transform(mut self, f: impl Fn(Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn validate(
        mut self,
        f: impl Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }

    /// Cache responses for `ttl`
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Some(CacheOverride {
            enabled: true,
            ttl: Some(ttl),
        });
        self
    }

    /// Never cache this method's responses
    pub fn no_cache(mut self) -> Self {
        self.cache = Some(CacheOverride {
            enabled: false,
            ttl: None,
        });
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(RetryPolicy::new(config));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Collapse bursts of calls into the last one, `delay` after it
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.debounce = Some(delay);
        self
    }

    pub fn dedup(mut self, enabled: bool) -> Self {
        self.dedup = Some(enabled);
        self
    }

    /// Bypass the request queue
    pub fn unqueued(mut self) -> Self {
        self.queued = Some(false);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Build the transport request for `params`
    pub fn build_request(&self, params: &Value) -> Result<RequestSpec> {
        (self.build)(params)
    }
}

/// Per-call overrides
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Queue priority (higher runs first)
    pub priority: Option<i32>,
    pub cache: Option<bool>,
    pub cache_ttl: Option<Duration>,
    pub dedup: Option<bool>,
    pub debounce: Option<bool>,
    pub retry: Option<RetryPolicy>,
    /// Per-attempt transport deadline
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("priority", &self.priority)
            .field("cache", &self.cache)
            .field("cache_ttl", &self.cache_ttl)
            .field("dedup", &self.dedup)
            .field("debounce", &self.debounce)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = Some(enabled);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn dedup(mut self, enabled: bool) -> Self {
        self.dedup = Some(enabled);
        self
    }

    pub fn debounce(mut self, enabled: bool) -> Self {
        self.debounce = Some(enabled);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(RetryPolicy::new(config));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_success(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&crate::Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// One entry of [`Engine::call_batch`](super::Engine::call_batch)
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub method: String,
    pub params: Value,
    pub options: CallOptions,
}

impl BatchCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            options: CallOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rest_get_puts_params_in_query() {
        let d = MethodDescriptor::rest("listUsers", HttpMethod::Get, "/users");
        let spec = d.build_request(&json!({"page": 2, "q": "ada"})).unwrap();
        assert_eq!(spec.full_url(), "/users?page=2&q=ada");
        assert!(spec.body.is_none());
    }

    #[test]
    fn test_rest_post_sends_body() {
        let d = MethodDescriptor::rest("createUser", HttpMethod::Post, "/users");
        let spec = d.build_request(&json!({"name": "ada"})).unwrap();
        assert_eq!(spec.method, HttpMethod::Post);
        assert_eq!(spec.body, Some(json!({"name": "ada"})));
    }

    #[test]
    fn test_builder_overrides() {
        let d = MethodDescriptor::rest("m", HttpMethod::Get, "/m")
            .cache_ttl(Duration::from_secs(5))
            .debounce(Duration::from_millis(100))
            .dedup(false)
            .unqueued()
            .priority(7);
        assert_eq!(d.cache.unwrap().ttl, Some(Duration::from_secs(5)));
        assert_eq!(d.debounce, Some(Duration::from_millis(100)));
        assert_eq!(d.dedup, Some(false));
        assert_eq!(d.queued, Some(false));
        assert_eq!(d.priority, Some(7));
        assert!(!d.clone().no_cache().cache.unwrap().enabled);
    }

    #[test]
    fn test_call_options_cancellation() {
        let token = CancellationToken::new();
        let opts = CallOptions::new().cancel(token.clone());
        assert!(!opts.is_cancelled());
        token.cancel();
        assert!(opts.is_cancelled());
    }
}
