//! Callgate - Client-side API call orchestration
//!
//! Wraps a transport (HTTP or anything implementing [`Transport`]) with the
//! machinery a busy client needs between its code and a remote API: response
//! caching, in-flight deduplication, debouncing, a priority queue, token
//! bucket throttling, retries with backoff and per-method circuit breakers.
//!
//! # Architecture
//!
//! ```text
//! Engine::call(method, params)
//!   │
//!   ├─ Fingerprinter ── cache key ──► CacheManager (LRU + optional Storage)
//!   ├─ Deduplicator (shared in-flight futures)
//!   ├─ Debouncer (per method)
//!   ├─ CircuitBreakerRegistry ──► RequestQueue ──► Throttler
//!   └─ RetryPolicy ⟲ middleware ⟲ Transport
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Transports, storage and event sinks implementing domain ports
//! - [`cache`] - TTL-aware LRU and the cache manager
//! - [`config`] - YAML-loadable engine configuration
//! - [`domain`] - Ports and engine events
//! - [`engine`] - The orchestrator, method descriptors, middleware and plugins
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`resilience`] - Circuit breaker and retry policy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use callgate::adapters::{HttpTransportConfig, ReqwestTransport};
//! use callgate::domain::HttpMethod;
//! use callgate::{CallOptions, Engine, EngineConfig, MethodDescriptor};
//! use serde_json::json;
//!
//! # async fn run() -> callgate::Result<()> {
//! let transport = ReqwestTransport::new(HttpTransportConfig {
//!     base_url: "https://api.example.com".to_string(),
//!     ..Default::default()
//! })?;
//! let engine = Engine::new(EngineConfig::default(), Arc::new(transport))?;
//! engine.register(MethodDescriptor::rest("getUser", HttpMethod::Get, "/users"))?;
//!
//! let user = engine.call("getUser", json!({"id": 1}), CallOptions::default()).await?;
//! println!("{user}");
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod cache;
pub mod config;
pub mod debounce;
pub mod dedup;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod resilience;
pub mod throttle;

// Re-export commonly used types
pub use config::EngineConfig;
pub use domain::{EngineEvent, EventPublisher, Storage, Transport};
pub use engine::{
    BatchCall, CallOptions, Engine, EngineBuilder, EngineStats, MethodDescriptor, Plugin,
};
pub use error::{Error, ErrorCode, Result};
pub use metrics::EngineMetrics;
pub use resilience::{BackoffKind, CircuitBreakerConfig, CircuitState, RetryConfig, RetryPolicy};
