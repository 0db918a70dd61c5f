//! The call orchestrator.
//!
//! Every call walks the same pipeline:
//!
//! ```text
//! cache ─► dedup ─► debounce ─► circuit breaker ─► queue ─┐
//!                                                         ▼
//!           cache write ◄── middleware ◄── transport ◄── throttle
//!                                              ▲            │
//!                                              └── retry ◄──┘
//! ```
//!
//! The breaker is checked once per call, before queue admission. Every failed
//! attempt counts as a breaker failure and the final success is recorded once.
//! Everything after the dedup stage runs once per shared in-flight call and is
//! owned by a `'static` future, so it holds the engine through an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::context::CallContext;
use super::descriptor::{BatchCall, CallOptions, MethodDescriptor};
use super::middleware::{ErrorMiddleware, MiddlewareChain, RequestMiddleware, ResponseMiddleware};
use super::plugin::{Plugin, PluginRegistry};
use crate::adapters::LoggingEventPublisher;
use crate::cache::{cache_key, CacheManager, CacheStats};
use crate::config::EngineConfig;
use crate::debounce::{DebounceStats, Debouncer};
use crate::dedup::{DedupStats, Deduplicator};
use crate::domain::events::EngineEvent;
use crate::domain::ports::{EventPublisher, Storage, Transport, TransportResponse};
use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintStats, Fingerprinter};
use crate::metrics::{outcome, EngineMetrics};
use crate::pool::{PoolStats, TieredPool};
use crate::queue::{QueueStats, RequestQueue};
use crate::resilience::circuit_breaker;
use crate::resilience::{
    BreakerStats, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
    CircuitTransition, RetryPolicy,
};
use crate::throttle::{ThrottleStats, Throttler};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Adapt the context pool every this many calls
const POOL_ADAPT_EVERY: u64 = 256;

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct CallCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    retries: AtomicU64,
}

/// Call counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub recovered: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub retries: u64,
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub name: String,
    pub engine_id: u64,
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub destroyed: bool,
    pub methods: usize,
    pub plugins: Vec<String>,
    pub calls: CallStats,
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub debounce: DebounceStats,
    pub queue: QueueStats,
    pub throttle: ThrottleStats,
    pub circuit_breakers: BreakerStats,
    pub pool: PoolStats,
    pub fingerprint: FingerprintStats,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    storage: Option<Arc<dyn Storage>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport.name())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Backing store for the persistent cache mode
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(publisher);
        self
    }

    /// Validate the configuration and start the engine.
    ///
    /// Background sweepers are spawned only when called inside a tokio
    /// runtime.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let config = self.config;
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);

        let mut cache = CacheManager::new(config.cache.clone());
        if let Some(storage) = self.storage {
            cache = cache.with_storage(storage);
        }

        let inner = Arc::new(EngineInner {
            id,
            transport: self.transport,
            methods: RwLock::new(HashMap::new()),
            cache,
            dedup: Deduplicator::new(config.dedup.clone()),
            debounce: Debouncer::new(config.debounce.clone()),
            queue: RequestQueue::new(config.queue.clone()),
            throttle: Throttler::new(config.throttle.clone()),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            retry: RetryPolicy::new(config.retry.clone()),
            fingerprinter: Fingerprinter::new(config.fingerprint.clone()),
            contexts: TieredPool::new(config.pool.clone(), move || CallContext::new(id)),
            middleware: MiddlewareChain::default(),
            plugins: PluginRegistry::default(),
            events: RwLock::new(
                self.events
                    .unwrap_or_else(|| Arc::new(LoggingEventPublisher::new())),
            ),
            metrics: EngineMetrics::new()?,
            counters: CallCounters::default(),
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            sweepers: Mutex::new(Vec::new()),
            created_at: Utc::now(),
            config,
        });

        inner.start_sweepers();
        info!(
            engine = %inner.config.name,
            id,
            transport = %inner.transport.name(),
            cache_mode = ?inner.config.cache.mode,
            "Engine created"
        );
        Ok(Engine { inner })
    }
}

// =============================================================================
// Engine
// =============================================================================

struct EngineInner {
    id: u64,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    methods: RwLock<HashMap<String, Arc<MethodDescriptor>>>,
    cache: CacheManager,
    dedup: Deduplicator<Option<Value>>,
    debounce: Debouncer,
    queue: RequestQueue,
    throttle: Throttler,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    fingerprinter: Fingerprinter,
    contexts: TieredPool<CallContext>,
    middleware: MiddlewareChain,
    plugins: PluginRegistry,
    events: RwLock<Arc<dyn EventPublisher>>,
    metrics: EngineMetrics,
    counters: CallCounters,
    shutdown: CancellationToken,
    destroyed: AtomicBool,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    created_at: DateTime<Utc>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Everything resolved for one call before it leaves the caller
struct CallPlan {
    descriptor: Arc<MethodDescriptor>,
    params: Value,
    key: String,
    cache: bool,
    cache_ttl: Option<Duration>,
    debounce: Option<Duration>,
    retry: RetryPolicy,
    breaker: CircuitBreakerConfig,
    queued: bool,
    priority: i32,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl CallPlan {
    fn method(&self) -> &str {
        &self.descriptor.name
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// Returns the context to the pool and drops its fingerprint memo
struct ContextGuard<'a> {
    inner: &'a EngineInner,
    ctx: Option<CallContext>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.inner.fingerprinter.invalidate(ctx.id());
            self.inner.contexts.release(ctx);
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn cancelled_error(method: &str) -> Error {
    Error::Cancelled(format!("{} cancelled by caller", method))
}

fn status_error(response: &TransportResponse) -> Error {
    let message = response
        .data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("request failed");
    Error::http(response.status, message)
}

impl EngineInner {
    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(Error::EngineDestroyed)
        } else {
            Ok(())
        }
    }

    fn descriptor(&self, method: &str) -> Result<Arc<MethodDescriptor>> {
        self.methods
            .read()
            .get(method)
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(method.to_string()))
    }

    fn start_sweepers(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(engine = %self.config.name, "No tokio runtime, background sweepers disabled");
            return;
        }
        let token = &self.shutdown;
        let handles = [
            self.cache.spawn_sweeper(token.child_token()),
            self.dedup.spawn_sweeper(token.child_token()),
            self.debounce.spawn_sweeper(token.child_token()),
            self.throttle.spawn_sweeper(token.child_token()),
            circuit_breaker::spawn_sweeper(self.breakers.clone(), token.child_token()),
        ];
        self.sweepers.lock().extend(handles.into_iter().flatten());
    }

    async fn publish(&self, event: EngineEvent) {
        let publisher = self.events.read().clone();
        if let Err(e) = publisher.publish(event).await {
            warn!(error = %e, "Failed to publish engine event");
        }
    }

    /// Publish from synchronous code
    fn publish_detached(&self, event: EngineEvent) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let publisher = self.events.read().clone();
            handle.spawn(async move {
                if let Err(e) = publisher.publish(event).await {
                    warn!(error = %e, "Failed to publish engine event");
                }
            });
        }
    }

    async fn on_transition(&self, transition: CircuitTransition) {
        self.metrics
            .record_transition(&transition.method, &transition.to.to_string());
        self.publish(EngineEvent::circuit_state_changed(
            transition.method,
            transition.from,
            transition.to,
        ))
        .await;
    }

    fn plan(
        &self,
        descriptor: Arc<MethodDescriptor>,
        params: Value,
        key: String,
        options: &CallOptions,
    ) -> CallPlan {
        let cache_override = descriptor.cache;
        let cache = self.cache.is_enabled()
            && options
                .cache
                .or(cache_override.map(|c| c.enabled))
                .unwrap_or(true);
        let cache_ttl = options
            .cache_ttl
            .or(cache_override.and_then(|c| c.ttl));

        let debounce = (self.config.debounce.enabled
            && options.debounce.unwrap_or(descriptor.debounce.is_some()))
        .then(|| descriptor.debounce.unwrap_or_else(|| self.debounce.default_delay()));

        let retry = options
            .retry
            .clone()
            .or_else(|| descriptor.retry.clone())
            .unwrap_or_else(|| self.retry.clone());
        let breaker = descriptor
            .circuit_breaker
            .clone()
            .unwrap_or_else(|| self.breakers.config().clone());

        let queued = self.queue.is_enabled() && descriptor.queued.unwrap_or(true);
        let priority = options
            .priority
            .or(descriptor.priority)
            .unwrap_or_else(|| self.queue.default_priority());
        let timeout = options
            .timeout
            .or(self.config.default_timeout_ms.map(Duration::from_millis));

        CallPlan {
            descriptor,
            params,
            key,
            cache,
            cache_ttl,
            debounce,
            retry,
            breaker,
            queued,
            priority,
            timeout,
            cancel: options.cancel.clone(),
        }
    }

    /// Debounce stage; runs once per shared in-flight call.
    ///
    /// Resolves to `Ok(None)` when a newer call for the method supersedes
    /// this one, which releases the in-flight entry.
    async fn execute(self: Arc<Self>, plan: CallPlan) -> Result<Option<Value>> {
        match plan.debounce {
            Some(delay) => {
                let method = plan.method().to_string();
                let this = self.clone();
                self.debounce
                    .try_execute(&method, delay, move || this.admit(plan))
                    .await
                    .transpose()
            }
            None => self.admit(plan).await.map(Some),
        }
    }

    /// Breaker gate and queue admission
    async fn admit(self: Arc<Self>, plan: CallPlan) -> Result<Value> {
        match self.breakers.check_with(plan.method(), &plan.breaker) {
            Ok(Some(transition)) => self.on_transition(transition).await,
            Ok(None) => {}
            Err(error) => {
                debug!(method = %plan.method(), "Rejected by open circuit");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_call(plan.method(), outcome::ERROR);
                self.publish(EngineEvent::call_failed(plan.method(), &error, 0))
                    .await;
                return Err(error);
            }
        }

        if !plan.queued {
            return self.run(plan).await;
        }
        let this = self.clone();
        let queued = self.queue.enqueue(plan.priority, move || this.run(plan));
        self.metrics.set_queue_depth(self.queue.size());
        let result = queued.await;
        self.metrics.set_queue_depth(self.queue.size());
        result
    }

    /// Retry loop, then the cache write and completion bookkeeping
    async fn run(self: Arc<Self>, plan: CallPlan) -> Result<Value> {
        let method = plan.method();
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut previous_delay = None;

        let settled = loop {
            if let Err(error) = self.wait_for_token(&plan).await {
                break Err(error);
            }

            let error = match self.attempt(&plan, attempt).await {
                Ok(value) => {
                    if let Some(t) = self.breakers.record_success_with(method, &plan.breaker) {
                        self.on_transition(t).await;
                    }
                    break Ok((value, false));
                }
                Err(error) => error,
            };

            if error.is_caller_side() {
                break Err(error);
            }
            if let Some(t) = self.breakers.record_failure_with(method, &plan.breaker) {
                self.on_transition(t).await;
            }

            if let Some(value) = self.middleware.recover(method, &error, attempt).await {
                self.publish(EngineEvent::call_recovered(method, &error))
                    .await;
                break self
                    .middleware
                    .run_response(method, value)
                    .await
                    .map(|v| (v, true));
            }

            if !plan.retry.should_retry(&error, attempt, started.elapsed()) {
                break Err(error);
            }

            let delay = plan.retry.next_delay(attempt, previous_delay);
            previous_delay = Some(delay);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_retry(method);
            debug!(
                method = %method,
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = %error.code(),
                "Retrying failed attempt"
            );
            self.publish(EngineEvent::retry_scheduled(method, attempt + 1, delay, &error))
                .await;

            if let Err(e) = self.backoff(&plan, delay).await {
                break Err(e);
            }
            attempt += 1;
        };

        let attempts = attempt + 1;
        let elapsed = started.elapsed();
        self.metrics.observe_duration(method, elapsed.as_secs_f64());

        match settled {
            Ok((value, recovered)) => {
                if plan.cache && !plan.is_cancelled() {
                    self.cache
                        .set(&plan.key, value.clone(), plan.cache_ttl)
                        .await;
                }
                if recovered {
                    self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_call(method, outcome::RECOVERED);
                } else {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_call(method, outcome::SUCCESS);
                }
                self.publish(EngineEvent::call_succeeded(method, attempts, elapsed))
                    .await;
                Ok(value)
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_call(method, outcome::ERROR);
                debug!(method = %method, attempts, code = %error.code(), error = %error, "Call failed");
                self.publish(EngineEvent::call_failed(method, &error, attempts))
                    .await;
                Err(error)
            }
        }
    }

    async fn wait_for_token(&self, plan: &CallPlan) -> Result<()> {
        if !self.throttle.is_enabled() {
            return Ok(());
        }
        tokio::select! {
            result = self.throttle.acquire() => result,
            _ = self.shutdown.cancelled() => Err(Error::EngineDestroyed),
            _ = cancelled(plan.cancel.as_ref()) => Err(cancelled_error(plan.method())),
        }
    }

    async fn backoff(&self, plan: &CallPlan, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.shutdown.cancelled() => Err(Error::EngineDestroyed),
            _ = cancelled(plan.cancel.as_ref()) => Err(cancelled_error(plan.method())),
        }
    }

    /// One transport round-trip plus response post-processing
    async fn attempt(&self, plan: &CallPlan, attempt: u32) -> Result<Value> {
        let method = plan.method();
        let mut request = plan.descriptor.build_request(&plan.params)?;
        if plan.timeout.is_some() {
            request.timeout = plan.timeout;
        }
        request.cancel = plan.cancel.clone();
        let request = self.middleware.run_request(method, request).await?;

        let timeout = request.timeout;
        let transport = self.transport.clone();
        let exchange = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, transport.request(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        operation: format!("{} attempt {}", method, attempt + 1),
                        duration: limit,
                    }),
                },
                None => transport.request(request).await,
            }
        };

        let response = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(Error::EngineDestroyed),
            _ = cancelled(plan.cancel.as_ref()) => return Err(cancelled_error(method)),
            response = exchange => response?,
        };
        if response.status >= 400 {
            return Err(status_error(&response));
        }

        let mut data = response.data;
        if let Some(transform) = &plan.descriptor.transform {
            data = transform(data)?;
        }
        if let Some(validate) = &plan.descriptor.validate {
            validate(&data).map_err(|reason| Error::Validation {
                method: method.to_string(),
                reason,
            })?;
        }
        self.middleware.run_response(method, data).await
    }
}

/// Client-side API call orchestrator.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("methods", &self.inner.methods.read().len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Engine {
    pub fn builder(transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            transport,
            storage: None,
            events: None,
        }
    }

    /// Build an engine with `config` and no persistent storage
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(transport).config(config).build()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Invoke a registered method.
    ///
    /// A cancelled call resolves to `Cancelled` and skips the cache write and
    /// the success callback, even if a shared in-flight result arrives.
    #[instrument(skip_all, fields(method = %method))]
    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        let mut result = self.call_inner(method, params, &options).await;
        if result.is_ok() && options.is_cancelled() {
            result = Err(cancelled_error(method));
        }
        match &result {
            Ok(value) => {
                if let Some(on_success) = &options.on_success {
                    on_success(value);
                }
            }
            Err(error) => {
                if let Some(on_error) = &options.on_error {
                    on_error(error);
                }
            }
        }
        result
    }

    async fn call_inner(&self, method: &str, params: Value, options: &CallOptions) -> Result<Value> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let descriptor = inner.descriptor(method)?;
        if options.is_cancelled() {
            return Err(cancelled_error(method));
        }
        let total = inner.counters.total.fetch_add(1, Ordering::Relaxed) + 1;
        if total % POOL_ADAPT_EVERY == 0 {
            inner.contexts.adapt();
        }

        let mut ctx = inner.contexts.acquire();
        ctx.bind(method, params);
        let fingerprint = inner
            .fingerprinter
            .fingerprint_tracked(ctx.id(), ctx.params());
        let params = ctx.params().clone();
        let _ctx = ContextGuard {
            inner,
            ctx: Some(ctx),
        };

        let plan = inner.plan(
            descriptor.clone(),
            params,
            cache_key(method, &fingerprint),
            options,
        );

        if plan.cache {
            if let Some(value) = inner.cache.get(&plan.key).await {
                inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                inner.metrics.record_cache(method, true);
                inner.metrics.record_call(method, outcome::CACHED);
                debug!(key = %plan.key, "Cache hit");
                inner
                    .publish(EngineEvent::cache_hit(method, plan.key.as_str()))
                    .await;
                return Ok(value);
            }
            inner.metrics.record_cache(method, false);
            inner
                .publish(EngineEvent::cache_miss(method, plan.key.as_str()))
                .await;
        }

        let dedup = options.dedup.or(descriptor.dedup).unwrap_or(true);
        let key = plan.key.clone();
        let work = {
            let inner = inner.clone();
            move || inner.execute(plan)
        };
        let settled = if dedup {
            let (result, joined) = inner.dedup.execute_joined(&key, work).await;
            if joined {
                inner.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                inner.metrics.record_dedup_join();
                inner.metrics.record_call(method, outcome::DEDUPLICATED);
                debug!(key = %key, "Joined in-flight call");
                inner
                    .publish(EngineEvent::dedup_joined(method, key.as_str()))
                    .await;
            }
            result
        } else {
            work().await
        };

        match settled? {
            Some(value) => Ok(value),
            // Superseded by a newer debounced call: the caller is abandoned
            None => std::future::pending().await,
        }
    }

    /// Run several calls concurrently; results keep the input order
    pub async fn call_batch(&self, calls: Vec<BatchCall>) -> Vec<Result<Value>> {
        join_all(calls.into_iter().map(|c| async move {
            self.call(&c.method, c.params, c.options).await
        }))
        .await
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a method; returns `true` if it replaced an existing one
    pub fn register(&self, descriptor: MethodDescriptor) -> Result<bool> {
        self.inner.ensure_alive()?;
        let name = descriptor.name.clone();
        if name.is_empty() {
            return Err(Error::Config("method name must not be empty".to_string()));
        }

        let replaced = self
            .inner
            .methods
            .write()
            .insert(name.clone(), Arc::new(descriptor))
            .is_some();
        if replaced {
            warn!(method = %name, "Method re-registered, previous descriptor replaced");
        } else {
            debug!(method = %name, "Method registered");
        }
        self.inner
            .publish_detached(EngineEvent::method_registered(name, replaced));
        Ok(replaced)
    }

    /// Register several methods; returns how many were registered
    pub fn register_batch(
        &self,
        descriptors: impl IntoIterator<Item = MethodDescriptor>,
    ) -> Result<usize> {
        let mut count = 0;
        for descriptor in descriptors {
            self.register(descriptor)?;
            count += 1;
        }
        Ok(count)
    }

    /// Remove a method and its breaker state
    pub fn unregister(&self, method: &str) -> Result<bool> {
        self.inner.ensure_alive()?;
        let removed = self.inner.methods.write().remove(method).is_some();
        if removed {
            self.inner.breakers.reset(method);
            debug!(method = %method, "Method unregistered");
        }
        Ok(removed)
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.inner.methods.read().contains_key(method)
    }

    /// Registered method names, sorted
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    // =========================================================================
    // Middleware & Plugins
    // =========================================================================

    pub fn use_request_middleware(&self, middleware: Arc<dyn RequestMiddleware>) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.middleware.push_request(middleware);
        Ok(())
    }

    pub fn use_response_middleware(&self, middleware: Arc<dyn ResponseMiddleware>) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.middleware.push_response(middleware);
        Ok(())
    }

    pub fn use_error_middleware(&self, middleware: Arc<dyn ErrorMiddleware>) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.middleware.push_error(middleware);
        Ok(())
    }

    /// Install a plugin; returns `false` if it was already installed
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<bool> {
        self.inner.ensure_alive()?;
        let name = plugin.name().to_string();
        if self.inner.plugins.is_installed(&name) {
            debug!(plugin = %name, "Plugin already installed");
            return Ok(false);
        }
        self.inner.plugins.check_dependencies(plugin.as_ref())?;
        plugin.install(self)?;
        self.inner.plugins.add(plugin);

        info!(plugin = %name, "Plugin installed");
        self.inner
            .publish_detached(EngineEvent::plugin_installed(name));
        Ok(true)
    }

    /// Uninstall a plugin; refused while an installed plugin depends on it
    pub fn remove_plugin(&self, name: &str) -> Result<bool> {
        self.inner.ensure_alive()?;
        let Some(plugin) = self.inner.plugins.get(name) else {
            return Ok(false);
        };
        if let Some(dependent) = self.inner.plugins.dependent_of(name) {
            return Err(Error::PluginDependency {
                plugin: dependent,
                dependency: name.to_string(),
            });
        }
        plugin.uninstall(self)?;
        self.inner.plugins.remove(name);

        info!(plugin = %name, "Plugin uninstalled");
        self.inner
            .publish_detached(EngineEvent::plugin_uninstalled(name));
        Ok(true)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.plugins.names()
    }

    pub fn set_event_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        *self.inner.events.write() = publisher;
    }

    // =========================================================================
    // Cache, Breakers, Debounce
    // =========================================================================

    /// Drop the cached response of one call
    pub async fn invalidate(&self, method: &str, params: &Value) -> Result<bool> {
        self.inner.ensure_alive()?;
        let fingerprint = self.inner.fingerprinter.generate_fingerprint(params);
        Ok(self
            .inner
            .cache
            .invalidate(&cache_key(method, &fingerprint))
            .await)
    }

    /// Clear one method's cached responses, or everything with `None`
    pub async fn clear_cache(&self, method: Option<&str>) -> Result<usize> {
        self.inner.ensure_alive()?;
        match method {
            Some(method) => Ok(self.inner.cache.clear_method(method).await),
            None => {
                let entries = self.inner.cache.stats().memory.entries;
                self.inner.cache.clear().await;
                Ok(entries)
            }
        }
    }

    pub fn circuit_state(&self, method: &str) -> CircuitState {
        self.inner.breakers.state(method)
    }

    pub fn circuit_snapshot(&self, method: &str) -> Option<CircuitSnapshot> {
        self.inner.breakers.snapshot(method)
    }

    pub fn reset_circuit(&self, method: &str) -> Result<bool> {
        self.inner.ensure_alive()?;
        Ok(self.inner.breakers.reset(method))
    }

    /// Run a method's pending debounced call now
    pub fn flush_debounce(&self, method: &str) -> Result<bool> {
        self.inner.ensure_alive()?;
        Ok(self.inner.debounce.flush(method))
    }

    /// Turn rate limiting on or off at runtime
    pub fn set_throttling(&self, enabled: bool) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.throttle.set_enabled(enabled);
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.size()
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let c = &inner.counters;
        EngineStats {
            name: inner.config.name.clone(),
            engine_id: inner.id,
            created_at: inner.created_at,
            timestamp: Utc::now(),
            destroyed: self.is_destroyed(),
            methods: inner.methods.read().len(),
            plugins: inner.plugins.names(),
            calls: CallStats {
                total: c.total.load(Ordering::Relaxed),
                succeeded: c.succeeded.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
                recovered: c.recovered.load(Ordering::Relaxed),
                cache_hits: c.cache_hits.load(Ordering::Relaxed),
                deduplicated: c.deduplicated.load(Ordering::Relaxed),
                retries: c.retries.load(Ordering::Relaxed),
            },
            cache: inner.cache.stats(),
            dedup: inner.dedup.stats(),
            debounce: inner.debounce.stats(),
            queue: inner.queue.stats(),
            throttle: inner.throttle.stats(),
            circuit_breakers: inner.breakers.stats(),
            pool: inner.contexts.stats(),
            fingerprint: inner.fingerprinter.stats(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Tear the engine down.
    ///
    /// Uninstalls plugins in reverse installation order, rejects queued,
    /// throttled and debounced work, aborts in-flight attempts and stops the
    /// sweepers. Idempotent; returns the number of operations rejected by
    /// this call.
    pub fn destroy(&self) -> usize {
        let inner = &self.inner;
        if self.is_destroyed() {
            return 0;
        }

        // Hooks still see a live engine
        for plugin in inner.plugins.drain() {
            if let Err(e) = plugin.uninstall(self) {
                warn!(plugin = %plugin.name(), error = %e, "Plugin uninstall failed during destroy");
            } else {
                debug!(plugin = %plugin.name(), "Plugin uninstalled");
            }
        }

        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        inner.shutdown.cancel();
        let rejected = inner.queue.destroy() + inner.debounce.destroy() + inner.throttle.destroy();
        for handle in inner.sweepers.lock().drain(..) {
            handle.abort();
        }

        inner.dedup.clear();
        inner.fingerprinter.clear();
        inner.contexts.clear();
        inner.middleware.clear();
        inner.methods.write().clear();

        info!(engine = %inner.config.name, id = inner.id, rejected, "Engine destroyed");
        inner.publish_detached(EngineEvent::engine_destroyed(rejected));
        rejected
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, Scripted, ScriptedTransport};
    use crate::domain::ports::HttpMethod;
    use crate::error::ErrorCode;
    use crate::resilience::RetryConfig;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn engine_with(transport: Arc<ScriptedTransport>, config: EngineConfig) -> Engine {
        Engine::new(config, transport).unwrap()
    }

    fn get_user() -> MethodDescriptor {
        MethodDescriptor::rest("getUser", HttpMethod::Get, "/users")
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let engine = engine_with(Arc::new(ScriptedTransport::new([])), EngineConfig::default());
        assert_matches!(
            engine.call("nope", json!({}), CallOptions::default()).await,
            Err(Error::MethodNotFound(m)) if m == "nope"
        );
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() {
        let transport = Arc::new(ScriptedTransport::new([Scripted::ok(json!({"id": 1}))]));
        let engine = engine_with(transport.clone(), EngineConfig::default());
        engine.register(get_user()).unwrap();

        let first = engine.call("getUser", json!({"id": 1}), CallOptions::default()).await;
        let second = engine.call("getUser", json!({"id": 1}), CallOptions::default()).await;

        assert_eq!(first.unwrap(), json!({"id": 1}));
        assert_eq!(second.unwrap(), json!({"id": 1}));
        assert_eq!(transport.calls(), 1);
        assert_eq!(engine.stats().calls.cache_hits, 1);
        assert!(engine.invalidate("getUser", &json!({"id": 1})).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_cache_override() {
        let transport = Arc::new(ScriptedTransport::new([]));
        let engine = engine_with(transport.clone(), EngineConfig::default());
        engine.register(get_user().no_cache()).unwrap();

        for _ in 0..3 {
            engine.call("getUser", json!({}), CallOptions::default()).await.unwrap();
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_status_error_is_not_cached() {
        let transport = Arc::new(ScriptedTransport::new([Scripted::status(404)]));
        let engine = engine_with(transport.clone(), EngineConfig::default());
        engine.register(get_user()).unwrap();

        let err = engine
            .call("getUser", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        engine.call("getUser", json!({}), CallOptions::default()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_transform_and_validate() {
        let transport = Arc::new(ScriptedTransport::new([
            Scripted::ok(json!({"user": {"name": "ada"}})),
            Scripted::ok(json!({"nothing": true})),
        ]));
        let engine = engine_with(transport, EngineConfig::default());
        engine
            .register(
                get_user()
                    .no_cache()
                    .transform(|v| Ok(v["user"].clone()))
                    .validate(|v| {
                        if v.is_object() {
                            Ok(())
                        } else {
                            Err("missing user".to_string())
                        }
                    }),
            )
            .unwrap();

        let ok = engine.call("getUser", json!({}), CallOptions::default()).await;
        assert_eq!(ok.unwrap(), json!({"name": "ada"}));

        assert_matches!(
            engine.call("getUser", json!({}), CallOptions::default()).await,
            Err(Error::Validation { reason, .. }) if reason == "missing user"
        );
    }

    #[tokio::test]
    async fn test_callbacks() {
        let transport = Arc::new(ScriptedTransport::new([
            Scripted::ok(json!(1)),
            Scripted::status(500),
        ]));
        let engine = engine_with(transport, EngineConfig::default());
        engine.register(get_user().no_cache()).unwrap();

        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let options = {
            let (s, e) = (successes.clone(), errors.clone());
            CallOptions::new()
                .on_success(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_| {
                    e.fetch_add(1, Ordering::SeqCst);
                })
        };

        engine.call("getUser", json!({}), options.clone()).await.unwrap();
        engine.call("getUser", json!({}), options).await.unwrap_err();
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_per_attempt() {
        let transport = Arc::new(ScriptedTransport::new([
            Scripted::ok(json!("slow")).delayed(Duration::from_secs(5)),
        ]));
        let engine = engine_with(transport, EngineConfig::default());
        engine.register(get_user()).unwrap();

        assert_matches!(
            engine
                .call("getUser", json!({}), CallOptions::new().timeout(Duration::from_millis(100)))
                .await,
            Err(Error::Timeout { duration, .. }) if duration == Duration::from_millis(100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_cache_write() {
        let transport = Arc::new(ScriptedTransport::new([
            Scripted::ok(json!("late")).delayed(Duration::from_millis(500)),
        ]));
        let engine = engine_with(transport.clone(), EngineConfig::default());
        engine.register(get_user()).unwrap();

        let token = CancellationToken::new();
        let call = {
            let engine = engine.clone();
            let options = CallOptions::new().cancel(token.clone());
            tokio::spawn(async move { engine.call("getUser", json!({}), options).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        assert_matches!(call.await.unwrap(), Err(Error::Cancelled(_)));
        assert_eq!(engine.cache_stats().memory.entries, 0);
    }

    #[tokio::test]
    async fn test_error_middleware_recovers_and_skips_retries() {
        let transport = Arc::new(ScriptedTransport::new([Scripted::status(503)]));
        let engine = engine_with(transport.clone(), EngineConfig::default());
        engine
            .register(get_user().retry(RetryConfig::fixed(3, Duration::ZERO)))
            .unwrap();
        engine
            .use_error_middleware(Arc::new(crate::engine::FallbackMiddleware::new(
                [ErrorCode::ServerError],
                json!({"fallback": true}),
            )))
            .unwrap();

        let value = engine
            .call("getUser", json!({}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!({"fallback": true}));
        assert_eq!(transport.calls(), 1);
        assert_eq!(engine.stats().calls.recovered, 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_rejects_without_transport() {
        let transport = Arc::new(ScriptedTransport::new([]).with_fallback(Scripted::status(500)));
        let engine = engine_with(transport.clone(), EngineConfig::default());
        engine
            .register(get_user().no_cache().circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            }))
            .unwrap();

        for _ in 0..2 {
            engine.call("getUser", json!({}), CallOptions::default()).await.unwrap_err();
        }
        assert_eq!(engine.circuit_state("getUser"), CircuitState::Open);

        assert_matches!(
            engine.call("getUser", json!({}), CallOptions::default()).await,
            Err(Error::CircuitOpen { .. })
        );
        assert_eq!(transport.calls(), 2);

        engine.reset_circuit("getUser").unwrap();
        assert_eq!(engine.circuit_state("getUser"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_events_published() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let transport = Arc::new(ScriptedTransport::new([]));
        let engine = Engine::builder(transport)
            .event_publisher(collector.clone())
            .build()
            .unwrap();
        engine.register(get_user()).unwrap();

        engine.call("getUser", json!({}), CallOptions::default()).await.unwrap();
        engine.call("getUser", json!({}), CallOptions::default()).await.unwrap();

        assert_eq!(collector.count_of("CacheMiss"), 1);
        assert_eq!(collector.count_of("CallSucceeded"), 1);
        assert_eq!(collector.count_of("CacheHit"), 1);
    }

    struct Named {
        name: &'static str,
        deps: Vec<String>,
    }

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn install(&self, engine: &Engine) -> Result<()> {
            engine.register(MethodDescriptor::rest(
                format!("{}.ping", self.name),
                HttpMethod::Get,
                "/ping",
            ))?;
            Ok(())
        }

        fn uninstall(&self, engine: &Engine) -> Result<()> {
            engine.unregister(&format!("{}.ping", self.name))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_plugin_dependencies() {
        let engine = engine_with(Arc::new(ScriptedTransport::new([])), EngineConfig::default());
        let auth = Arc::new(Named { name: "auth", deps: vec![] });
        let billing = Arc::new(Named {
            name: "billing",
            deps: vec!["auth".to_string()],
        });

        assert_matches!(
            engine.use_plugin(billing.clone()),
            Err(Error::PluginDependency { plugin, dependency }) if plugin == "billing" && dependency == "auth"
        );

        assert!(engine.use_plugin(auth.clone()).unwrap());
        assert!(!engine.use_plugin(auth).unwrap());
        assert!(engine.use_plugin(billing).unwrap());
        assert!(engine.has_method("billing.ping"));

        assert_matches!(
            engine.remove_plugin("auth"),
            Err(Error::PluginDependency { plugin, .. }) if plugin == "billing"
        );
        assert!(engine.remove_plugin("billing").unwrap());
        assert!(!engine.has_method("billing.ping"));
        assert!(engine.remove_plugin("auth").unwrap());
        assert!(engine.plugin_names().is_empty());
    }

    #[tokio::test]
    async fn test_register_overwrites() {
        let engine = engine_with(Arc::new(ScriptedTransport::new([])), EngineConfig::default());
        assert!(!engine.register(get_user()).unwrap());
        assert!(engine.register(get_user()).unwrap());
        assert_eq!(
            engine
                .register_batch([
                    MethodDescriptor::rest("a", HttpMethod::Get, "/a"),
                    MethodDescriptor::rest("b", HttpMethod::Get, "/b"),
                ])
                .unwrap(),
            2
        );
        assert_eq!(engine.method_names(), vec!["a", "b", "getUser"]);
        assert!(engine.unregister("a").unwrap());
        assert!(!engine.has_method("a"));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_final() {
        let engine = engine_with(Arc::new(ScriptedTransport::new([])), EngineConfig::default());
        engine.register(get_user()).unwrap();

        engine.destroy();
        assert_eq!(engine.destroy(), 0);
        assert!(engine.is_destroyed());
        assert_matches!(
            engine.call("getUser", json!({}), CallOptions::default()).await,
            Err(Error::EngineDestroyed)
        );
        assert_matches!(engine.register(get_user()), Err(Error::EngineDestroyed));
        assert!(engine.stats().destroyed);
    }

    struct Recording {
        name: &'static str,
        deps: Vec<String>,
        uninstalled: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Plugin for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn install(&self, engine: &Engine) -> Result<()> {
            engine.register(MethodDescriptor::rest(self.name, HttpMethod::Get, "/ping"))?;
            Ok(())
        }

        fn uninstall(&self, engine: &Engine) -> Result<()> {
            engine.unregister(self.name)?;
            self.uninstalled.lock().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_destroy_uninstalls_plugins_in_reverse_order() {
        let engine = engine_with(Arc::new(ScriptedTransport::new([])), EngineConfig::default());
        let uninstalled = Arc::new(Mutex::new(Vec::new()));
        engine
            .use_plugin(Arc::new(Recording {
                name: "auth",
                deps: vec![],
                uninstalled: uninstalled.clone(),
            }))
            .unwrap();
        engine
            .use_plugin(Arc::new(Recording {
                name: "billing",
                deps: vec!["auth".to_string()],
                uninstalled: uninstalled.clone(),
            }))
            .unwrap();

        engine.destroy();
        assert_eq!(*uninstalled.lock(), vec!["billing", "auth"]);
        assert!(engine.plugin_names().is_empty());

        engine.destroy();
        assert_eq!(uninstalled.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_debounce_releases_in_flight_entry() {
        let transport = Arc::new(ScriptedTransport::new([]));
        let engine = engine_with(transport.clone(), EngineConfig::default());
        engine
            .register(
                MethodDescriptor::rest("search", HttpMethod::Get, "/search")
                    .no_cache()
                    .debounce(Duration::from_millis(100)),
            )
            .unwrap();

        let e = engine.clone();
        let superseded = tokio::spawn(async move {
            e.call("search", json!({"q": "a"}), CallOptions::default()).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine
            .call("search", json!({"q": "b"}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.stats().dedup.pending, 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let again = tokio::time::timeout(
            Duration::from_secs(5),
            engine.call("search", json!({"q": "a"}), CallOptions::default()),
        )
        .await;
        assert!(again.unwrap().is_ok());
        assert_eq!(transport.calls(), 2);
        assert!(!superseded.is_finished());
        superseded.abort();
    }

    #[test]
    fn test_build_outside_runtime() {
        let engine = Engine::new(EngineConfig::default(), Arc::new(ScriptedTransport::new([])))
            .unwrap();
        engine.register(get_user()).unwrap();
        assert!(engine.has_method("getUser"));
    }
}
