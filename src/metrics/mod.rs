//! Prometheus metrics for the engine.
//!
//! Each [`EngineMetrics`] owns a private [`Registry`], so several engines in
//! one process never collide on metric names. [`EngineMetrics::render`]
//! produces the text exposition format served on `/metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::{Error, Result};

const NAMESPACE: &str = "callgate";

/// Call outcome label values
pub mod outcome {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const RECOVERED: &str = "recovered";
    pub const CACHED: &str = "cached";
    pub const DEDUPLICATED: &str = "deduplicated";
}

/// Engine metrics
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    calls_total: IntCounterVec,
    cache_lookups_total: IntCounterVec,
    retries_total: IntCounterVec,
    circuit_transitions_total: IntCounterVec,
    call_duration_seconds: HistogramVec,
    dedup_joined_total: IntCounter,
    queue_depth: IntGauge,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("families", &self.registry.gather().len())
            .finish()
    }
}

fn register<C: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::Internal(format!("Failed to register metric: {}", e)))?;
    Ok(collector)
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("Invalid metric definition: {}", e))
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let calls_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("calls_total", "Completed calls by method and outcome")
                    .namespace(NAMESPACE),
                &["method", "outcome"],
            )
            .map_err(prom_err)?,
        )?;
        let cache_lookups_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("cache_lookups_total", "Cache lookups by method and result")
                    .namespace(NAMESPACE),
                &["method", "result"],
            )
            .map_err(prom_err)?,
        )?;
        let retries_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("retries_total", "Scheduled retries").namespace(NAMESPACE),
                &["method"],
            )
            .map_err(prom_err)?,
        )?;
        let circuit_transitions_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("circuit_transitions_total", "Circuit breaker state changes")
                    .namespace(NAMESPACE),
                &["method", "to"],
            )
            .map_err(prom_err)?,
        )?;
        let call_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("call_duration_seconds", "Transport-backed call latency")
                    .namespace(NAMESPACE)
                    .buckets(vec![
                        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                    ]),
                &["method"],
            )
            .map_err(prom_err)?,
        )?;
        let dedup_joined_total = register(
            &registry,
            IntCounter::with_opts(
                Opts::new("dedup_joined_total", "Calls that joined an in-flight call")
                    .namespace(NAMESPACE),
            )
            .map_err(prom_err)?,
        )?;
        let queue_depth = register(
            &registry,
            IntGauge::with_opts(
                Opts::new("queue_depth", "Tasks waiting in the request queue")
                    .namespace(NAMESPACE),
            )
            .map_err(prom_err)?,
        )?;

        Ok(Self {
            registry,
            calls_total,
            cache_lookups_total,
            retries_total,
            circuit_transitions_total,
            call_duration_seconds,
            dedup_joined_total,
            queue_depth,
        })
    }

    pub fn record_call(&self, method: &str, outcome: &str) {
        self.calls_total.with_label_values(&[method, outcome]).inc();
    }

    pub fn observe_duration(&self, method: &str, seconds: f64) {
        self.call_duration_seconds
            .with_label_values(&[method])
            .observe(seconds);
    }

    pub fn record_cache(&self, method: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .with_label_values(&[method, result])
            .inc();
    }

    pub fn record_retry(&self, method: &str) {
        self.retries_total.with_label_values(&[method]).inc();
    }

    pub fn record_transition(&self, method: &str, to: &str) {
        self.circuit_transitions_total
            .with_label_values(&[method, to])
            .inc();
    }

    pub fn record_dedup_join(&self) {
        self.dedup_joined_total.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    /// Total calls recorded for `method` with `outcome`
    pub fn calls(&self, method: &str, outcome: &str) -> u64 {
        self.calls_total.with_label_values(&[method, outcome]).get()
    }

    pub fn retries(&self, method: &str) -> u64 {
        self.retries_total.with_label_values(&[method]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}
