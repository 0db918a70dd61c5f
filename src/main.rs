//! Callgate demo runner
//!
//! Fires a burst of calls through an engine and prints its statistics.
//!
//! ```text
//! ┌──────────┐    ┌──────────────────────────────┐    ┌────────────┐
//! │  burst   │───▶│  Engine (cache/dedup/queue/  │───▶│ Transport  │
//! │ of calls │    │  throttle/retry/breaker)     │    │ echo|http  │
//! └──────────┘    └──────────────────────────────┘    └────────────┘
//!                          │
//!                          └──▶ /metrics, /healthz
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use serde_json::json;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use callgate::adapters::{EchoTransport, HttpTransportConfig, ReqwestTransport};
use callgate::domain::{HttpMethod, Transport};
use callgate::engine::RequestIdMiddleware;
use callgate::{CallOptions, Engine, EngineConfig, MethodDescriptor};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Callgate - client-side API call orchestration demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML engine configuration
    #[arg(long, env = "CALLGATE_CONFIG")]
    config: Option<String>,

    /// Target API base URL (uses the in-process echo transport when unset)
    #[arg(long, env = "CALLGATE_BASE_URL")]
    base_url: Option<String>,

    /// Request path called by the demo method
    #[arg(long, env = "CALLGATE_PATH", default_value = "/echo")]
    path: String,

    /// Number of calls in the burst
    #[arg(long, env = "CALLGATE_CALLS", default_value = "100")]
    calls: usize,

    /// Number of distinct parameter sets in the burst
    #[arg(long, env = "CALLGATE_DISTINCT", default_value = "10")]
    distinct: usize,

    /// Echo transport latency in milliseconds
    #[arg(long, env = "CALLGATE_ECHO_LATENCY_MS", default_value = "20")]
    echo_latency_ms: u64,

    /// Serve /metrics and /healthz on this address and keep running
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => EngineConfig::default(),
    };

    let transport: Arc<dyn Transport> = match &args.base_url {
        Some(base_url) => Arc::new(ReqwestTransport::new(HttpTransportConfig {
            base_url: base_url.clone(),
            ..Default::default()
        })?),
        None => Arc::new(EchoTransport::with_latency(Duration::from_millis(
            args.echo_latency_ms,
        ))),
    };

    info!("Starting Callgate");
    info!("  Engine: {}", config.name);
    info!("  Transport: {}", transport.name());
    info!("  Calls: {} ({} distinct)", args.calls, args.distinct);

    let engine = Engine::new(config, transport)?;
    engine.use_request_middleware(Arc::new(RequestIdMiddleware::new()))?;
    engine.register(MethodDescriptor::rest("demo", HttpMethod::Get, args.path.clone()))?;

    let distinct = args.distinct.max(1);
    let results = join_all((0..args.calls).map(|i| {
        let engine = engine.clone();
        async move {
            engine
                .call("demo", json!({ "item": i % distinct }), CallOptions::default())
                .await
        }
    }))
    .await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!("{} of {} calls failed", failed, results.len());
        if let Some(Err(e)) = results.iter().find(|r| r.is_err()) {
            warn!("  First failure: {}", e);
        }
    }

    println!("{}", serde_json::to_string_pretty(&engine.stats())?);

    if let Some(addr) = &args.metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", addr))?;
        let server = tokio::spawn(run_metrics_server(addr, engine.clone()));

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        server.abort();
    }

    let rejected = engine.destroy();
    info!("Callgate shutdown complete ({} pending operations rejected)", rejected);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, engine: Engine) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{header, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        if let Ok(value) = header::HeaderValue::from_str(content_type) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        response
    }

    async fn handle(
        engine: Engine,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match engine.metrics().render() {
                Ok(body) => respond(StatusCode::OK, "text/plain; version=0.0.4", body),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
            },
            "/stats" => match serde_json::to_string(&engine.stats()) {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
            },
            "/healthz" | "/livez" if !engine.is_destroyed() => {
                respond(StatusCode::OK, "text/plain", "ok".to_string())
            }
            "/healthz" | "/livez" => respond(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                "destroyed".to_string(),
            ),
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found".to_string()),
        };
        Ok(response)
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;

        let io = TokioIo::new(stream);
        let engine = engine.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(engine.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
