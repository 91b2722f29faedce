//! LinkStor Daemon
//!
//! Runs a coordinator over in-memory tiers and exposes its health and
//! counters for operators.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          linkstor                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   /healthz   │    │ Coordinator  │───▶│   /metrics   │       │
//! │  │   /readyz    │◀───│ (cache, rl,  │    │ (prometheus) │       │
//! │  │              │    │  queue)      │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use linkstor::{
    Backoff, Coordinator, CoordinatorConfig, CoordinatorStats, RateLimiterConfig, RetryPolicy,
    TtlCacheConfig, WriteQueueConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackoffArg {
    Linear,
    Exponential,
}

impl From<BackoffArg> for Backoff {
    fn from(arg: BackoffArg) -> Self {
        match arg {
            BackoffArg::Linear => Backoff::Linear,
            BackoffArg::Exponential => Backoff::Exponential,
        }
    }
}

/// LinkStor - tiered storage coordinator for short links
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process cache TTL in seconds
    #[arg(long, env = "LINKSTOR_CACHE_TTL_SECONDS", default_value = "300")]
    cache_ttl_seconds: u64,

    /// Cache sweep interval in seconds
    #[arg(long, env = "LINKSTOR_CACHE_SWEEP_SECONDS", default_value = "30")]
    cache_sweep_seconds: u64,

    /// Fast tier TTL in seconds
    #[arg(long, env = "LINKSTOR_FAST_TIER_TTL_SECONDS", default_value = "86400")]
    fast_tier_ttl_seconds: u64,

    /// Requests allowed per client per window
    #[arg(long, env = "LINKSTOR_RATE_LIMIT", default_value = "100")]
    rate_limit: u32,

    /// Rate limit window in seconds
    #[arg(long, env = "LINKSTOR_RATE_WINDOW_SECONDS", default_value = "60")]
    rate_window_seconds: u64,

    /// Idle client eviction horizon in seconds
    #[arg(long, env = "LINKSTOR_IDLE_HORIZON_SECONDS", default_value = "300")]
    idle_horizon_seconds: u64,

    /// Write-behind queue capacity
    #[arg(long, env = "LINKSTOR_QUEUE_CAPACITY", default_value = "200")]
    queue_capacity: usize,

    /// Write-behind worker count
    #[arg(long, env = "LINKSTOR_QUEUE_WORKERS", default_value = "5")]
    queue_workers: usize,

    /// Durable write attempts per item
    #[arg(long, env = "LINKSTOR_RETRY_ATTEMPTS", default_value = "3")]
    retry_attempts: u32,

    /// Base retry delay in milliseconds
    #[arg(long, env = "LINKSTOR_RETRY_BASE_MS", default_value = "1000")]
    retry_base_ms: u64,

    /// Retry backoff growth
    #[arg(long, env = "LINKSTOR_RETRY_BACKOFF", value_enum, default_value = "linear")]
    retry_backoff: BackoffArg,

    /// Deadline for every tier call in milliseconds
    #[arg(long, env = "LINKSTOR_OP_TIMEOUT_MS", default_value = "5000")]
    op_timeout_ms: u64,

    /// Metrics server bind address
    #[arg(long, env = "LINKSTOR_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "LINKSTOR_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn coordinator_config(&self) -> CoordinatorConfig {
        let op_timeout = Duration::from_millis(self.op_timeout_ms);
        let retry = RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            backoff: self.retry_backoff.into(),
            ..Default::default()
        };

        CoordinatorConfig {
            cache: TtlCacheConfig {
                default_ttl: Duration::from_secs(self.cache_ttl_seconds),
                sweep_interval: Duration::from_secs(self.cache_sweep_seconds),
            },
            limiter: RateLimiterConfig {
                rate: self.rate_limit,
                window: Duration::from_secs(self.rate_window_seconds),
                idle_horizon: Duration::from_secs(self.idle_horizon_seconds),
                ..Default::default()
            },
            queue: WriteQueueConfig {
                capacity: self.queue_capacity,
                workers: self.queue_workers,
                op_timeout,
                fast_tier_ttl: Duration::from_secs(self.fast_tier_ttl_seconds),
                retry,
                ..Default::default()
            },
            op_timeout,
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting LinkStor");
    info!("  Cache TTL: {}s", args.cache_ttl_seconds);
    info!(
        "  Rate limit: {} per {}s",
        args.rate_limit, args.rate_window_seconds
    );
    info!(
        "  Write queue: capacity {}, {} workers",
        args.queue_capacity, args.queue_workers
    );

    let config = args.coordinator_config();
    let coordinator =
        Arc::new(Coordinator::in_memory(config).context("invalid coordinator configuration")?);
    let exporter = Arc::new(Exporter::new().context("failed to register metrics")?);
    let shutdown = CancellationToken::new();

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .context("invalid health server address")?;
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .context("invalid metrics server address")?;

    // Start health server
    let health = {
        let coordinator = coordinator.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let handler = move |req: Request<Incoming>| {
                let ready = !coordinator.is_stopped();
                async move { health_response(req.uri().path(), ready) }
            };
            if let Err(e) = serve("health", health_addr, handler, token).await {
                error!("Health server error: {:#}", e);
            }
        })
    };

    // Start metrics server
    let metrics = {
        let coordinator = coordinator.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let handler = move |req: Request<Incoming>| {
                let response = match req.uri().path() {
                    "/metrics" => {
                        exporter.observe(&coordinator.stats());
                        metrics_response(&exporter)
                    }
                    _ => text(StatusCode::NOT_FOUND, "not found"),
                };
                async move { response }
            };
            if let Err(e) = serve("metrics", metrics_addr, handler, token).await {
                error!("Metrics server error: {:#}", e);
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(
        pending = coordinator.pending_writes(),
        "Shutdown requested, draining write queue"
    );

    coordinator.shutdown().await?;
    shutdown.cancel();
    let (health, metrics) = tokio::join!(health, metrics);
    for (name, joined) in [("health", health), ("metrics", metrics)] {
        if let Err(e) = joined {
            error!(server = name, "Server task ended abnormally: {}", e);
        }
    }

    let stats = coordinator.stats();
    info!(
        committed = stats.queue.committed,
        dropped = stats.queue.dropped,
        "LinkStor shutdown complete"
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

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
    Ok(())
}

// =============================================================================
// Prometheus Export
// =============================================================================

/// Prometheus gauges mirrored from [`CoordinatorStats`] on each scrape
struct Exporter {
    registry: Registry,
    reads: IntGaugeVec,
    queue: IntGaugeVec,
    pending: IntGauge,
    cache_entries: IntGauge,
    limiter: IntGaugeVec,
    visitors: IntGauge,
    tier_failures: IntGaugeVec,
}

impl Exporter {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let reads = IntGaugeVec::new(
            Opts::new("linkstor_reads", "Lookups by outcome"),
            &["outcome"],
        )?;
        let queue = IntGaugeVec::new(
            Opts::new("linkstor_queue_items", "Write-behind items by outcome"),
            &["outcome"],
        )?;
        let pending = IntGauge::new("linkstor_queue_pending", "Writes not yet attempted")?;
        let cache_entries = IntGauge::new("linkstor_cache_entries", "Entries in the process cache")?;
        let limiter = IntGaugeVec::new(
            Opts::new("linkstor_rate_limit_decisions", "Rate limit decisions"),
            &["decision"],
        )?;
        let visitors = IntGauge::new("linkstor_rate_limit_visitors", "Tracked rate limit keys")?;
        let tier_failures = IntGaugeVec::new(
            Opts::new("linkstor_tier_failures", "Failed remote tier calls"),
            &["tier"],
        )?;

        registry.register(Box::new(reads.clone()))?;
        registry.register(Box::new(queue.clone()))?;
        registry.register(Box::new(pending.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(limiter.clone()))?;
        registry.register(Box::new(visitors.clone()))?;
        registry.register(Box::new(tier_failures.clone()))?;

        Ok(Self {
            registry,
            reads,
            queue,
            pending,
            cache_entries,
            limiter,
            visitors,
            tier_failures,
        })
    }

    fn observe(&self, stats: &CoordinatorStats) {
        let set = |vec: &IntGaugeVec, label: &str, value: u64| {
            vec.with_label_values(&[label]).set(value as i64);
        };

        set(&self.reads, "cache", stats.reads.cache_hits);
        set(&self.reads, "fast", stats.reads.fast_tier_hits);
        set(&self.reads, "durable", stats.reads.durable_hits);
        set(&self.reads, "miss", stats.reads.misses);
        set(&self.reads, "error", stats.reads.errors);

        set(&self.queue, "enqueued", stats.queue.enqueued);
        set(&self.queue, "rejected", stats.queue.rejected);
        set(&self.queue, "committed", stats.queue.committed);
        set(&self.queue, "conflict", stats.queue.conflicts);
        set(&self.queue, "retry", stats.queue.retries);
        set(&self.queue, "dropped", stats.queue.dropped);
        set(&self.queue, "panic", stats.queue.panics);
        self.pending.set(stats.queue.pending as i64);

        self.cache_entries.set(stats.cache.entries as i64);
        set(&self.limiter, "allowed", stats.limiter.allowed);
        set(&self.limiter, "denied", stats.limiter.denied);
        self.visitors.set(stats.limiter.visitors as i64);

        set(&self.tier_failures, "fast", stats.fast_tier.failures);
        set(&self.tier_failures, "durable", stats.durable_tier.failures);
    }

    fn render(&self) -> prometheus::Result<(Vec<u8>, String)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

fn health_response(path: &str, ready: bool) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" if ready => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn metrics_response(exporter: &Exporter) -> Response<Full<Bytes>> {
    match exporter.render() {
        Ok((buffer, content_type)) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            if let Ok(value) = content_type.parse() {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

async fn serve<H, Fut>(
    name: &'static str,
    addr: SocketAddr,
    handler: H,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} server on {}", name, addr))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                accepted.with_context(|| format!("{} server accept error", name))?
            }
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = handler(req);
                async move { Ok::<_, Infallible>(response.await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }

    info!("{} server stopped", name);
    Ok(())
}
