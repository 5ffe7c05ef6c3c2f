use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total requests by method and status class");
    let vec = IntCounterVec::new(opts, &["method", "status"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Request latency by cache lookup result",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["cache_lookup"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "HTTP cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "HTTP cache store calls")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "HTTP cache store errors")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static CACHE_FLUSH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_flush_total", "Cache flushes by target");
    let vec = IntCounterVec::new(opts, &["target"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_flush_total");
    vec
});

static CACHE_SWEEP_RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_sweep_runs_total", "Cache sweeper runs")
        .expect("create cache_sweep_runs_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_runs_total");
    counter
});

static CACHE_SWEEP_EXPIRED_ENTRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_expired_entries_total",
        "Expired cache entries removed by the sweeper",
    )
    .expect("create cache_sweep_expired_entries_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_expired_entries_total");
    counter
});

static CACHE_SWEEP_BYTES_RECLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_bytes_reclaimed_total",
        "Bytes reclaimed by the cache sweeper",
    )
    .expect("create cache_sweep_bytes_reclaimed_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_bytes_reclaimed_total");
    counter
});

static CACHE_CLEANUP_DIRS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_cleanup_dirs_total",
        "Old cache layout directories removed",
    )
    .expect("create cache_cleanup_dirs_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_cleanup_dirs_total");
    counter
});

static CACHE_BACKEND_AVAILABLE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_backend_available",
        "Whether a cache backend is currently usable (1) or not (0)",
    );
    let vec = IntGaugeVec::new(opts, &["role"]).expect("create gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_backend_available");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(
    method: &str,
    cache_lookup: Option<&str>,
    status: StatusCode,
    elapsed: Duration,
) {
    REQUESTS_TOTAL
        .with_label_values(&[method, status_class(status.as_u16())])
        .inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[cache_lookup.unwrap_or("none")])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_cache_flush(target: &str) {
    CACHE_FLUSH_TOTAL.with_label_values(&[target]).inc();
}

pub fn record_cache_sweep_run() {
    CACHE_SWEEP_RUNS_TOTAL.inc();
}

pub fn record_cache_sweep_removed(entries: u64, bytes: u64) {
    if entries > 0 {
        CACHE_SWEEP_EXPIRED_ENTRIES_TOTAL.inc_by(entries);
    }
    if bytes > 0 {
        CACHE_SWEEP_BYTES_RECLAIMED_TOTAL.inc_by(bytes);
    }
}

pub fn record_cache_cleanup_dir() {
    CACHE_CLEANUP_DIRS_TOTAL.inc();
}

pub fn set_backend_available(role: &str, available: bool) {
    CACHE_BACKEND_AVAILABLE
        .with_label_values(&[role])
        .set(i64::from(available));
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
        gather(),
    )
}

pub fn router(path: &str) -> Router {
    Router::new().route(path, get(metrics_handler))
}

/// Serves the prometheus text exposition on `path` until the task is dropped.
pub async fn serve(addr: SocketAddr, path: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    axum::serve(listener, router(path))
        .await
        .context("metrics endpoint failed")
}
