//! Prometheus metrics for the quarry server.
//!
//! Exposes request, cache and upstream fetch metrics. Labels carry source
//! ids and HTTP methods only, never artifact paths.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Request metrics
pub static HTTP_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_http_requests_total",
            "Total repository requests by method and status",
        ),
        &["method", "status"],
    )
    .expect("metric creation failed")
});

pub static BYTES_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_bytes_served_total",
        "Total artifact bytes served to clients",
    )
    .expect("metric creation failed")
});

pub static ARTIFACTS_PUBLISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_artifacts_published_total",
        "Total artifacts published with PUT",
    )
    .expect("metric creation failed")
});

// Cache metrics
pub static CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("quarry_cache_hits_total", "Total cache hits")
        .expect("metric creation failed")
});

pub static CACHE_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("quarry_cache_misses_total", "Total cache misses")
        .expect("metric creation failed")
});

pub static SINGLEFLIGHT_JOINS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_singleflight_joins_total",
        "Total requests that joined a fetch already in flight",
    )
    .expect("metric creation failed")
});

pub static INDEX_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "quarry_index_entries",
        "Cache index entries at the last flush or recovery",
    )
    .expect("metric creation failed")
});

// Upstream metrics
pub static UPSTREAM_FETCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_upstream_fetches_total",
            "Total upstream fetch attempts by source and outcome",
        ),
        &["source", "outcome"],
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quarry_upstream_fetch_duration_seconds",
            "Time taken by a single upstream fetch attempt",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

pub static VERIFICATION_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_verification_failures_total",
            "Total fetched artifacts rejected by checksum or signature checks",
        ),
        &["source"],
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_SERVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ARTIFACTS_PUBLISHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_MISSES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SINGLEFLIGHT_JOINS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INDEX_ENTRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPSTREAM_FETCHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPSTREAM_FETCH_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(VERIFICATION_FAILURES.clone()))
            .expect("metric registration failed");
    });
}

/// GET /-/metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record one upstream fetch attempt.
pub fn record_upstream_fetch(source: &str, outcome: &str) {
    UPSTREAM_FETCHES.with_label_values(&[source, outcome]).inc();
}

/// Record one served repository request.
pub fn record_request(method: &str, status: StatusCode) {
    HTTP_REQUESTS
        .with_label_values(&[method, status.as_str()])
        .inc();
}
