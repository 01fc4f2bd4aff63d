//! Prometheus metrics for the coalescing proxy
//!
//! Exposes metrics in Prometheus format for monitoring and observability.

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for proxy metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Total requests with mode (coalesced, bypass, rejected) and status class labels
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of requests")
            .namespace("coalesce"),
        &["mode", "status"]
    ).expect("metric can be created");

    /// End-to-end request duration histogram with mode label
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "request_duration_seconds",
            "Request duration in seconds, including time spent waiting for a flush"
        )
        .namespace("coalesce")
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["mode"]
    ).expect("metric can be created");

    /// Requests currently in flight through the proxy
    pub static ref ACTIVE_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("active_requests", "Number of requests currently being processed")
            .namespace("coalesce")
    ).expect("metric can be created");

    /// Requests whose wait deadline expired
    pub static ref REQUESTS_TIMEOUT_TOTAL: Counter = Counter::with_opts(
        Opts::new("requests_timeout_total", "Total requests that timed out waiting for a flush")
            .namespace("coalesce")
    ).expect("metric can be created");

    // ============== Upstream Metrics ==============

    /// Upstream invocations with result label
    pub static ref UPSTREAM_CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("upstream_calls_total", "Total upstream invocations")
            .namespace("coalesce"),
        &["result"]
    ).expect("metric can be created");

    /// Upstream call duration histogram
    pub static ref UPSTREAM_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "upstream_duration_seconds",
            "Time spent in a single upstream invocation"
        )
        .namespace("coalesce")
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).expect("metric can be created");

    /// Upstream health status (1 = healthy, 0 = unhealthy)
    pub static ref BACKEND_HEALTHY: Gauge = Gauge::with_opts(
        Opts::new("backend_healthy", "Upstream health status (1=healthy, 0=unhealthy)")
            .namespace("coalesce")
    ).expect("metric can be created");

    // ============== Coalescing Metrics ==============

    /// Waiters served per upstream call
    pub static ref FANOUT_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("fanout_size", "Number of waiters served by one upstream call")
            .namespace("coalesce")
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0])
    ).expect("metric can be created");

    /// Results delivered to waiters
    pub static ref DELIVERIES_TOTAL: Counter = Counter::with_opts(
        Opts::new("deliveries_total", "Total results delivered to waiting callers")
            .namespace("coalesce")
    ).expect("metric can be created");

    /// Waiters that went away before delivery
    pub static ref WAITERS_ABANDONED_TOTAL: Counter = Counter::with_opts(
        Opts::new("waiters_abandoned_total", "Total waiters gone before their result was delivered")
            .namespace("coalesce")
    ).expect("metric can be created");

    /// Groups waiting for the next flush
    pub static ref PENDING_GROUPS: Gauge = Gauge::with_opts(
        Opts::new("pending_groups", "Coalescing groups waiting for the next flush")
            .namespace("coalesce")
    ).expect("metric can be created");

    /// Waiters across all pending groups
    pub static ref PENDING_WAITERS: Gauge = Gauge::with_opts(
        Opts::new("pending_waiters", "Callers waiting for the next flush")
            .namespace("coalesce")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    // Request metrics
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(REQUESTS_TIMEOUT_TOTAL.clone()))?;

    // Upstream metrics
    REGISTRY.register(Box::new(UPSTREAM_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPSTREAM_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BACKEND_HEALTHY.clone()))?;

    // Coalescing metrics
    REGISTRY.register(Box::new(FANOUT_SIZE.clone()))?;
    REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WAITERS_ABANDONED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PENDING_GROUPS.clone()))?;
    REGISTRY.register(Box::new(PENDING_WAITERS.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// How a request went through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Coalesced,
    Bypass,
    Rejected,
}

impl RequestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMode::Coalesced => "coalesced",
            RequestMode::Bypass => "bypass",
            RequestMode::Rejected => "rejected",
        }
    }
}

/// Helper struct for tracking request duration.
/// A timer dropped without `finish` is counted as cancelled.
pub struct RequestTimer {
    mode: RequestMode,
    start: Instant,
}

impl RequestTimer {
    pub fn new(mode: RequestMode) -> Self {
        ACTIVE_REQUESTS.inc();
        Self { mode, start: Instant::now() }
    }

    /// Record the request completing with `status`.
    pub fn finish(self, status: StatusCode) {
        self.observe(status_class(status));
        // Prevent the Drop impl from running
        std::mem::forget(self);
    }

    fn observe(&self, status: &str) {
        let mode = self.mode.as_str();
        REQUEST_DURATION_SECONDS
            .with_label_values(&[mode])
            .observe(self.start.elapsed().as_secs_f64());
        REQUESTS_TOTAL.with_label_values(&[mode, status]).inc();
        ACTIVE_REQUESTS.dec();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.observe("cancelled");
    }
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Record one upstream invocation.
pub fn record_upstream_call(elapsed: Duration, failed: bool) {
    UPSTREAM_DURATION_SECONDS.observe(elapsed.as_secs_f64());
    UPSTREAM_CALLS_TOTAL
        .with_label_values(&[if failed { "failure" } else { "success" }])
        .inc();
}

/// Record the fan-out of one dispatched group.
pub fn record_fanout(delivered: usize, abandoned: usize) {
    FANOUT_SIZE.observe(delivered as f64);
    DELIVERIES_TOTAL.inc_by(delivered as f64);
    WAITERS_ABANDONED_TOTAL.inc_by(abandoned as f64);
}

/// Record a timed out request.
pub fn record_timeout() {
    REQUESTS_TIMEOUT_TOTAL.inc();
}

/// Update the pending registry gauges.
pub fn set_pending(groups: usize, waiters: usize) {
    PENDING_GROUPS.set(groups as f64);
    PENDING_WAITERS.set(waiters as f64);
}

/// Set upstream health status.
pub fn set_backend_healthy(healthy: bool) {
    BACKEND_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}
