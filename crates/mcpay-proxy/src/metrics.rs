use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::{LazyLock, Once};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Proxy metrics
pub static PROXY_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("mcpay_proxy_requests_total", "Total number of proxied requests"),
        &["status"],
    )
    .unwrap()
});

pub static PROXY_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("mcpay_proxy_latency_seconds", "Proxy request latency")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .unwrap()
});

pub static FRAMING_SHORT_CIRCUITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcpay_framing_short_circuits_total",
        "JSON-RPC response/notification payloads answered with 202",
    )
    .unwrap()
});

// Cache
pub static CACHE_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("mcpay_cache_events_total", "Response cache lookups by outcome"),
        &["status"],
    )
    .unwrap()
});

// Upstream resilience
pub static RATE_LIMIT_WAIT: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "mcpay_rate_limit_wait_seconds",
            "Time spent waiting for upstream host capacity",
        )
        .buckets(vec![0.0, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .unwrap()
});

pub static UPSTREAM_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcpay_upstream_retries_total",
        "Upstream attempts beyond the first",
    )
    .unwrap()
});

// Payment counters
pub static PAYMENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcpay_payments_total",
            "Payment protocol transitions by outcome",
        ),
        &["outcome"],
    )
    .unwrap()
});

// Per-tool counters
pub static TOOL_PAYMENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("mcpay_tool_payments_total", "Settled payments per tool"),
        &["tool"],
    )
    .unwrap()
});

pub static TOOL_REVENUE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcpay_tool_revenue_total",
            "Revenue in the token's smallest unit per tool",
        ),
        &["tool"],
    )
    .unwrap()
});

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(PROXY_REQUESTS_TOTAL.clone()))
            .unwrap();
        REGISTRY.register(Box::new(PROXY_LATENCY.clone())).unwrap();
        REGISTRY
            .register(Box::new(FRAMING_SHORT_CIRCUITS.clone()))
            .unwrap();
        REGISTRY.register(Box::new(CACHE_EVENTS.clone())).unwrap();
        REGISTRY.register(Box::new(RATE_LIMIT_WAIT.clone())).unwrap();
        REGISTRY
            .register(Box::new(UPSTREAM_RETRIES.clone()))
            .unwrap();
        REGISTRY.register(Box::new(PAYMENTS_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(TOOL_PAYMENTS.clone())).unwrap();
        REGISTRY.register(Box::new(TOOL_REVENUE.clone())).unwrap();
    });
}
