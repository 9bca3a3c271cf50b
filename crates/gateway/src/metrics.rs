use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static QUERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TOUCH_UPDATES_DROPPED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("postgate_http_requests_total", "Gateway HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create postgate_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "postgate_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create postgate_http_request_duration_seconds"),
        )
    })
}

fn queries_total() -> &'static IntCounterVec {
    QUERIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "postgate_queries_total",
                    "Validated statements by operation and outcome.",
                ),
                &["operation", "outcome"],
            )
            .expect("create postgate_queries_total"),
        )
    })
}

fn touch_updates_dropped_total() -> &'static IntCounter {
    TOUCH_UPDATES_DROPPED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "postgate_touch_updates_dropped_total",
                "last_used_at updates dropped by the bounded queue.",
            )
            .expect("create postgate_touch_updates_dropped_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_query(operation: &str, outcome: &str) {
    queries_total()
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn inc_touch_dropped(count: u64) {
    touch_updates_dropped_total().inc_by(count);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = touch_updates_dropped_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
