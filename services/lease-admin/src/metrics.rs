//! Prometheus metrics exposition
//!
//! Exposes the pool counters emitted by `lease_pool` plus the admin API's own
//! request metrics:
//!
//! - `admin_requests_total` (counter): labels `route`, `status`
//! - `admin_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets for admin request latency, 1ms to 10s. Every request is
/// a handful of store round trips, so the interesting range is narrow.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("admin_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run before the coordinator emits anything, or those counters are lost.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed admin request.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!("admin_requests_total", "route" => route.to_string(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("admin_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}
