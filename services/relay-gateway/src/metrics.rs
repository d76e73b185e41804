//! Prometheus metrics exposition
//!
//! - `relay_requests_total` (counter): labels `status`, `method`
//! - `relay_request_duration_seconds` (histogram): label `status`
//! - `relay_upstream_errors_total` (counter): label `error_type`
//! - `relay_rate_limited_total` (counter)
//! - `relay_usage_write_failures_total` (counter): label `kind`
//! - `pool_account_quarantined_total` (counter, emitted by the token pool)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "relay_request_duration_seconds";

/// Bucket boundaries from 5ms to 60s, covering the configurable upstream timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)?)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `relay_request_duration_seconds` renders as a histogram (with `_bucket`
/// lines for `histogram_quantile()` queries) rather than the default summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed relay request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("relay_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record a failed upstream attempt: `timeout`, `connection` or `status`.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("relay_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_rate_limited() {
    metrics::counter!("relay_rate_limited_total").increment(1);
}

/// Record a swallowed usage-accounting failure: `record` or `increment`.
pub fn record_usage_write_failure(kind: &str) {
    metrics::counter!("relay_usage_write_failures_total", "kind" => kind.to_string())
        .increment(1);
}
