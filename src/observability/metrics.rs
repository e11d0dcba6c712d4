//! # Metrics
//!
//! Counters and histograms are emitted through the `metrics` facade as side effects of
//! the request path. When no recorder is installed (tests, or `metrics_enabled: false`)
//! every call is a no-op.
//!
//! ## Exported series
//! - `gateway_requests_total{service, method, status}`
//! - `gateway_request_duration_seconds{service, method}`
//! - `gateway_rate_limit_rejections_total{scope, service}`
//! - `gateway_circuit_transitions_total{service, from, to}`
//! - `gateway_upstream_attempts_total{service, outcome}`
//! - `gateway_health_probe_total{service, result}`

use crate::core::error::{GatewayError, GatewayResult};
use ::metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the global Prometheus recorder and return the handle used by `/metrics`
pub fn install_prometheus_recorder() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))
}

/// One completed inbound request
pub fn record_request(service: &str, method: &str, status: u16, duration: Duration) {
    counter!(
        "gateway_requests_total",
        "service" => service.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        "gateway_request_duration_seconds",
        "service" => service.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_rate_limit_rejection(scope: &str, service: &str) {
    counter!(
        "gateway_rate_limit_rejections_total",
        "scope" => scope.to_string(),
        "service" => service.to_string()
    )
    .increment(1);
}

pub fn record_circuit_transition(service: &str, from: &str, to: &str) {
    counter!(
        "gateway_circuit_transitions_total",
        "service" => service.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// One outbound attempt, `outcome` is `success`, `timeout`, `connection_error` or `http_<status>`
pub fn record_upstream_attempt(service: &str, outcome: &str) {
    counter!(
        "gateway_upstream_attempts_total",
        "service" => service.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_health_probe(service: &str, healthy: bool) {
    let result = if healthy { "success" } else { "failure" };
    counter!(
        "gateway_health_probe_total",
        "service" => service.to_string(),
        "result" => result
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_request("users", "GET", 200, Duration::from_millis(12));
        record_rate_limit_rejection("global", "users");
        record_circuit_transition("users", "closed", "open");
        record_upstream_attempt("users", "timeout");
        record_health_probe("users", false);
    }
}
