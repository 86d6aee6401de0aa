//! Prometheus metrics exposition
//!
//! Metrics emitted by the session crates:
//!
//! - `auth_sessions` (gauge): sessions currently stored
//! - `auth_flows_total` (counter): label `outcome`
//! - `auth_refresh_total` (counter): label `outcome`
//! - `auth_http_retries_total`, `auth_http_failures_total` (counters)
//!
//! And by the agent itself:
//!
//! - `agent_requests_total` (counter): labels `route`, `status`
//! - `agent_token_request_duration_seconds` (histogram)

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const TOKEN_DURATION: &str = "agent_token_request_duration_seconds";

/// Token requests may wait on the user for minutes, so buckets run long.
const TOKEN_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.25, 1.0, 5.0, 30.0, 60.0, 300.0, 600.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(TOKEN_DURATION.to_string()), TOKEN_DURATION_BUCKETS)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one handled API request.
pub fn record_request(route: &'static str, status: u16) {
    metrics::counter!("agent_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
}

/// Record how long a `/token` request took end to end.
pub fn record_token_duration(duration_secs: f64) {
    metrics::histogram!(TOKEN_DURATION).record(duration_secs);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder()
        .expect("failed to set histogram buckets")
        .build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
