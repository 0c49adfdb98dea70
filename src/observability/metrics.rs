//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_streams_total` (counter): streams created, by listener
//! - `proxy_active_streams` (gauge): streams not yet cleaned up
//! - `proxy_stream_duration_seconds` (histogram): stream lifetime
//! - `proxy_downstream_resets_total` (counter): downstream resets
//! - `proxy_upstream_responses_total` (counter): by cluster, result
//! - `proxy_upstream_timeouts_total` (counter): by cluster, kind
//! - `proxy_retries_total` / `proxy_retry_overflow_total` (counter): by cluster
//! - `proxy_hijacks_total` (counter): synthesized responses, by code
//! - `proxy_conversion_failures_total` (counter): by protocol pair
//! - `proxy_phase_cycle_exhausted_total` (counter): pipelines force-terminated
//! - `proxy_internal_panics_total` (counter): recovered panics, by site
//! - `proxy_route_reloads_total` (counter): route table swaps

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_stream_started(listener: &str) {
    metrics::counter!("proxy_streams_total", "listener" => listener.to_string()).increment(1);
    metrics::gauge!("proxy_active_streams", "listener" => listener.to_string()).increment(1.0);
}

pub fn record_stream_finished(listener: &str, duration: Duration) {
    metrics::gauge!("proxy_active_streams", "listener" => listener.to_string()).decrement(1.0);
    metrics::histogram!("proxy_stream_duration_seconds", "listener" => listener.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_downstream_reset(listener: &str, reason: &'static str) {
    metrics::counter!(
        "proxy_downstream_resets_total",
        "listener" => listener.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_upstream_response(cluster: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!(
        "proxy_upstream_responses_total",
        "cluster" => cluster.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_upstream_timeout(cluster: &str, kind: &'static str) {
    metrics::counter!(
        "proxy_upstream_timeouts_total",
        "cluster" => cluster.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_retry(cluster: &str) {
    metrics::counter!("proxy_retries_total", "cluster" => cluster.to_string()).increment(1);
}

pub fn record_retry_overflow(cluster: &str) {
    metrics::counter!("proxy_retry_overflow_total", "cluster" => cluster.to_string())
        .increment(1);
}

pub fn record_hijack(code: u16) {
    metrics::counter!("proxy_hijacks_total", "code" => code.to_string()).increment(1);
}

pub fn record_conversion_failure(from: &str, to: &str) {
    metrics::counter!(
        "proxy_conversion_failures_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_phase_cycle_exhausted(listener: &str) {
    metrics::counter!(
        "proxy_phase_cycle_exhausted_total",
        "listener" => listener.to_string()
    )
    .increment(1);
}

pub fn record_internal_panic(site: &'static str) {
    metrics::counter!("proxy_internal_panics_total", "site" => site).increment(1);
}

pub fn record_route_reload(routes: usize) {
    metrics::counter!("proxy_route_reloads_total").increment(1);
    metrics::gauge!("proxy_routes").set(routes as f64);
}
