//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_total` (counter): accepted client connections
//! - `proxy_active_connections` (gauge): connections currently being served
//! - `proxy_requests_total` (counter): finished requests by outcome
//! - `proxy_request_duration_seconds` (histogram): connection service time
//! - `proxy_cache_lookups_total` (counter): cache probes by result
//! - `proxy_cache_evictions_total` (counter): entries evicted for space
//! - `proxy_cache_bytes` / `proxy_cache_entries` (gauges): cache occupancy
//! - `proxy_origin_errors_total` (counter): origin failures by kind

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener.
///
/// Must be called from inside the Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened(active: u64) {
    metrics::counter!("proxy_connections_total").increment(1);
    metrics::gauge!("proxy_active_connections").set(active as f64);
}

pub fn record_connection_closed(active: u64) {
    metrics::gauge!("proxy_active_connections").set(active as f64);
}

pub fn record_request(outcome: &'static str, start: Instant) {
    metrics::counter!("proxy_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("proxy_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_eviction() {
    metrics::counter!("proxy_cache_evictions_total").increment(1);
}

pub fn record_cache_size(entries: usize, bytes: usize) {
    metrics::gauge!("proxy_cache_entries").set(entries as f64);
    metrics::gauge!("proxy_cache_bytes").set(bytes as f64);
}

pub fn record_origin_error(kind: &'static str) {
    metrics::counter!("proxy_origin_errors_total", "kind" => kind).increment(1);
}
