//! Prometheus Metrics Module
//!
//! Counters and histograms for the DNS server, registered in the default
//! prometheus registry.
//!
//! # Metrics Categories
//!
//! * **Query Metrics** - Requests per transport, responses per rcode, latency
//! * **Cache Metrics** - Hits, misses and evictions of both caches, their size
//! * **Forwarding Metrics** - Queries per upstream and outcome
//! * **DNSSEC Metrics** - Signatures produced and served from cache
//! * **Error Metrics** - Failures by kind

use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    /// Queries received by transport
    pub static ref DNS_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "skydns_queries_total",
        "Total number of DNS queries received",
        &["protocol"]
    ).unwrap();

    /// Responses sent by response code and classification
    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "skydns_responses_total",
        "Total number of DNS responses sent",
        &["response_code", "protocol", "kind"]
    ).unwrap();

    /// Query duration histogram
    pub static ref DNS_QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "skydns_query_duration_seconds",
        "DNS query processing duration in seconds",
        &["protocol", "kind"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    /// Cache hit/miss/eviction counters
    pub static ref DNS_CACHE_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "skydns_cache_operations_total",
        "Cache operations (hit/miss/eviction)",
        &["cache", "operation"]
    ).unwrap();

    /// Cache size gauge
    pub static ref DNS_CACHE_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "skydns_cache_size",
        "Current number of entries in a cache",
        &["cache"]
    ).unwrap();

    /// Queries sent to upstream servers
    pub static ref UPSTREAM_QUERIES: IntCounterVec = register_int_counter_vec!(
        "skydns_upstream_queries_total",
        "Queries sent to upstream DNS servers",
        &["upstream", "status"]
    ).unwrap();

    /// Upstream response times
    pub static ref UPSTREAM_DURATION: HistogramVec = register_histogram_vec!(
        "skydns_upstream_duration_seconds",
        "Upstream DNS query duration",
        &["upstream"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    /// DNSSEC signatures
    pub static ref DNSSEC_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "skydns_dnssec_operations_total",
        "DNSSEC signing operations",
        &["operation", "result"]
    ).unwrap();

    /// Stub zones currently known
    pub static ref STUB_ZONES: IntGauge = register_int_gauge!(
        "skydns_stub_zones",
        "Number of stub zones in the forwarding table"
    ).unwrap();

    /// Error counters by kind
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "skydns_errors_total",
        "Total errors by component and kind",
        &["component", "error_type"]
    ).unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

pub fn record_cache_operation(cache: &str, operation: &str) {
    DNS_CACHE_OPERATIONS
        .with_label_values(&[cache, operation])
        .inc();
}

pub fn record_upstream_query(upstream: &str, status: &str, duration: Duration) {
    UPSTREAM_QUERIES.with_label_values(&[upstream, status]).inc();
    UPSTREAM_DURATION
        .with_label_values(&[upstream])
        .observe(duration.as_secs_f64());
}

/// Query timer for measuring DNS query duration
pub struct QueryTimer {
    start: Instant,
    protocol: &'static str,
}

impl QueryTimer {
    pub fn start(protocol: &'static str) -> Self {
        DNS_QUERIES_TOTAL.with_label_values(&[protocol]).inc();

        Self {
            start: Instant::now(),
            protocol,
        }
    }

    /// Record the duration and the outcome of the query
    pub fn finish(self, response_code: &str, kind: &str) {
        DNS_RESPONSES_TOTAL
            .with_label_values(&[response_code, self.protocol, kind])
            .inc();
        DNS_QUERY_DURATION
            .with_label_values(&[self.protocol, kind])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Helper macro for recording errors with context
#[macro_export]
macro_rules! record_error {
    ($component:expr, $error_type:expr) => {
        $crate::dns::metrics::ERRORS_TOTAL
            .with_label_values(&[$component, $error_type])
            .inc();
    };
    ($component:expr, $error_type:expr, $error:expr) => {
        $crate::dns::metrics::ERRORS_TOTAL
            .with_label_values(&[$component, $error_type])
            .inc();
        log::warn!("Error in {}: {} - {}", $component, $error_type, $error);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_timer() {
        let timer = QueryTimer::start("udp");
        timer.finish("NOERROR", "zone");

        let metrics = export_metrics().unwrap();
        assert!(metrics.contains("skydns_queries_total"));
        assert!(metrics.contains("skydns_query_duration_seconds"));
    }

    #[test]
    fn test_record_error() {
        record_error!("server", "servfail");

        let value = ERRORS_TOTAL
            .with_label_values(&["server", "servfail"])
            .get();
        assert!(value >= 1);
    }
}
