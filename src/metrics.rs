// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

// Re-export macros for use in this module when observability is disabled
#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    // Liveness / heartbeat
    describe_gauge!("quoting_up", "Quoting service liveness (1=up).");

    // Quote path
    describe_counter!(
        "quote_requests_total",
        Unit::Count,
        "Total number of /quote requests, labeled by outcome (ok, invalid_request, undeliverable, deadline, error)."
    );
    describe_histogram!(
        "quote_latency_ms",
        "End-to-end /quote latency in milliseconds (target: p95 < 500ms)."
    );

    // Catalog sync
    describe_counter!(
        "catalog_sync_total",
        Unit::Count,
        "Total number of catalog sync attempts, labeled by trigger (startup, periodic, manual) and outcome."
    );
    describe_gauge!("catalog_version", "Currently installed catalog version.");
    describe_histogram!(
        "catalog_sync_duration_ms",
        "Full catalog sync duration in milliseconds (fetch + parse + publish)."
    );

    // Distance resolution
    describe_counter!(
        "distance_cache_hits_total",
        Unit::Count,
        "Total number of distance lookups served from the cache."
    );
    describe_counter!(
        "distance_cache_misses_total",
        Unit::Count,
        "Total number of distance lookups that required an upstream maps call."
    );
    describe_counter!(
        "distance_fallback_total",
        Unit::Count,
        "Total number of distance results computed from the geocoded great-circle fallback."
    );

    // Latency recorder
    describe_counter!(
        "latency_sample_dropped_total",
        Unit::Count,
        "Total number of latency samples dropped because the recorder channel was saturated."
    );
    describe_gauge!(
        "latency_recorder_queue_depth",
        "Samples currently queued between request paths and the drain worker."
    );

    // Cache store
    describe_counter!(
        "cache_ops_total",
        Unit::Count,
        "Total number of cache store operations, labeled by op and status."
    );

    // HTTP surface
    describe_gauge!(
        "http_inflight_requests",
        "Requests currently being handled (soft limit 80, hard limit 100)."
    );
}

pub fn increment_quote_request(outcome: &'static str) {
    counter!("quote_requests_total", 1, "outcome" => outcome);
}

pub fn record_quote_latency_ms(ms: f64) {
    histogram!("quote_latency_ms", ms);
}

pub fn increment_catalog_sync(trigger: &'static str, outcome: &'static str) {
    counter!("catalog_sync_total", 1, "trigger" => trigger, "outcome" => outcome);
}

pub fn set_catalog_version(version: u64) {
    gauge!("catalog_version", version as f64);
}

pub fn increment_distance_cache_hit() {
    counter!("distance_cache_hits_total", 1);
}

pub fn increment_distance_cache_miss() {
    counter!("distance_cache_misses_total", 1);
}

pub fn increment_distance_fallback() {
    counter!("distance_fallback_total", 1);
}

pub fn increment_latency_sample_dropped() {
    counter!("latency_sample_dropped_total", 1);
}

pub fn increment_cache_op(op: &'static str, status: &'static str) {
    counter!("cache_ops_total", 1, "op" => op, "status" => status);
}

pub fn set_http_inflight(count: f64) {
    gauge!("http_inflight_requests", count);
}
