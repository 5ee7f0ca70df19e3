use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

use crate::core::{ErrorContext, PipelineResult};

const DEFAULT_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0,
    60000.0,
];

// Requests by outcome
static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tierflow_requests_total",
        "The total number of pipeline requests since tierflow started",
        &["mode", "outcome"]
    )
    .unwrap()
});

// Histogram for request latency
static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "tierflow_request_latency",
        "Pipeline request latency in milliseconds",
    )
    .buckets(DEFAULT_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["mode"]).unwrap()
});

// Histogram for layer latency
static LAYER_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("tierflow_layer_latency", "Layer latency in milliseconds")
        .buckets(DEFAULT_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["layer", "outcome"]).unwrap()
});

static SUBMODULE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tierflow_submodule_failures_total",
        "Submodule results reported as failed",
        &["stage"]
    )
    .unwrap()
});

static PERSISTENCE_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tierflow_persistence_dropped_total",
        "Persistence jobs dropped because the queue was full or closed"
    )
    .unwrap()
});

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

pub(crate) fn observe_request(mode: &str, success: bool, latency_ms: f64) {
    REQUESTS.with_label_values(&[mode, outcome(success)]).inc();
    REQUEST_LATENCY
        .with_label_values(&[mode])
        .observe(latency_ms);
}

pub(crate) fn observe_layer(layer: &str, success: bool, latency_ms: f64) {
    LAYER_LATENCY
        .with_label_values(&[layer, outcome(success)])
        .observe(latency_ms);
}

pub(crate) fn count_submodule_failure(stage: &str) {
    SUBMODULE_FAILURES.with_label_values(&[stage]).inc();
}

pub(crate) fn count_dropped_job() {
    PERSISTENCE_DROPPED.inc();
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> PipelineResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .with_context("Failed to encode metrics")?;
    String::from_utf8(buffer).with_context("Metrics are not valid UTF-8")
}
