use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramOpts, HistogramVec,
    IntCounterVec, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0,
];

// Aggregated requests by outcome
static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bff_requests_total",
        "Aggregation requests handled by pingbff",
        &[
            "operation", // Requested operation
            "profile",   // Client profile id
            "status",    // HTTP status sent to the client
        ]
    )
    .expect("Failed to register prometheus metric: bff_requests_total")
});

// Partial responses, a subset of bff_requests_total
static PARTIALS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bff_partial_responses_total",
        "Aggregated responses served with degraded fields",
        &["operation", "profile"]
    )
    .expect("Failed to register prometheus metric: bff_partial_responses_total")
});

// Latency of single upstream attempts, in seconds
static UPSTREAM_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "bff_upstream_latency_seconds",
        "Latency of upstream call attempts in seconds",
    )
    .buckets(LATENCY_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["service", "outcome"])
        .expect("Failed to register prometheus metric: bff_upstream_latency_seconds")
});

static CIRCUIT_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bff_circuit_transitions_total",
        "Circuit breaker state transitions per service",
        &["service", "state"]
    )
    .expect("Failed to register prometheus metric: bff_circuit_transitions_total")
});

pub fn record_request(operation: &str, profile: &str, status: u16, partial: bool) {
    let status = status.to_string();
    REQUESTS
        .with_label_values(&[operation, profile, status.as_str()])
        .inc();
    if partial {
        PARTIALS.with_label_values(&[operation, profile]).inc();
    }
}

pub fn observe_upstream(service: &str, outcome: &str, seconds: f64) {
    UPSTREAM_LATENCY
        .with_label_values(&[service, outcome])
        .observe(seconds);
}

pub fn record_circuit_transition(service: &str, state: &str) {
    CIRCUIT_TRANSITIONS
        .with_label_values(&[service, state])
        .inc();
}

/// Text exposition of every registered metric.
pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::error!("Failed to encode prometheus metrics: {e}");
    }
    buffer
}
