//! Prometheus metrics for the agent

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

// ── Ingestion ────────────────────────────────────────────────────────────────

pub static EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("gpuscope_events_total", "GPU events handled", &["kind"]).unwrap()
});

pub static DECODE_ERRORS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gpuscope_decode_errors_total",
        "Input lines that could not be decoded into an event"
    )
    .unwrap()
});

pub static ORPHAN_FREES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gpuscope_orphan_frees_total",
        "Free events without a matching allocation"
    )
    .unwrap()
});

pub static LEAKED_ALLOCATIONS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gpuscope_leaked_allocations_total",
        "Allocations still live when their stream ended"
    )
    .unwrap()
});

// ── Tracked state ────────────────────────────────────────────────────────────

pub static ACTIVE_STREAMS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("gpuscope_active_streams", "Streams currently tracked").unwrap()
});

pub static ACTIVE_PROCESSES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("gpuscope_active_processes", "Processes currently tracked").unwrap()
});

// ── Reporting ────────────────────────────────────────────────────────────────

pub static REPORT_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gpuscope_report_duration_seconds",
        "Time spent building interval stats",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
