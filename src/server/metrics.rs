//! Prometheus metrics definitions.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

use crate::storage::IndexCounts;

/// Total chunks indexed.
pub static CHUNKS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("dirindex_chunks_total", "Total number of indexed chunks").unwrap()
});

/// Chunks stored without an embedding.
pub static PENDING_CHUNKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "dirindex_pending_chunks",
        "Chunks waiting for an embedding"
    )
    .unwrap()
});

/// Total files tracked.
pub static FILES_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("dirindex_files_total", "Total number of indexed files").unwrap()
});

/// 1 while any watch root is unwatched.
pub static WATCH_DEGRADED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "dirindex_watch_degraded",
        "Whether any watch root is currently unwatched"
    )
    .unwrap()
});

/// Normalized change events by kind.
pub static CHANGE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dirindex_change_events_total",
        "Filesystem change events after normalization",
        &["kind"]
    )
    .unwrap()
});

/// Handled events by outcome.
pub static RECONCILES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dirindex_reconciles_total",
        "Indexed change events by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Embedding calls by outcome.
pub static EMBEDDING_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dirindex_embedding_calls_total",
        "Embedding attempts by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Query latency by query kind.
pub static QUERY_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "dirindex_query_duration_seconds",
        "Query latency in seconds",
        &["kind"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap()
});

/// Request latency histogram.
pub static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "dirindex_request_duration_seconds",
        "Request latency in seconds",
        &["endpoint", "method"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap()
});

/// Request counter.
pub static REQUEST_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dirindex_requests_total",
        "Total number of requests",
        &["endpoint", "method", "status"]
    )
    .unwrap()
});

/// Initialize all metrics (call once at startup).
pub fn init_metrics() {
    let _ = &*CHUNKS_TOTAL;
    let _ = &*PENDING_CHUNKS;
    let _ = &*FILES_TOTAL;
    let _ = &*WATCH_DEGRADED;
    let _ = &*CHANGE_EVENTS;
    let _ = &*RECONCILES;
    let _ = &*EMBEDDING_CALLS;
    let _ = &*QUERY_LATENCY;
    let _ = &*REQUEST_LATENCY;
    let _ = &*REQUEST_COUNT;

    tracing::debug!("Prometheus metrics initialized");
}

/// Copy index counters into the gauges.
#[allow(clippy::cast_possible_wrap)]
pub fn record_counts(counts: &IndexCounts) {
    CHUNKS_TOTAL.set(counts.chunks as i64);
    PENDING_CHUNKS.set(counts.pending_chunks as i64);
    FILES_TOTAL.set(counts.files as i64);
}
