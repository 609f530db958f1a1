//! Prometheus metrics for sync-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Source item syncs by outcome.
pub static ITEM_SYNCS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sync_item_syncs_total",
        "Total number of source item syncs",
        &["status"]  // ok, error - not item_id to avoid cardinality explosion
    )
    .expect("Failed to register item_syncs_total")
});

/// Snapshots written or removed by the ledger writer.
pub static TRANSACTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sync_transactions_total",
        "Total number of transaction snapshots written or removed",
        &["action"]  // written, removed
    )
    .expect("Failed to register transactions_total")
});

/// Deltas produced, by op.
pub static DELTAS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sync_deltas_total",
        "Total number of deltas produced",
        &["op"]
    )
    .expect("Failed to register deltas_total")
});

/// Provider pages fetched by outcome.
pub static PROVIDER_PAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sync_provider_pages_total",
        "Total number of feed pages requested from the provider",
        &["status"]
    )
    .expect("Failed to register provider_pages_total")
});

/// Provider request duration histogram.
pub static PROVIDER_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sync_provider_request_duration_seconds",
        "Feed provider request duration in seconds",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register provider_request_duration")
});

/// Rollup apply calls by outcome.
pub static ROLLUP_APPLY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sync_rollup_apply_total",
        "Total number of rollup apply calls",
        &["outcome"]  // applied, replayed, failed
    )
    .expect("Failed to register rollup_apply_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sync_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&ITEM_SYNCS_TOTAL);
    Lazy::force(&TRANSACTIONS_TOTAL);
    Lazy::force(&DELTAS_TOTAL);
    Lazy::force(&PROVIDER_PAGES_TOTAL);
    Lazy::force(&PROVIDER_REQUEST_DURATION);
    Lazy::force(&ROLLUP_APPLY_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
