//! Prometheus metrics for utility-billing-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, HistogramVec,
    IntCounterVec, TextEncoder,
};

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "utility_billing_db_query_duration_seconds",
            "Database query duration in seconds",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
        ),
        &["operation"]
    )
    .expect("Failed to register db_query_duration")
});

/// Ledger operations by operation and outcome.
pub static STATEMENT_OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "utility_billing_statement_operations_total",
            "Total billing statement operations by type and outcome"
        ),
        &["operation", "outcome"] // created, updated, unchanged, deleted, ...
    )
    .expect("Failed to register statement_operations_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "utility_billing_errors_total",
            "Total number of errors by type"
        ),
        &["error_type", "operation"]
    )
    .expect("Failed to register errors_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&STATEMENT_OPERATIONS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Record a finished ledger operation.
pub fn record_statement_operation(operation: &str, outcome: &str) {
    STATEMENT_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, operation])
        .inc();
}
