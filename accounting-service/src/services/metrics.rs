//! Metrics module for accounting-service.
//! Provides Prometheus metrics for invoicing, credit and subscription activity.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "accounting_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoices created counter
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Credit adjustments counter
pub static CREDIT_ADJUSTMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscription adjustments counter
pub static SUBSCRIPTION_ADJUSTMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Periodic task runs
pub static TASK_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "accounting_invoices_created_total",
                "Total invoices created by visibility"
            ),
            &["visibility"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    CREDIT_ADJUSTMENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "accounting_credit_adjustments_total",
                "Total credit adjustments by reason"
            ),
            &["reason"]
        )
        .expect("Failed to register CREDIT_ADJUSTMENTS_TOTAL")
    });

    SUBSCRIPTION_ADJUSTMENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "accounting_subscription_adjustments_total",
                "Total subscription adjustments by reason and method"
            ),
            &["reason", "method"]
        )
        .expect("Failed to register SUBSCRIPTION_ADJUSTMENTS_TOTAL")
    });

    TASK_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "accounting_task_runs_total",
                "Total periodic task runs by task and status"
            ),
            &["task", "status"]
        )
        .expect("Failed to register TASK_RUNS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("accounting_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a created invoice.
pub fn record_invoice_created(is_hidden: bool) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        let visibility = if is_hidden { "hidden" } else { "visible" };
        counter.with_label_values(&[visibility]).inc();
    }
}

/// Record a credit adjustment.
pub fn record_credit_adjustment(reason: &str) {
    if let Some(counter) = CREDIT_ADJUSTMENTS_TOTAL.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

/// Record a subscription adjustment.
pub fn record_subscription_adjustment(reason: &str, method: &str) {
    if let Some(counter) = SUBSCRIPTION_ADJUSTMENTS_TOTAL.get() {
        counter.with_label_values(&[reason, method]).inc();
    }
}

/// Record a periodic task run.
pub fn record_task_run(task: &str, status: &str) {
    if let Some(counter) = TASK_RUNS_TOTAL.get() {
        counter.with_label_values(&[task, status]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
