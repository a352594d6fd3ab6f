//! Observability setup for the mixer client.
//!
//! This module provides:
//! - Log setup scoped to the client's targets
//! - Metric descriptions for the check, report and quota counters

mod logging;

pub use logging::{init_logging, json_subscriber, LoggingConfig};

/// Registers descriptions for every counter the client emits.
///
/// Call once at startup after installing a `metrics` recorder.
pub fn register_metrics() {
    mixer_domain::cache::register_check_cache_metrics();
    mixer_domain::report::register_report_metrics();
    mixer_domain::quota::register_quota_metrics();
    metrics::describe_counter!(
        "mixer_check_requests_total",
        "Total number of check requests sent to the server"
    );
    metrics::describe_counter!(
        "mixer_transport_failures_total",
        "Total number of failed transport calls, labeled by operation"
    );
}
