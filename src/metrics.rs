//! Metrics for observability.
//!
//! Emits through the `metrics` facade. No recorder is installed by this
//! crate or the `search-sync` binary; until the embedding process installs
//! one (e.g. a Prometheus exporter) every call is a no-op. Covers:
//! - Rows scanned and pages processed per tracked entity
//! - Fan-out size
//! - Documents submitted/written to the search index
//! - Watermark advancement
//! - Retries per operation
//! - Sweep duration
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `search_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Per-sweep tallies are returned as values from the engine (see
//! [`SweepReport`](crate::coordinator::SweepReport)); these functions only
//! emit them.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a retried I/O operation.
pub fn record_retry(operation: &str) {
    counter!("search_sync_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record rows returned by a change scan.
pub fn record_rows_scanned(entity: &str, rows: usize) {
    counter!("search_sync_rows_scanned_total", "entity" => entity.to_string()).increment(rows as u64);
}

/// Record the number of aggregate ids a page of leaf changes fanned out to.
pub fn record_fan_out(entity: &str, aggregates: usize) {
    histogram!("search_sync_fan_out_size", "entity" => entity.to_string()).record(aggregates as f64);
}

/// Record a page load result.
pub fn record_page_load(entity: &str, submitted: usize, written: usize, duration: Duration) {
    counter!("search_sync_documents_submitted_total", "entity" => entity.to_string())
        .increment(submitted as u64);
    counter!("search_sync_documents_written_total", "entity" => entity.to_string())
        .increment(written as u64);

    let failed = submitted.saturating_sub(written);
    if failed > 0 {
        counter!("search_sync_documents_failed_total", "entity" => entity.to_string())
            .increment(failed as u64);
    }

    histogram!("search_sync_page_load_seconds", "entity" => entity.to_string())
        .record(duration.as_secs_f64());
}

/// Record a persisted watermark advance (as a unix timestamp gauge).
pub fn record_watermark_advance(entity: &str, unix_ts: i64) {
    counter!("search_sync_watermark_advances_total", "entity" => entity.to_string()).increment(1);
    gauge!("search_sync_watermark_timestamp_seconds", "entity" => entity.to_string())
        .set(unix_ts as f64);
}

/// Record a watermark that was held back (partial sink failure or error).
pub fn record_watermark_held(entity: &str, reason: &str) {
    counter!(
        "search_sync_watermark_held_total",
        "entity" => entity.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an error for a tracked entity.
pub fn record_error(entity: &str, error_type: &str) {
    counter!(
        "search_sync_errors_total",
        "entity" => entity.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a completed sweep.
pub fn record_sweep(duration: Duration, documents_written: usize) {
    counter!("search_sync_sweeps_total").increment(1);
    histogram!("search_sync_sweep_duration_seconds").record(duration.as_secs_f64());
    histogram!("search_sync_sweep_documents_written").record(documents_written as f64);
}

/// Set engine state (as a labelled gauge).
pub fn set_engine_state(state: &str) {
    for s in ["Created", "Running", "ShuttingDown", "Stopped", "Failed"] {
        let value = if s == state { 1.0 } else { 0.0 };
        gauge!("search_sync_engine_state", "state" => s).set(value);
    }
}
