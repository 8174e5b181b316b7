//! Cleanup metrics.
//!
//! Counters and histograms for cleanup runs, complementing the
//! structured event stream. Emitted through the `metrics` facade; the
//! binary decides whether a recorder is installed.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Tags deleted counter.
pub const TAGS_DELETED: &str = "stagehand_cleanup_tags_deleted_total";

/// Tags kept counter.
pub const TAGS_KEPT: &str = "stagehand_cleanup_tags_kept_total";

/// Metadata records deleted counter.
pub const METADATA_DELETED: &str = "stagehand_cleanup_metadata_deleted_total";

/// Per-image delete errors counter.
pub const DELETE_ERRORS: &str = "stagehand_cleanup_delete_errors_total";

/// Cleanup run duration histogram.
pub const RUN_DURATION: &str = "stagehand_cleanup_run_duration_seconds";

/// Registers all cleanup metric descriptions.
///
/// Call once at application startup after installing the recorder.
pub fn register_metrics() {
    describe_counter!(TAGS_DELETED, "Total tags deleted by cleanup/purge");
    describe_counter!(TAGS_KEPT, "Total tags kept by cleanup policies");
    describe_counter!(METADATA_DELETED, "Total metadata records deleted");
    describe_counter!(DELETE_ERRORS, "Total per-item delete failures");
    describe_histogram!(RUN_DURATION, "Duration of cleanup runs in seconds");
}

/// Records a completed phase.
pub fn record_phase(phase: &'static str, deleted: u64, kept: u64) {
    counter!(TAGS_DELETED, "phase" => phase).increment(deleted);
    counter!(TAGS_KEPT, "phase" => phase).increment(kept);
}

/// Records a per-item delete failure.
pub fn record_delete_error(phase: &'static str) {
    counter!(DELETE_ERRORS, "phase" => phase).increment(1);
}

/// Records metadata record deletions.
pub fn record_metadata_deleted(count: u64) {
    counter!(METADATA_DELETED).increment(count);
}

/// Records a whole run's duration.
pub fn record_run_duration(operation: &'static str, seconds: f64) {
    histogram!(RUN_DURATION, "operation" => operation).record(seconds);
}
