//! Observability metrics for the operation pipeline using the `metrics`
//! crate facade.
//!
//! ## Metric Naming Conventions
//!
//! All metrics follow the pattern: `ridgeline_tablet_{name}_{unit}`
//!
//! - Counters: `_total` suffix
//! - Histograms: `_seconds` or size suffix
//! - Gauges: no suffix

use std::time::Duration;

use metrics::{counter, gauge, histogram};

// =============================================================================
// Metric Names (constants for consistency)
// =============================================================================

const OPERATIONS_INFLIGHT: &str = "ridgeline_tablet_operations_inflight";
const OPERATIONS_APPLIED_TOTAL: &str = "ridgeline_tablet_operations_applied_total";
const OPERATIONS_ABORTED_TOTAL: &str = "ridgeline_tablet_operations_aborted_total";
const OPERATION_APPLY_LATENCY: &str = "ridgeline_tablet_operation_apply_latency_seconds";
const ADMISSION_REJECTED_TOTAL: &str = "ridgeline_tablet_admission_rejected_total";
const PREPARE_BATCH_SIZE: &str = "ridgeline_tablet_prepare_batch_size";

/// Update the gauge of operations currently registered with the tracker.
pub(crate) fn set_inflight_operations(count: usize) {
    gauge!(OPERATIONS_INFLIGHT).set(count as f64);
}

/// Record a successfully applied operation and its end-to-end latency
/// (driver creation to apply).
pub(crate) fn record_operation_applied(latency: Duration) {
    counter!(OPERATIONS_APPLIED_TOTAL).increment(1);
    histogram!(OPERATION_APPLY_LATENCY).record(latency.as_secs_f64());
}

/// Record an aborted operation.
pub(crate) fn record_operation_aborted() {
    counter!(OPERATIONS_ABORTED_TOTAL).increment(1);
}

/// Record a refused tracker admission, labeled with the refusal reason.
pub(crate) fn record_admission_rejected(reason: &'static str) {
    counter!(ADMISSION_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record the number of consensus rounds handed to one replicate batch.
pub(crate) fn record_prepare_batch(size: usize) {
    histogram!(PREPARE_BATCH_SIZE).record(size as f64);
}
