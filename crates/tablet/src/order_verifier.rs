//! Apply-order verification.
//!
//! Storage requires that operations apply in log-index order within a
//! tablet. The pipeline does not sequence applies across drivers itself;
//! this verifier observes every apply and kills the process on a violation,
//! because an out-of-order apply has already diverged the replica.

use parking_lot::Mutex;
use tracing::warn;

struct VerifierInner {
    /// Log index of the last apply observed; zero before the first.
    last_index: i64,
    /// Prepare timestamp (wall-clock micros) of the last apply observed.
    last_prepare_micros: u64,
}

/// Asserts that applies for one tablet happen in strictly increasing
/// log-index order.
pub struct OperationOrderVerifier {
    inner: Mutex<VerifierInner>,
}

impl Default for OperationOrderVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationOrderVerifier {
    /// Creates a verifier that has observed no applies.
    pub fn new() -> Self {
        Self { inner: Mutex::new(VerifierInner { last_index: 0, last_prepare_micros: 0 }) }
    }

    /// Records one apply. Called exactly once per operation, at apply time.
    ///
    /// # Panics
    ///
    /// Panics if `log_index` does not strictly exceed the last index seen.
    pub fn check_apply(&self, log_index: i64, prepare_physical_micros: u64) {
        let mut inner = self.inner.lock();
        assert!(
            log_index > inner.last_index,
            "out-of-order apply: log index {log_index} (prepared at {prepare_physical_micros}) \
             after index {} (prepared at {})",
            inner.last_index,
            inner.last_prepare_micros,
        );
        // A skipped index is not locally provable as a bug: this replica may
        // never have hosted a driver for it.
        if inner.last_index > 0 && log_index != inner.last_index + 1 {
            warn!(log_index, last_index = inner.last_index, "gap in applied log indexes");
        }
        inner.last_index = log_index;
        inner.last_prepare_micros = prepare_physical_micros;
    }

    /// Log index of the most recent apply; zero before the first.
    pub fn last_applied_index(&self) -> i64 {
        self.inner.lock().last_index
    }
}
