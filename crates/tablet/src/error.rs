//! Error types for the tablet operation pipeline using snafu.
//!
//! A single taxonomy covers the three failure domains an operation can hit:
//! local preparation (validation, row locks), consensus replication (quorum
//! loss, leadership changes), and admission (shutdown, quota). Statuses are
//! cloneable so the first failure can be stored on the operation and handed
//! to every observer unchanged.
//!
//! Protocol violations (a hybrid time stamped twice, an apply before both
//! lifecycles finished) are not errors: they indicate a bug in a collaborator
//! and abort the process.

use snafu::Snafu;

/// Unified result type for tablet operations.
pub type Result<T, E = TabletError> = std::result::Result<T, E>;

/// Failure statuses flowing through the operation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum TabletError {
    /// A component refused new work because it is shutting down.
    #[snafu(display("{component} is shutting down"))]
    ShuttingDown {
        /// The component that refused the work.
        component: &'static str,
    },

    /// The request is malformed or violates a validation rule.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument {
        /// Description of the violated rule.
        message: String,
    },

    /// A contract of the driver surface was misused by the caller.
    #[snafu(display("illegal state: {message}"))]
    IllegalState {
        /// Description of the misuse.
        message: String,
    },

    /// A row key is already locked by another in-flight operation.
    #[snafu(display("row lock conflict on key {key:02x?}"))]
    LockConflict {
        /// The contended row key.
        key: Vec<u8>,
    },

    /// The tablet has too many operations in flight.
    #[snafu(display("operation quota exceeded: {inflight} in flight (limit {limit})"))]
    OperationQuotaExceeded {
        /// Operations currently tracked.
        inflight: usize,
        /// The admission limit.
        limit: usize,
    },

    /// A deadline elapsed before the work completed.
    #[snafu(display("timed out: {message}"))]
    TimedOut {
        /// What was being waited for.
        message: String,
    },

    /// This peer stopped being the leader while the entry was in flight.
    #[snafu(display("leadership lost at term {term}"))]
    LeadershipLost {
        /// The term in which leadership was held.
        term: i64,
    },

    /// The operation was cancelled by an external request.
    #[snafu(display("operation cancelled: {message}"))]
    Cancelled {
        /// Who or what requested the cancellation.
        message: String,
    },
}
