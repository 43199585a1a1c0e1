//! Operation lifecycle coordination for replicated Ridgeline tablets.
//!
//! This crate provides the machinery that takes a replicated write from
//! submission to apply:
//! - The per-operation [`driver::OperationDriver`] state machine that joins
//!   local preparation with consensus replication and fires apply exactly
//!   once, in log order
//! - The [`tracker::OperationTracker`] admission gate and in-flight registry
//! - The [`preparer::Preparer`] batching queue feeding consensus
//! - Narrow interfaces to consensus and the durable log
//!
//! ## Architecture Note
//!
//! The driver is synchronous by design: its methods run on whatever thread
//! the collaborator calls from (a preparer worker, the log appender, the
//! consensus commit path), with two fine-grained locks and no suspension
//! points. Async shows up only at the edges: the preparer's drain loop and
//! the tracker's shutdown wait.

#![deny(unsafe_code)]

pub mod consensus;
pub mod driver;
pub mod error;
pub(crate) mod metrics;
pub mod operation;
pub mod order_verifier;
pub mod preparer;
pub mod tablet;
pub mod tracker;

pub use consensus::{Consensus, ConsensusRound, ReplicateMsg, WalLog};
pub use driver::{
    DriverConfig, InitError, OperationDriver, PrepareState, ReplicationState, state_string,
};
pub use error::{Result, TabletError};
pub use operation::{
    CompletionReceiver, MetadataChange, Operation, OperationPayload, OperationState, OperationType,
    RowUpsert, SnapshotRequest, TransactionUpdate, WriteRequest,
};
pub use order_verifier::OperationOrderVerifier;
pub use preparer::{Preparer, PreparerConfig};
pub use tablet::{MvccManager, TabletHandle};
pub use tracker::{OperationTracker, TrackerConfig};
