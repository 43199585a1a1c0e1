//! Replicated operations and their shared per-operation state.
//!
//! An [`Operation`] is one replicated state transition. The payload is a
//! tagged variant per operation type; each variant carries its own
//! validation in [`Operation::prepare`]. The surrounding record holds the
//! state both lifecycles touch (op id, hybrid time, consensus round) and a
//! one-shot completion channel that resolves when the operation is either
//! applied or aborted.
//!
//! Operations are shared as `Arc<Operation>` so driver callbacks can reach
//! them without holding the driver lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use ridgeline_types::{HybridTime, OpId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::consensus::{ConsensusRound, ReplicateMsg};
use crate::error::{InvalidArgumentSnafu, Result, TabletError};
use crate::tablet::TabletHandle;

/// Largest accepted row key, in bytes.
pub const MAX_ROW_KEY_BYTES: usize = 4096;

/// The kind of state transition an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Row mutations.
    Write,
    /// Schema version change.
    ChangeMetadata,
    /// Snapshot directive.
    Snapshot,
    /// Transaction status record.
    UpdateTransaction,
    /// No payload; leader no-ops and placeholder entries.
    Empty,
}

impl OperationType {
    /// Lowercase name used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::ChangeMetadata => "change_metadata",
            Self::Snapshot => "snapshot",
            Self::UpdateTransaction => "update_transaction",
            Self::Empty => "empty",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row mutation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpsert {
    /// Encoded row key.
    pub key: Vec<u8>,
    /// Encoded row value.
    pub value: Vec<u8>,
}

/// A batch of row mutations applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// The rows to upsert.
    pub rows: Vec<RowUpsert>,
}

/// A schema version bump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChange {
    /// The new schema version; must exceed the tablet's current version.
    pub schema_version: u32,
}

/// A snapshot directive replicated through the log so every peer cuts at
/// the same position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Identifier of the snapshot being created.
    pub snapshot_id: String,
}

/// A transaction status record from the transaction coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    /// The transaction being resolved.
    pub transaction_id: String,
    /// Whether the transaction committed (false: rolled back).
    pub committed: bool,
}

/// Per-type operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPayload {
    /// Row mutations.
    Write(WriteRequest),
    /// Schema version change.
    ChangeMetadata(MetadataChange),
    /// Snapshot directive.
    Snapshot(SnapshotRequest),
    /// Transaction status record.
    UpdateTransaction(TransactionUpdate),
    /// No payload.
    Empty,
}

impl OperationPayload {
    /// The operation type this payload belongs to.
    pub const fn op_type(&self) -> OperationType {
        match self {
            Self::Write(_) => OperationType::Write,
            Self::ChangeMetadata(_) => OperationType::ChangeMetadata,
            Self::Snapshot(_) => OperationType::Snapshot,
            Self::UpdateTransaction(_) => OperationType::UpdateTransaction,
            Self::Empty => OperationType::Empty,
        }
    }
}

/// State shared between an operation and the collaborators driving it.
#[derive(Debug)]
pub struct OperationState {
    tablet: Arc<TabletHandle>,
    op_id: Mutex<OpId>,
    hybrid_time: Mutex<Option<HybridTime>>,
    consensus_round: Mutex<Option<Arc<ConsensusRound>>>,
}

impl OperationState {
    /// Creates empty state bound to a tablet.
    pub fn new(tablet: Arc<TabletHandle>) -> Self {
        Self {
            tablet,
            op_id: Mutex::new(OpId::default()),
            hybrid_time: Mutex::new(None),
            consensus_round: Mutex::new(None),
        }
    }

    /// The tablet this operation runs against.
    pub fn tablet(&self) -> &Arc<TabletHandle> {
        &self.tablet
    }

    /// The operation's log position; zero until assigned.
    pub fn op_id(&self) -> OpId {
        *self.op_id.lock()
    }

    /// Records the operation's log position.
    pub fn set_op_id(&self, op_id: OpId) {
        *self.op_id.lock() = op_id;
    }

    /// The operation's hybrid time, if assigned.
    pub fn hybrid_time(&self) -> Option<HybridTime> {
        *self.hybrid_time.lock()
    }

    /// Pre-assigns a hybrid time. Used on the replica path, where the value
    /// arrives with the log entry. The assignment is set-once.
    pub fn set_hybrid_time(&self, hybrid_time: HybridTime) {
        let mut slot = self.hybrid_time.lock();
        assert!(
            slot.is_none(),
            "hybrid time assigned twice: {hybrid_time} after {}",
            slot.map(|ht| ht.to_string()).unwrap_or_default(),
        );
        *slot = Some(hybrid_time);
    }

    /// Assigns a hybrid time from the tablet clock unless one is already
    /// fixed (replica path).
    fn assign_hybrid_time_if_unset(&self) {
        let mut slot = self.hybrid_time.lock();
        if slot.is_none() {
            *slot = Some(self.tablet.clock().now());
        }
    }

    /// The consensus round carrying this operation, if one was created.
    pub fn consensus_round(&self) -> Option<Arc<ConsensusRound>> {
        self.consensus_round.lock().clone()
    }

    /// Binds the consensus round created for this operation.
    pub fn set_consensus_round(&self, round: Arc<ConsensusRound>) {
        *self.consensus_round.lock() = Some(round);
    }
}

/// Handle on which the submitter awaits the operation outcome.
pub type CompletionReceiver = oneshot::Receiver<Result<()>>;

/// One replicated state transition.
pub struct Operation {
    payload: OperationPayload,
    state: OperationState,
    /// Row keys locked during prepare; released when the operation resolves.
    locked_keys: Mutex<Vec<Vec<u8>>>,
    completion: Mutex<Option<oneshot::Sender<Result<()>>>>,
    /// Times an outcome was delivered; anything past one is a driver bug.
    resolutions: AtomicUsize,
}

impl Operation {
    /// Creates an operation and the receiver its submitter awaits.
    pub fn new(
        tablet: Arc<TabletHandle>,
        payload: OperationPayload,
    ) -> (Arc<Self>, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let operation = Arc::new(Self {
            payload,
            state: OperationState::new(tablet),
            locked_keys: Mutex::new(Vec::new()),
            completion: Mutex::new(Some(tx)),
            resolutions: AtomicUsize::new(0),
        });
        (operation, rx)
    }

    /// The operation's type.
    pub fn op_type(&self) -> OperationType {
        self.payload.op_type()
    }

    /// The operation's payload.
    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    /// The operation's shared state.
    pub fn state(&self) -> &OperationState {
        &self.state
    }

    /// Builds the message replicated through consensus for this operation.
    pub fn new_replicate_msg(&self) -> ReplicateMsg {
        ReplicateMsg::new(
            self.op_type(),
            self.state.tablet().tablet_id().clone(),
            self.payload.clone(),
        )
    }

    /// Local validation and lock acquisition. Runs on a preparer worker,
    /// independent of consensus.
    pub fn prepare(&self) -> Result<()> {
        match &self.payload {
            OperationPayload::Write(request) => {
                if request.rows.is_empty() {
                    return InvalidArgumentSnafu { message: "write batch is empty" }.fail();
                }
                for row in &request.rows {
                    if row.key.is_empty() {
                        return InvalidArgumentSnafu { message: "row key is empty" }.fail();
                    }
                    if row.key.len() > MAX_ROW_KEY_BYTES {
                        return InvalidArgumentSnafu {
                            message: format!(
                                "row key is {} bytes (limit {MAX_ROW_KEY_BYTES})",
                                row.key.len()
                            ),
                        }
                        .fail();
                    }
                }
                let keys: Vec<Vec<u8>> = request.rows.iter().map(|r| r.key.clone()).collect();
                self.state.tablet().lock_rows(&keys)?;
                *self.locked_keys.lock() = keys;
            }
            OperationPayload::ChangeMetadata(change) => {
                let current = self.state.tablet().schema_version();
                if change.schema_version <= current {
                    return InvalidArgumentSnafu {
                        message: format!(
                            "schema version {} is not newer than current version {current}",
                            change.schema_version
                        ),
                    }
                    .fail();
                }
            }
            OperationPayload::Snapshot(request) => {
                if request.snapshot_id.is_empty() {
                    return InvalidArgumentSnafu { message: "snapshot id is empty" }.fail();
                }
            }
            OperationPayload::UpdateTransaction(update) => {
                if update.transaction_id.is_empty() {
                    return InvalidArgumentSnafu { message: "transaction id is empty" }.fail();
                }
            }
            OperationPayload::Empty => {}
        }
        debug!(op_type = %self.op_type(), "operation prepared");
        Ok(())
    }

    /// Marks the operation started: fixes its hybrid time unless the
    /// replica path already did.
    pub fn start(&self) {
        self.state.assign_hybrid_time_if_unset();
    }

    /// Applies the operation after both lifecycles succeeded. `leader_term`
    /// is the term under which replication completed.
    pub fn replicated(&self, leader_term: i64) -> Result<()> {
        match &self.payload {
            OperationPayload::Write(_) => {
                // External replication consumes the counter as a per-tablet
                // total order over applied writes.
                self.state.tablet().bump_monotonic_counter();
            }
            OperationPayload::ChangeMetadata(change) => {
                self.state.tablet().raise_schema_version(change.schema_version);
            }
            OperationPayload::Snapshot(_)
            | OperationPayload::UpdateTransaction(_)
            | OperationPayload::Empty => {}
        }
        self.release_row_locks();
        debug!(
            op_type = %self.op_type(),
            op_id = %self.state.op_id(),
            leader_term,
            "operation applied"
        );
        self.resolve(Ok(()));
        Ok(())
    }

    /// Resolves the operation as failed before it could be applied.
    pub fn aborted(&self, status: &TabletError) {
        self.release_row_locks();
        debug!(op_type = %self.op_type(), %status, "operation aborted");
        self.resolve(Err(status.clone()));
    }

    fn release_row_locks(&self) {
        let keys = std::mem::take(&mut *self.locked_keys.lock());
        if !keys.is_empty() {
            self.state.tablet().unlock_rows(&keys);
        }
    }

    /// Number of outcomes delivered so far: 0 while in flight, 1 once the
    /// operation was applied or aborted.
    pub fn resolution_count(&self) -> usize {
        self.resolutions.load(Ordering::Acquire)
    }

    fn resolve(&self, outcome: Result<()>) {
        let prior = self.resolutions.fetch_add(1, Ordering::AcqRel);
        if prior > 0 {
            error!(op_type = %self.op_type(), deliveries = prior + 1, "operation resolved twice");
            debug_assert!(false, "operation resolved twice");
            return;
        }
        if let Some(tx) = self.completion.lock().take() {
            // The submitter may have given up waiting; that is not an error.
            let _ = tx.send(outcome);
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("op_type", &self.op_type())
            .field("op_id", &self.state.op_id())
            .field("hybrid_time", &self.state.hybrid_time())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation [op id {}", self.op_type(), self.state.op_id())?;
        match self.state.hybrid_time() {
            Some(ht) => write!(f, ", hybrid time {ht}]"),
            None => write!(f, ", no hybrid time]"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use ridgeline_types::TabletId;

    use super::*;

    fn tablet() -> Arc<TabletHandle> {
        Arc::new(TabletHandle::new(TabletId::new("0f0f0f")))
    }

    fn write_payload(keys: &[&[u8]]) -> OperationPayload {
        OperationPayload::Write(WriteRequest {
            rows: keys
                .iter()
                .map(|k| RowUpsert { key: k.to_vec(), value: b"v".to_vec() })
                .collect(),
        })
    }

    #[test]
    fn test_prepare_rejects_empty_write_batch() {
        let (op, _rx) = Operation::new(tablet(), write_payload(&[]));
        let err = op.prepare().unwrap_err();
        assert!(matches!(err, TabletError::InvalidArgument { .. }));
    }

    #[test]
    fn test_prepare_rejects_oversized_key() {
        let big = vec![0u8; MAX_ROW_KEY_BYTES + 1];
        let (op, _rx) = Operation::new(
            tablet(),
            OperationPayload::Write(WriteRequest {
                rows: vec![RowUpsert { key: big, value: Vec::new() }],
            }),
        );
        assert!(matches!(op.prepare(), Err(TabletError::InvalidArgument { .. })));
    }

    #[test]
    fn test_prepare_locks_rows_until_resolution() {
        let tablet = tablet();
        let (op, mut rx) = Operation::new(Arc::clone(&tablet), write_payload(&[b"k"]));
        op.prepare().unwrap();
        assert_eq!(tablet.locked_row_count(), 1);

        // A second write on the same key conflicts while the first holds
        // its lock.
        let (contender, _rx2) = Operation::new(Arc::clone(&tablet), write_payload(&[b"k"]));
        assert!(matches!(contender.prepare(), Err(TabletError::LockConflict { .. })));

        op.start();
        op.replicated(1).unwrap();
        assert_eq!(tablet.locked_row_count(), 0);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_outcome_is_delivered_exactly_once() {
        let (op, mut rx) = Operation::new(tablet(), write_payload(&[b"k"]));
        assert_eq!(op.resolution_count(), 0);
        op.prepare().unwrap();
        op.start();
        op.replicated(1).unwrap();
        assert_eq!(op.resolution_count(), 1);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_aborted_releases_locks_and_reports_status() {
        let tablet = tablet();
        let (op, mut rx) = Operation::new(Arc::clone(&tablet), write_payload(&[b"k"]));
        op.prepare().unwrap();

        let status = TabletError::Cancelled { message: "tablet shutdown".into() };
        op.aborted(&status);
        assert_eq!(tablet.locked_row_count(), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), status);
    }

    #[test]
    fn test_prepare_rejects_stale_schema_version() {
        let tablet = tablet();
        tablet.raise_schema_version(4);
        let (op, _rx) = Operation::new(
            Arc::clone(&tablet),
            OperationPayload::ChangeMetadata(MetadataChange { schema_version: 4 }),
        );
        assert!(matches!(op.prepare(), Err(TabletError::InvalidArgument { .. })));
    }

    #[test]
    fn test_change_metadata_applies_on_replicated() {
        let tablet = tablet();
        let (op, _rx) = Operation::new(
            Arc::clone(&tablet),
            OperationPayload::ChangeMetadata(MetadataChange { schema_version: 2 }),
        );
        op.prepare().unwrap();
        op.start();
        op.replicated(3).unwrap();
        assert_eq!(tablet.schema_version(), 2);
    }

    #[test]
    fn test_start_keeps_preassigned_hybrid_time() {
        let (op, _rx) = Operation::new(tablet(), OperationPayload::Empty);
        let fixed = HybridTime::from_micros(1_700_000_000_000_000);
        op.state().set_hybrid_time(fixed);
        op.start();
        assert_eq!(op.state().hybrid_time(), Some(fixed));
    }

    #[test]
    fn test_start_assigns_hybrid_time_from_clock() {
        let (op, _rx) = Operation::new(tablet(), write_payload(&[b"k"]));
        assert!(op.state().hybrid_time().is_none());
        op.start();
        assert!(op.state().hybrid_time().is_some());
    }

    #[test]
    #[should_panic(expected = "hybrid time assigned twice")]
    fn test_set_hybrid_time_twice_is_fatal() {
        let (op, _rx) = Operation::new(tablet(), OperationPayload::Empty);
        op.state().set_hybrid_time(HybridTime::from_micros(1));
        op.state().set_hybrid_time(HybridTime::from_micros(2));
    }

    #[test]
    fn test_display_reports_state() {
        let (op, _rx) = Operation::new(tablet(), write_payload(&[b"k"]));
        assert_eq!(op.to_string(), "write operation [op id 0.0, no hybrid time]");
    }
}
