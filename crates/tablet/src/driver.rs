//! The per-operation driver: the state machine that coordinates local
//! preparation with consensus replication and fires apply exactly once.
//!
//! ## Architecture
//!
//! Every replicated operation is steered by one `OperationDriver`. Three
//! asynchronous events converge on it, each from a different thread:
//!
//! - a preparer worker finishing local preparation ([`OperationDriver::prepare_and_start`]),
//! - the log appending the entry locally ([`OperationDriver::handle_consensus_append`]),
//! - consensus reporting the entry's fate ([`OperationDriver::replication_finished`]).
//!
//! Apply may begin only when preparation succeeded *and* a quorum accepted
//! the entry. Whichever of the two lifecycles finishes last triggers it;
//! the snapshot-outside-lock pattern in `prepare_and_start` and
//! `replication_finished` guarantees exactly one of them does.
//!
//! ## Locking
//!
//! Two fine-grained locks: `op_id` has its own so readers never contend on
//! the main lock, and `inner` guards the coupled lifecycle states. Neither
//! lock is ever held across a call into the operation, consensus, the
//! preparer, or the tracker.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ridgeline_types::{HybridTime, OpId, SENTINEL_TABLET_ID, now_micros};
use tracing::{Span, debug, debug_span, error, info};

use crate::consensus::{Consensus, ConsensusRound};
use crate::error::{Result, TabletError};
use crate::metrics;
use crate::operation::{Operation, OperationType};
use crate::order_verifier::OperationOrderVerifier;
use crate::preparer::Preparer;
use crate::tablet::MvccManager;
use crate::tracker::OperationTracker;

/// Source of per-process unique driver ids, used as tracker keys.
static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Where the operation stands in the replication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Consensus has not been asked to replicate the entry yet.
    NotReplicating,
    /// The entry is in flight through consensus.
    Replicating,
    /// A quorum durably accepted the entry.
    Replicated,
    /// Consensus reported a final failure for the entry.
    ReplicationFailed,
}

impl ReplicationState {
    /// Short code used in the compact state string.
    const fn code(self) -> &'static str {
        match self {
            Self::NotReplicating => "NR",
            Self::Replicating => "R",
            Self::Replicated => "RD",
            Self::ReplicationFailed => "RF",
        }
    }
}

/// Where the operation stands in the local preparation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    /// Preparation has not completed.
    NotPrepared,
    /// Preparation completed and the operation is started.
    Prepared,
}

impl PrepareState {
    const fn code(self) -> &'static str {
        match self {
            Self::NotPrepared => "NP",
            Self::Prepared => "P",
        }
    }
}

/// Compact code for a state pair, e.g. `R-NP` for a replicating,
/// not-yet-prepared operation.
pub fn state_string(replication_state: ReplicationState, prepare_state: PrepareState) -> String {
    format!("{}-{}", replication_state.code(), prepare_state.code())
}

/// Behavior knobs injected at driver construction.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct DriverConfig {
    /// Test hook: sleep this many milliseconds in `execute_async` for write
    /// operations on tablets other than the all-zeros sentinel.
    #[builder(default = 0)]
    pub delay_execute_async_ms: u64,
}

/// Error returned by [`OperationDriver::init`].
///
/// Init consumes the operation; on failure, ownership comes back to the
/// caller here.
#[derive(Debug)]
pub struct InitError {
    /// The operation handed back to the caller.
    pub operation: Option<Arc<Operation>>,
    /// Why initialization failed.
    pub source: TabletError,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation driver init failed: {}", self.source)
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Lifecycle states coupled under the main lock.
///
/// They live behind one mutex because the invariants tie them together: a
/// status may only be read against the replication state it was recorded
/// under, and the terminal flag must flip in the same critical section that
/// decides the terminal path.
struct Inner {
    replication_state: ReplicationState,
    prepare_state: PrepareState,
    /// First failure recorded for the operation; never overwritten.
    operation_status: Option<TabletError>,
    /// Set when a terminal path (apply or abort) has claimed the driver.
    terminated: bool,
}

/// Coordinator for one replicated operation.
///
/// Created by the tablet peer, which keeps it alive through the
/// [`OperationTracker`] until the operation resolves. All methods are safe
/// to call from any thread.
pub struct OperationDriver {
    tracker: Arc<OperationTracker>,
    consensus: Arc<dyn Consensus>,
    preparer: Arc<Preparer>,
    order_verifier: Arc<OperationOrderVerifier>,
    mvcc: Arc<MvccManager>,
    config: DriverConfig,

    /// The operation being driven; taken by the terminal paths.
    operation: Mutex<Option<Arc<Operation>>>,
    inner: Mutex<Inner>,
    /// Copy of the assigned log position, under its own lock so reads never
    /// contend on `inner`.
    op_id: Mutex<OpId>,
    /// Follower-side safe time to propagate when the operation starts.
    propagated_safe_time: Mutex<Option<HybridTime>>,
    /// Wall-clock micros at entry into prepare; read by the order verifier.
    prepare_physical_micros: AtomicU64,

    driver_id: u64,
    created_at: Instant,
    span: Span,
}

impl OperationDriver {
    /// Creates a driver wired to its collaborators. The collaborators
    /// outlive every driver they spawn.
    pub fn new(
        tracker: Arc<OperationTracker>,
        consensus: Arc<dyn Consensus>,
        preparer: Arc<Preparer>,
        order_verifier: Arc<OperationOrderVerifier>,
        mvcc: Arc<MvccManager>,
        config: DriverConfig,
    ) -> Arc<Self> {
        // Created in the submitting context so the span lands under any
        // ambient request span.
        let span = debug_span!(
            "operation",
            tablet_id = %consensus.tablet_id(),
            peer = consensus.peer_uuid(),
        );
        Arc::new(Self {
            tracker,
            consensus,
            preparer,
            order_verifier,
            mvcc,
            config,
            operation: Mutex::new(None),
            inner: Mutex::new(Inner {
                replication_state: ReplicationState::NotReplicating,
                prepare_state: PrepareState::NotPrepared,
                operation_status: None,
                terminated: false,
            }),
            op_id: Mutex::new(OpId::default()),
            propagated_safe_time: Mutex::new(None),
            prepare_physical_micros: AtomicU64::new(0),
            driver_id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
            span,
        })
    }

    /// Adopts the operation and registers with the tracker.
    ///
    /// `term == OpId::UNKNOWN_TERM` selects the replica path: the entry was
    /// received from the leader, its op id and hybrid time are already
    /// fixed, and the driver starts out replicating. Any other term selects
    /// the leader path: a fresh consensus round is created, bound to the
    /// term, with this driver as its append and commit callbacks.
    ///
    /// On failure the operation is handed back inside the error and no
    /// callbacks remain registered.
    pub fn init(
        self: &Arc<Self>,
        operation: Arc<Operation>,
        term: i64,
    ) -> std::result::Result<(), InitError> {
        let _guard = self.span.enter();
        if term == OpId::UNKNOWN_TERM {
            let op_id = operation.state().op_id();
            debug_assert!(op_id.is_set(), "replica-path operation has no op id");
            *self.op_id.lock() = op_id;
            self.inner.lock().replication_state = ReplicationState::Replicating;
        } else {
            let round = self.consensus.new_round(operation.new_replicate_msg());
            if let Err(source) = round.bind_term(term) {
                return Err(InitError { operation: Some(operation), source });
            }
            round.register_driver(Arc::downgrade(self));
            operation.state().set_consensus_round(round);
        }

        *self.operation.lock() = Some(operation);
        if let Err(source) = self.tracker.add(self) {
            let operation = self.operation.lock().take();
            return Err(InitError { operation, source });
        }
        debug!(driver_id = self.driver_id, term, "driver initialized");
        Ok(())
    }

    /// Leader-side execution entry: hands the driver to the preparer.
    /// A refused submission funnels into the failure path.
    pub fn execute_async(self: &Arc<Self>) {
        let _guard = self.span.enter();
        debug!("execute_async");

        let delay_ms = self.config.delay_execute_async_ms;
        if delay_ms != 0
            && self.operation_type() == OperationType::Write
            && self.consensus.tablet_id().as_str() != SENTINEL_TABLET_ID
        {
            info!("{}debug sleep for {delay_ms} ms", self.log_prefix());
            std::thread::sleep(Duration::from_millis(delay_ms));
        }

        if let Err(status) = self.preparer.submit(Arc::clone(self)) {
            self.handle_failure(Some(status));
        }
    }

    /// Preparer-facing wrapper around [`Self::prepare_and_start`]: funnels
    /// a preparation failure into the failure path and hands back the round
    /// the caller must replicate, if any.
    pub fn prepare_and_start_task(self: &Arc<Self>) -> Option<Arc<ConsensusRound>> {
        match self.prepare_and_start() {
            Ok(round) => round,
            Err(status) => {
                self.handle_failure(Some(status));
                None
            }
        }
    }

    /// Runs local preparation and advances the state machine.
    ///
    /// Returns `Ok(Some(round))` exactly when this call moved the operation
    /// from `NotReplicating` to `Replicating`: the caller is then
    /// responsible for submitting the round to consensus, so rounds from
    /// one preparer drain replicate as a single batch.
    pub fn prepare_and_start(self: &Arc<Self>) -> Result<Option<Arc<ConsensusRound>>> {
        let _guard = self.span.enter();
        debug!("prepare_and_start");
        self.prepare_physical_micros.store(now_micros(), Ordering::Release);

        let operation = self.operation.lock().clone();
        if let Some(ref operation) = operation {
            operation.prepare()?;
        }

        // Only hold the lock long enough to copy the replication state.
        let replication_state = {
            let inner = self.inner.lock();
            if inner.terminated {
                // An abort won the race while preparation ran. Take the
                // operation rather than reuse the clone from above: the
                // abort path takes it too, and whichever take gets it is
                // the one that undoes prepare's effects (row locks).
                let status = inner.operation_status.clone();
                drop(inner);
                let taken = self.operation.lock().take();
                if let (Some(operation), Some(status)) = (taken, status) {
                    operation.aborted(&status);
                }
                return Ok(None);
            }
            assert_eq!(
                inner.prepare_state,
                PrepareState::NotPrepared,
                "operation prepared twice (state {})",
                state_string(inner.replication_state, inner.prepare_state),
            );
            inner.replication_state
        };

        if replication_state != ReplicationState::NotReplicating {
            // The hybrid time is already fixed on the consensus message, so
            // start as early as possible.
            if !self.start_operation() {
                return Ok(None);
            }
        }

        let replication_state = {
            let mut inner = self.inner.lock();
            // Nothing else runs prepare for this operation, so the state
            // cannot have changed since the check above.
            assert_eq!(
                inner.prepare_state,
                PrepareState::NotPrepared,
                "operation prepared twice (state {})",
                state_string(inner.replication_state, inner.prepare_state),
            );
            // Only after Start() may the commit callback apply this
            // operation.
            inner.prepare_state = PrepareState::Prepared;
            // Re-read: replication may have finished while the lock was
            // released, and the commit callback only triggers apply once it
            // sees Prepared. If it already fired, apply is on us.
            inner.replication_state
        };

        match replication_state {
            ReplicationState::NotReplicating => {
                let tagged = {
                    let mut inner = self.inner.lock();
                    if inner.operation_status.is_some() {
                        true
                    } else {
                        inner.replication_state = ReplicationState::Replicating;
                        false
                    }
                };
                if tagged {
                    // Tagged by an abort before replication began; abort
                    // instead of handing the round out.
                    self.handle_failure(None);
                    return Ok(None);
                }
                Ok(self.operation.lock().as_ref().and_then(|op| op.state().consensus_round()))
            }
            ReplicationState::Replicating => {
                // Replication is pending; its callback drives apply.
                Ok(None)
            }
            ReplicationState::Replicated | ReplicationState::ReplicationFailed => {
                // Both lifecycles have resolved; the failed case aborts
                // inside apply_operation.
                self.apply_operation(OpId::UNKNOWN_TERM);
                Ok(None)
            }
        }
    }

    /// Starts the operation: assigns the hybrid time and propagates any
    /// follower safe time. Returns false if the operation was taken by a
    /// concurrent abort, in which case the driver is released.
    fn start_operation(&self) -> bool {
        let operation = self.operation.lock().clone();
        if let Some(ref operation) = operation {
            operation.start();
        }
        if let Some(safe_time) = *self.propagated_safe_time.lock() {
            self.mvcc.set_propagated_safe_time_on_follower(safe_time);
        }
        if self.operation.lock().is_none() {
            self.tracker.release(self);
            return false;
        }
        true
    }

    /// Append callback: invoked by the log immediately before the entry is
    /// written locally on the leader. Stamps the hybrid time and the tablet
    /// monotonic counter into the replicate message.
    pub fn handle_consensus_append(&self) {
        if !self.start_operation() {
            return;
        }
        let _guard = self.span.enter();
        let Some(operation) = self.operation.lock().clone() else {
            return;
        };
        let Some(round) = operation.state().consensus_round() else {
            panic!("consensus append for {self} without a consensus round");
        };
        let Some(hybrid_time) = operation.state().hybrid_time() else {
            panic!("consensus append for {self} before a hybrid time was assigned");
        };
        let monotonic_counter = operation.state().tablet().monotonic_counter();
        round.update_replicate_msg(|msg| {
            assert!(
                msg.hybrid_time.is_none(),
                "hybrid time stamped twice on replicate message (existing {}, new {hybrid_time})",
                msg.hybrid_time.map(|ht| ht.to_string()).unwrap_or_default(),
            );
            msg.hybrid_time = Some(hybrid_time);
            msg.monotonic_counter = Some(monotonic_counter);
        });
        debug!(%hybrid_time, monotonic_counter, "stamped replicate message");
    }

    /// Commit callback: consensus has a final answer for this entry.
    ///
    /// On success the state moves to `Replicated`; on failure to
    /// `ReplicationFailed` with the status recorded. If preparation already
    /// finished, this call drives apply.
    pub fn replication_finished(&self, status: Result<()>, leader_term: i64) {
        let _guard = self.span.enter();
        let Some(round) = self.operation.lock().as_ref().and_then(|op| op.state().consensus_round())
        else {
            panic!("replication finished for {self} without a consensus round");
        };

        let op_id = {
            let mut op_id = self.op_id.lock();
            *op_id = round.id();
            debug_assert!(
                status.is_err() || op_id.is_set(),
                "successful replication without an op id",
            );
            *op_id
        };

        let prepare_state = {
            let operation = self.operation.lock().clone();
            let mut inner = self.inner.lock();
            if let Some(ref operation) = operation {
                operation.state().set_op_id(op_id);
            }
            assert_eq!(
                inner.replication_state,
                ReplicationState::Replicating,
                "replication finished for op {op_id} in state {}",
                state_string(inner.replication_state, inner.prepare_state),
            );
            match status {
                Ok(()) => inner.replication_state = ReplicationState::Replicated,
                Err(status) => {
                    inner.replication_state = ReplicationState::ReplicationFailed;
                    inner.operation_status = Some(status);
                }
            }
            inner.prepare_state
        };

        // If the failed branch was taken above, apply_operation aborts the
        // operation instead of applying it.
        if prepare_state == PrepareState::Prepared {
            self.apply_operation(leader_term);
        }
    }

    /// Hard-failure callback from the appender: the leader could not even
    /// append the entry. Idempotent.
    pub fn replication_failed(&self, status: TabletError) {
        let _guard = self.span.enter();
        {
            let mut inner = self.inner.lock();
            if inner.replication_state == ReplicationState::ReplicationFailed {
                return;
            }
            assert_eq!(
                inner.replication_state,
                ReplicationState::Replicating,
                "append failure in state {}",
                state_string(inner.replication_state, inner.prepare_state),
            );
            inner.operation_status = Some(status);
            inner.replication_state = ReplicationState::ReplicationFailed;
        }
        self.handle_failure(None);
    }

    /// Central failure funnel.
    ///
    /// Records the status (first failure wins) and, if the operation never
    /// entered replication or replication itself failed, aborts it and
    /// releases the tracker reference. An operation that consensus already
    /// accepted cannot be cancelled locally; reaching this funnel in that
    /// state kills the process, because dropping the operation would
    /// diverge this replica.
    pub fn handle_failure(&self, status: Option<TabletError>) {
        let _guard = self.span.enter();
        let (status, replication_state) = {
            let mut inner = self.inner.lock();
            if inner.terminated {
                // Another path already aborted this operation.
                return;
            }
            let status = match status {
                Some(status) => match inner.operation_status {
                    Some(ref existing) => {
                        error!(
                            existing = %existing,
                            new = %status,
                            state = ?inner.replication_state,
                            "operation failed twice; keeping the first status"
                        );
                        debug_assert!(false, "operation failed twice");
                        existing.clone()
                    }
                    None => {
                        inner.operation_status = Some(status.clone());
                        status
                    }
                },
                None => match inner.operation_status.clone() {
                    Some(status) => status,
                    None => panic!(
                        "failure handling without a failure status (state {})",
                        state_string(inner.replication_state, inner.prepare_state),
                    ),
                },
            };
            if matches!(
                inner.replication_state,
                ReplicationState::NotReplicating | ReplicationState::ReplicationFailed
            ) {
                inner.terminated = true;
            }
            (status, inner.replication_state)
        };

        match replication_state {
            ReplicationState::NotReplicating | ReplicationState::ReplicationFailed => {
                debug!("{}failed prior to replication success: {status}", self.log_prefix());
                let operation = self.operation.lock().take();
                if let Some(operation) = operation {
                    operation.aborted(&status);
                }
                metrics::record_operation_aborted();
                self.tracker.release(self);
            }
            ReplicationState::Replicating | ReplicationState::Replicated => {
                panic!("cannot cancel {self}: already accepted by consensus ({status})");
            }
        }
    }

    /// External cancellation request.
    ///
    /// Aborts immediately if replication has not begun. Otherwise only tags
    /// the operation: the recorded status makes the failed branch run when
    /// the natural sequence reaches apply.
    pub fn abort(&self, status: TabletError) {
        let _guard = self.span.enter();
        let replication_state = {
            let mut inner = self.inner.lock();
            if inner.operation_status.is_none() {
                inner.operation_status = Some(status);
            }
            inner.replication_state
        };
        if replication_state == ReplicationState::NotReplicating {
            self.handle_failure(None);
        }
    }

    /// The apply gate: runs once both lifecycles have resolved. Verifies
    /// apply order on the success path; routes the failure path to the
    /// failure funnel.
    fn apply_operation(&self, leader_term: i64) {
        let op_id = self.op_id();
        let failed = {
            let inner = self.inner.lock();
            assert_eq!(
                inner.prepare_state,
                PrepareState::Prepared,
                "apply for op {op_id} before preparation finished",
            );
            match inner.operation_status {
                None => {
                    assert_eq!(
                        inner.replication_state,
                        ReplicationState::Replicated,
                        "apply for op {op_id} in state {}",
                        state_string(inner.replication_state, inner.prepare_state),
                    );
                    self.order_verifier.check_apply(
                        op_id.index,
                        self.prepare_physical_micros.load(Ordering::Acquire),
                    );
                    false
                }
                Some(_) => {
                    assert_eq!(
                        inner.replication_state,
                        ReplicationState::ReplicationFailed,
                        "failed status with state {}",
                        state_string(inner.replication_state, inner.prepare_state),
                    );
                    true
                }
            }
        };

        if failed {
            self.handle_failure(None);
            return;
        }

        self.apply_task(leader_term);
    }

    /// Applies the operation and releases the driver. The caller's strong
    /// reference keeps the driver alive even though `replicated` may
    /// synchronously resolve the submitter.
    fn apply_task(&self, leader_term: i64) {
        let _guard = self.span.enter();
        #[cfg(debug_assertions)]
        {
            let inner = self.inner.lock();
            debug_assert_eq!(inner.replication_state, ReplicationState::Replicated);
            debug_assert_eq!(inner.prepare_state, PrepareState::Prepared);
        }

        let operation = {
            let mut inner = self.inner.lock();
            inner.terminated = true;
            drop(inner);
            self.operation.lock().take()
        };
        let Some(operation) = operation else {
            panic!("apply for {self} without an operation");
        };
        if let Err(status) = operation.replicated(leader_term) {
            // Storage must apply what consensus committed; a failure here
            // means the replica has diverged.
            panic!("apply failed for {self}: {status}");
        }
        metrics::record_operation_applied(self.created_at.elapsed());
        self.tracker.release(self);
    }

    /// Follower path: safe time propagated by the leader, applied when the
    /// operation starts.
    pub fn set_propagated_safe_time(&self, safe_time: HybridTime) {
        *self.propagated_safe_time.lock() = Some(safe_time);
    }

    /// The operation's log position; zero until known.
    pub fn op_id(&self) -> OpId {
        *self.op_id.lock()
    }

    /// The driven operation's type; `Empty` once the operation resolved.
    pub fn operation_type(&self) -> OperationType {
        self.operation.lock().as_ref().map_or(OperationType::Empty, |op| op.op_type())
    }

    /// Current replication lifecycle state.
    pub fn replication_state(&self) -> ReplicationState {
        self.inner.lock().replication_state
    }

    /// Current preparation lifecycle state.
    pub fn prepare_state(&self) -> PrepareState {
        self.inner.lock().prepare_state
    }

    /// The driven operation, while it is still in flight.
    pub fn operation(&self) -> Option<Arc<Operation>> {
        self.operation.lock().clone()
    }

    /// Tracker key for this driver.
    pub(crate) fn id(&self) -> u64 {
        self.driver_id
    }

    /// Log message prefix identifying tablet, peer, state, and hybrid time.
    pub fn log_prefix(&self) -> String {
        let (replication_state, prepare_state) = {
            let inner = self.inner.lock();
            (inner.replication_state, inner.prepare_state)
        };
        let hybrid_time = self.operation.lock().as_ref().and_then(|op| op.state().hybrid_time());
        let ts = match hybrid_time {
            Some(ht) => ht.to_string(),
            None => "No hybrid_time".to_string(),
        };
        format!(
            "T {} P {} S {} Ts {}: ",
            self.consensus.tablet_id(),
            self.consensus.peer_uuid(),
            state_string(replication_state, prepare_state),
            ts,
        )
    }
}

impl fmt::Display for OperationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (replication_state, prepare_state) = {
            let inner = self.inner.lock();
            (inner.replication_state, inner.prepare_state)
        };
        write!(f, "{}", state_string(replication_state, prepare_state))?;
        match self.operation.lock().as_ref() {
            Some(operation) => write!(f, " {operation}"),
            None => write!(f, " [unknown operation]"),
        }
    }
}
