//! Shared test fixtures: an in-memory consensus + log pair and a wired-up
//! tablet harness.

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use ridgeline_tablet::{
    Consensus, ConsensusRound, DriverConfig, MvccManager, Operation, OperationDriver,
    OperationOrderVerifier, OperationPayload, OperationTracker, Preparer, PreparerConfig,
    ReplicateMsg, Result, RowUpsert, TabletError, TabletHandle, TrackerConfig, WalLog,
    WriteRequest,
};
use ridgeline_types::{HybridTime, OpId, TabletId};

/// How the mock delivers replication outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Commit every round as soon as it is appended.
    AutoCommit,
    /// Hold appended rounds for the test to complete by hand.
    Manual,
}

/// In-memory durable log. Fires the append callback immediately before the
/// entry is recorded, like the real appender.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<ReplicateMsg>>,
}

impl MemoryLog {
    pub fn entries(&self) -> Vec<ReplicateMsg> {
        self.entries.lock().clone()
    }
}

impl WalLog for MemoryLog {
    fn append(&self, round: &Arc<ConsensusRound>) -> Result<()> {
        round.notify_append();
        self.entries.lock().push(round.replicate_msg());
        Ok(())
    }
}

/// Scripted consensus: assigns op ids sequentially, appends through a
/// [`MemoryLog`], and either auto-commits or parks rounds for the test.
pub struct MockConsensus {
    tablet_id: TabletId,
    peer_uuid: String,
    term: AtomicI64,
    next_index: AtomicI64,
    mode: DeliveryMode,
    pub log: Arc<MemoryLog>,
    pending: Mutex<Vec<Arc<ConsensusRound>>>,
    replicate_calls: AtomicUsize,
    fail_next_with: Mutex<Option<TabletError>>,
}

impl MockConsensus {
    pub fn new(tablet_id: TabletId, mode: DeliveryMode) -> Arc<Self> {
        Arc::new(Self {
            tablet_id,
            peer_uuid: "peer-1".to_string(),
            term: AtomicI64::new(1),
            next_index: AtomicI64::new(1),
            mode,
            log: Arc::new(MemoryLog::default()),
            pending: Mutex::new(Vec::new()),
            replicate_calls: AtomicUsize::new(0),
            fail_next_with: Mutex::new(None),
        })
    }

    /// Number of replicate_batch invocations observed.
    pub fn replicate_calls(&self) -> usize {
        self.replicate_calls.load(Ordering::Acquire)
    }

    /// Makes the next replicate_batch call fail with `status`.
    pub fn fail_next_replicate(&self, status: TabletError) {
        *self.fail_next_with.lock() = Some(status);
    }

    /// Takes the rounds parked in manual mode.
    pub fn take_pending(&self) -> Vec<Arc<ConsensusRound>> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Commits every parked round at its bound term.
    pub fn commit_pending(&self) {
        for round in self.take_pending() {
            let term = round.bound_term().unwrap_or_else(|| self.term.load(Ordering::Acquire));
            round.notify_replication_finished(Ok(()), term);
        }
    }
}

impl Consensus for MockConsensus {
    fn new_round(&self, replicate_msg: ReplicateMsg) -> Arc<ConsensusRound> {
        ConsensusRound::new(replicate_msg)
    }

    fn replicate_batch(&self, rounds: &[Arc<ConsensusRound>]) -> Result<()> {
        self.replicate_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(status) = self.fail_next_with.lock().take() {
            return Err(status);
        }
        for round in rounds {
            let term = round.bound_term().unwrap_or_else(|| self.term.load(Ordering::Acquire));
            let index = self.next_index.fetch_add(1, Ordering::AcqRel);
            round.set_id(OpId::new(term, index));
            self.log.append(round)?;
            match self.mode {
                DeliveryMode::AutoCommit => round.notify_replication_finished(Ok(()), term),
                DeliveryMode::Manual => self.pending.lock().push(Arc::clone(round)),
            }
        }
        Ok(())
    }

    fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    fn peer_uuid(&self) -> &str {
        &self.peer_uuid
    }
}

/// A fully wired tablet: tracker, preparer, verifier, MVCC, and mock
/// consensus.
pub struct TestTablet {
    pub tablet: Arc<TabletHandle>,
    pub mvcc: Arc<MvccManager>,
    pub tracker: Arc<OperationTracker>,
    pub verifier: Arc<OperationOrderVerifier>,
    pub consensus: Arc<MockConsensus>,
    pub preparer: Arc<Preparer>,
}

impl TestTablet {
    pub fn new(mode: DeliveryMode) -> Self {
        Self::with_options(mode, TabletId::new("f00dcafe00000000"), TrackerConfig::default())
    }

    pub fn with_tablet_id(mode: DeliveryMode, tablet_id: TabletId) -> Self {
        Self::with_options(mode, tablet_id, TrackerConfig::default())
    }

    pub fn with_tracker_config(mode: DeliveryMode, config: TrackerConfig) -> Self {
        Self::with_options(mode, TabletId::new("f00dcafe00000000"), config)
    }

    pub fn with_options(mode: DeliveryMode, tablet_id: TabletId, tracker: TrackerConfig) -> Self {
        let consensus = MockConsensus::new(tablet_id.clone(), mode);
        let preparer = Preparer::new(
            PreparerConfig::builder().tick_interval(Duration::from_micros(200)).build(),
            Arc::clone(&consensus) as Arc<dyn Consensus>,
        );
        Self {
            tablet: Arc::new(TabletHandle::new(tablet_id)),
            mvcc: Arc::new(MvccManager::new()),
            tracker: Arc::new(OperationTracker::new(tracker)),
            verifier: Arc::new(OperationOrderVerifier::new()),
            consensus,
            preparer,
        }
    }

    /// Spawns the preparer drain loop on the current runtime.
    pub fn spawn_preparer(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.preparer).run())
    }

    pub fn driver(&self) -> Arc<OperationDriver> {
        self.driver_with_config(DriverConfig::default())
    }

    pub fn driver_with_config(&self, config: DriverConfig) -> Arc<OperationDriver> {
        OperationDriver::new(
            Arc::clone(&self.tracker),
            Arc::clone(&self.consensus) as Arc<dyn Consensus>,
            Arc::clone(&self.preparer),
            Arc::clone(&self.verifier),
            Arc::clone(&self.mvcc),
            config,
        )
    }

    /// A single-row write operation.
    pub fn write_op(&self, key: &[u8]) -> (Arc<Operation>, ridgeline_tablet::CompletionReceiver) {
        Operation::new(
            Arc::clone(&self.tablet),
            OperationPayload::Write(WriteRequest {
                rows: vec![RowUpsert { key: key.to_vec(), value: b"value".to_vec() }],
            }),
        )
    }

    /// An operation as received from the leader: op id, hybrid time, and
    /// consensus round already fixed.
    pub fn replica_op(
        &self,
        op_id: OpId,
        hybrid_time: HybridTime,
        key: &[u8],
    ) -> (Arc<Operation>, ridgeline_tablet::CompletionReceiver) {
        let (operation, rx) = self.write_op(key);
        operation.state().set_op_id(op_id);
        operation.state().set_hybrid_time(hybrid_time);
        let round = ConsensusRound::new(operation.new_replicate_msg());
        round.set_id(op_id);
        operation.state().set_consensus_round(round);
        (operation, rx)
    }
}

/// Polls `cond` until it holds or a 1s deadline passes.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}
