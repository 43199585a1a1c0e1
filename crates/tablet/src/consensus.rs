//! Interfaces to the consensus and durable-log subsystems.
//!
//! The operation pipeline never replicates or persists anything itself; it
//! talks to consensus through the narrow seams defined here. A
//! [`ConsensusRound`] is the per-entry handle: it carries the replicate
//! message, the term it was proposed under, the log position assigned by
//! consensus, and a weak back-reference to the operation driver that is
//! notified as the entry moves through append and commit.
//!
//! The back-reference is weak so the round never keeps a driver alive; a
//! notification arriving after the driver is gone is dropped.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use ridgeline_types::{HybridTime, OpId, TabletId};
use serde::{Deserialize, Serialize};

use crate::driver::OperationDriver;
use crate::error::{IllegalStateSnafu, InvalidArgumentSnafu, Result, TabletError};
use crate::operation::{OperationPayload, OperationType};

/// The message replicated through consensus for one operation.
///
/// The hybrid time and monotonic counter are absent until the append
/// callback stamps them, immediately before the entry is written to the
/// local log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateMsg {
    /// Operation type of the carried payload.
    pub op_type: OperationType,
    /// Tablet the entry belongs to.
    pub tablet_id: TabletId,
    /// Commit timestamp; stamped exactly once at append.
    pub hybrid_time: Option<HybridTime>,
    /// Tablet monotonic counter at append time.
    pub monotonic_counter: Option<i64>,
    /// The operation payload.
    pub payload: OperationPayload,
}

impl ReplicateMsg {
    /// Creates an unstamped message for a payload.
    pub fn new(op_type: OperationType, tablet_id: TabletId, payload: OperationPayload) -> Self {
        Self { op_type, tablet_id, hybrid_time: None, monotonic_counter: None, payload }
    }
}

/// Per-entry consensus handle.
pub struct ConsensusRound {
    replicate_msg: Mutex<ReplicateMsg>,
    bound_term: Mutex<Option<i64>>,
    id: Mutex<OpId>,
    driver: Mutex<Option<Weak<OperationDriver>>>,
}

impl ConsensusRound {
    /// Creates a round carrying `replicate_msg`, not yet bound to a term.
    pub fn new(replicate_msg: ReplicateMsg) -> Arc<Self> {
        Arc::new(Self {
            replicate_msg: Mutex::new(replicate_msg),
            bound_term: Mutex::new(None),
            id: Mutex::new(OpId::default()),
            driver: Mutex::new(None),
        })
    }

    /// Binds the round to the term it is proposed under. Set-once.
    pub fn bind_term(&self, term: i64) -> Result<()> {
        if term < 0 {
            return InvalidArgumentSnafu { message: format!("cannot bind negative term {term}") }
                .fail();
        }
        let mut bound = self.bound_term.lock();
        if let Some(existing) = *bound {
            return IllegalStateSnafu {
                message: format!("round already bound to term {existing}"),
            }
            .fail();
        }
        *bound = Some(term);
        Ok(())
    }

    /// The term this round is bound to, if any.
    pub fn bound_term(&self) -> Option<i64> {
        *self.bound_term.lock()
    }

    /// A copy of the current replicate message.
    pub fn replicate_msg(&self) -> ReplicateMsg {
        self.replicate_msg.lock().clone()
    }

    /// Mutates the replicate message in place. Used by the append callback
    /// to stamp the hybrid time and counter.
    pub(crate) fn update_replicate_msg(&self, mutate: impl FnOnce(&mut ReplicateMsg)) {
        mutate(&mut self.replicate_msg.lock());
    }

    /// The log position consensus assigned; zero until known.
    pub fn id(&self) -> OpId {
        *self.id.lock()
    }

    /// Records the log position assigned by consensus.
    pub fn set_id(&self, id: OpId) {
        *self.id.lock() = id;
    }

    /// Registers the driver notified by this round's callbacks.
    pub(crate) fn register_driver(&self, driver: Weak<OperationDriver>) {
        *self.driver.lock() = Some(driver);
    }

    fn driver(&self) -> Option<Arc<OperationDriver>> {
        self.driver.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Append callback. The log subsystem invokes this immediately before
    /// the entry is written locally; the driver stamps the hybrid time into
    /// the message.
    pub fn notify_append(&self) {
        if let Some(driver) = self.driver() {
            driver.handle_consensus_append();
        }
    }

    /// Commit callback. Consensus invokes this once the entry's fate is
    /// final: accepted by a quorum, or failed.
    pub fn notify_replication_finished(&self, status: Result<()>, leader_term: i64) {
        if let Some(driver) = self.driver() {
            driver.replication_finished(status, leader_term);
        }
    }

    /// Hard-failure callback for entries the leader could not even append.
    pub fn notify_replication_failed(&self, status: TabletError) {
        if let Some(driver) = self.driver() {
            driver.replication_failed(status);
        }
    }
}

impl std::fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusRound")
            .field("bound_term", &*self.bound_term.lock())
            .field("id", &*self.id.lock())
            .finish_non_exhaustive()
    }
}

/// The consensus subsystem, as the operation pipeline sees it.
pub trait Consensus: Send + Sync {
    /// Creates a round for a message originated on this peer.
    fn new_round(&self, replicate_msg: ReplicateMsg) -> Arc<ConsensusRound>;

    /// Submits a batch of prepared rounds for replication. Outcomes are
    /// delivered through each round's callbacks.
    fn replicate_batch(&self, rounds: &[Arc<ConsensusRound>]) -> Result<()>;

    /// The tablet this consensus instance replicates.
    fn tablet_id(&self) -> &TabletId;

    /// This peer's identity in the consensus group.
    fn peer_uuid(&self) -> &str;
}

/// The durable log, as consensus implementations see it.
///
/// Implementations must invoke [`ConsensusRound::notify_append`]
/// immediately before the entry bytes are written, so the hybrid time lands
/// in the message that reaches disk.
pub trait WalLog: Send + Sync {
    /// Durably appends the round's entry to the local log.
    fn append(&self, round: &Arc<ConsensusRound>) -> Result<()>;
}
