//! The narrow tablet surface the operation pipeline depends on.
//!
//! The full tablet (storage, schema, sessions) lives elsewhere; operations
//! only need an identity, the hybrid clock, row locks, the schema version,
//! and the monotonic counter that external replication reads. `MvccManager`
//! tracks the tablet safe time that followers advance from leader
//! propagation.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use parking_lot::Mutex;
use ridgeline_types::{HybridClock, HybridTime, TabletId};
use tracing::warn;

use crate::error::{LockConflictSnafu, Result};

/// Per-tablet state shared with every operation.
#[derive(Debug)]
pub struct TabletHandle {
    tablet_id: TabletId,
    clock: Arc<HybridClock>,
    /// Counter stamped into replicate messages for external consumers that
    /// need a tablet-local total order independent of hybrid time.
    monotonic_counter: AtomicI64,
    schema_version: AtomicU32,
    /// Row keys locked by in-flight operations.
    row_locks: Mutex<HashSet<Vec<u8>>>,
}

impl TabletHandle {
    /// Creates a handle with a fresh clock.
    pub fn new(tablet_id: TabletId) -> Self {
        Self::with_clock(tablet_id, Arc::new(HybridClock::new()))
    }

    /// Creates a handle sharing an existing clock.
    pub fn with_clock(tablet_id: TabletId, clock: Arc<HybridClock>) -> Self {
        Self {
            tablet_id,
            clock,
            monotonic_counter: AtomicI64::new(0),
            schema_version: AtomicU32::new(0),
            row_locks: Mutex::new(HashSet::new()),
        }
    }

    /// The tablet's identity.
    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    /// The tablet's hybrid clock.
    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    /// Current value of the monotonic counter.
    pub fn monotonic_counter(&self) -> i64 {
        self.monotonic_counter.load(Ordering::Acquire)
    }

    /// Advances the monotonic counter by one, returning the new value.
    pub fn bump_monotonic_counter(&self) -> i64 {
        self.monotonic_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current schema version.
    pub fn schema_version(&self) -> u32 {
        self.schema_version.load(Ordering::Acquire)
    }

    /// Raises the schema version. Regressions are ignored: versions only
    /// move forward.
    pub fn raise_schema_version(&self, version: u32) {
        self.schema_version.fetch_max(version, Ordering::AcqRel);
    }

    /// Acquires row locks for all of `keys`, or none of them.
    ///
    /// Fails with a lock conflict if any key is already held, including a
    /// key repeated within `keys` itself.
    pub fn lock_rows(&self, keys: &[Vec<u8>]) -> Result<()> {
        let mut locks = self.row_locks.lock();
        let mut acquired: Vec<&Vec<u8>> = Vec::with_capacity(keys.len());
        for key in keys {
            if !locks.insert(key.clone()) {
                for prior in acquired {
                    locks.remove(prior);
                }
                return LockConflictSnafu { key: key.clone() }.fail();
            }
            acquired.push(key);
        }
        Ok(())
    }

    /// Releases row locks previously acquired with [`TabletHandle::lock_rows`].
    pub fn unlock_rows(&self, keys: &[Vec<u8>]) {
        let mut locks = self.row_locks.lock();
        for key in keys {
            locks.remove(key);
        }
    }

    /// Number of row keys currently locked.
    pub fn locked_row_count(&self) -> usize {
        self.row_locks.lock().len()
    }
}

/// Tracks the tablet safe time: the upper bound below which reads see a
/// consistent snapshot.
#[derive(Debug, Default)]
pub struct MvccManager {
    safe_time: Mutex<HybridTime>,
}

impl MvccManager {
    /// Creates a manager with the safe time at its minimum.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current safe time.
    pub fn safe_time(&self) -> HybridTime {
        *self.safe_time.lock()
    }

    /// Advances the safe time from a value the leader propagated.
    ///
    /// Regressions are dropped: propagation can race ordinary advancement,
    /// and the safe time never moves backwards.
    pub fn set_propagated_safe_time_on_follower(&self, propagated: HybridTime) {
        let mut safe_time = self.safe_time.lock();
        if propagated < *safe_time {
            warn!(%propagated, current = %*safe_time, "ignoring propagated safe time regression");
            return;
        }
        *safe_time = propagated;
    }
}
