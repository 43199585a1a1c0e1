//! Registry of in-flight operation drivers.
//!
//! The tracker is the admission gate for new operations and the anchor that
//! keeps a driver alive while either of its lifecycles is still running.
//! Every successfully added driver must be released exactly once, when the
//! operation has been applied or aborted; graceful shutdown waits on that
//! drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::driver::OperationDriver;
use crate::error::{OperationQuotaExceededSnafu, Result, ShuttingDownSnafu, TimedOutSnafu};
use crate::metrics;

/// Admission limits for the tracker.
#[derive(Debug, Clone, bon::Builder)]
pub struct TrackerConfig {
    /// Maximum number of operations in flight before admission is refused.
    #[builder(default = 1024)]
    pub max_inflight: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { max_inflight: 1024 }
    }
}

struct TrackerInner {
    inflight: HashMap<u64, Arc<OperationDriver>>,
    shutting_down: bool,
}

/// Registry of drivers whose operations are still in flight.
pub struct OperationTracker {
    config: TrackerConfig,
    inner: Mutex<TrackerInner>,
    /// Broadcasts the in-flight count; shutdown waits for it to hit zero.
    count_tx: watch::Sender<usize>,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl OperationTracker {
    /// Creates a tracker with the given admission limits.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(TrackerInner { inflight: HashMap::new(), shutting_down: false }),
            count_tx: watch::Sender::new(0),
        }
    }

    /// Registers a driver. Fails if the tracker is shutting down or the
    /// in-flight quota is reached; on failure nothing is registered.
    pub fn add(&self, driver: &Arc<OperationDriver>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            metrics::record_admission_rejected("shutting_down");
            return ShuttingDownSnafu { component: "operation tracker" }.fail();
        }
        if inner.inflight.len() >= self.config.max_inflight {
            metrics::record_admission_rejected("quota");
            return OperationQuotaExceededSnafu {
                inflight: inner.inflight.len(),
                limit: self.config.max_inflight,
            }
            .fail();
        }
        inner.inflight.insert(driver.id(), Arc::clone(driver));
        let count = inner.inflight.len();
        self.count_tx.send_replace(count);
        metrics::set_inflight_operations(count);
        debug!(driver_id = driver.id(), op_type = %driver.operation_type(), count, "operation tracked");
        Ok(())
    }

    /// Removes a driver. Valid exactly once per successful [`Self::add`].
    pub fn release(&self, driver: &OperationDriver) {
        let mut inner = self.inner.lock();
        if inner.inflight.remove(&driver.id()).is_none() {
            error!(driver_id = driver.id(), "released an operation that was not tracked");
            debug_assert!(false, "operation released twice");
            return;
        }
        let count = inner.inflight.len();
        self.count_tx.send_replace(count);
        metrics::set_inflight_operations(count);
        debug!(driver_id = driver.id(), count, "operation released");
    }

    /// Number of operations currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().inflight.is_empty()
    }

    /// Snapshot of the drivers currently in flight, in admission order.
    pub fn pending_operations(&self) -> Vec<Arc<OperationDriver>> {
        let inner = self.inner.lock();
        let mut pending: Vec<_> = inner.inflight.values().cloned().collect();
        pending.sort_by_key(|driver| driver.id());
        pending
    }

    /// Refuses all further admissions. Already-tracked operations keep
    /// running; wait for them with [`Self::wait_for_all_to_finish`].
    pub fn start_shutdown(&self) {
        let mut inner = self.inner.lock();
        if !inner.shutting_down {
            inner.shutting_down = true;
            info!(inflight = inner.inflight.len(), "operation tracker shutting down");
        }
    }

    /// Waits until every tracked operation has been released, or the
    /// timeout elapses.
    pub async fn wait_for_all_to_finish(&self, timeout: Duration) -> Result<()> {
        let mut count_rx = self.count_tx.subscribe();
        let drained = async {
            loop {
                if *count_rx.borrow_and_update() == 0 {
                    return;
                }
                if count_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, drained).await.map_err(|_| {
            TimedOutSnafu {
                message: format!("{} operations still in flight", self.len()),
            }
            .build()
        })
    }
}
