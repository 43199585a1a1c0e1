//! The prepare queue: batches local preparation and consensus submission.
//!
//! Drivers submit themselves; a background loop drains the queue on an
//! interval tick, runs each driver's prepare step on this worker, and
//! replicates every round that became ready as one batch. Batching the
//! `replicate` calls is the point of the queue: it coalesces consensus
//! round-trips the same way write batching coalesces proposals.
//!
//! ## Shutdown
//!
//! After [`Preparer::stop`], submission fails with `ShuttingDown` and
//! anything still queued is failed the same way; callers funnel that into
//! the driver's failure path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::consensus::Consensus;
use crate::driver::OperationDriver;
use crate::error::{Result, ShuttingDownSnafu};
use crate::metrics;

/// Configuration for the prepare queue.
#[derive(Debug, Clone, bon::Builder)]
pub struct PreparerConfig {
    /// Maximum number of drivers drained per batch.
    #[builder(default = 128)]
    pub max_batch_size: usize,
    /// Interval at which the queue is drained.
    #[builder(default = Duration::from_micros(500))]
    pub tick_interval: Duration,
}

impl Default for PreparerConfig {
    fn default() -> Self {
        Self { max_batch_size: 128, tick_interval: Duration::from_micros(500) }
    }
}

struct PreparerQueue {
    queue: VecDeque<Arc<OperationDriver>>,
    stopped: bool,
}

/// Batching queue that runs driver preparation and submits prepared rounds
/// to consensus.
pub struct Preparer {
    config: PreparerConfig,
    consensus: Arc<dyn Consensus>,
    queue: Mutex<PreparerQueue>,
}

impl Preparer {
    /// Creates a preparer feeding the given consensus instance.
    pub fn new(config: PreparerConfig, consensus: Arc<dyn Consensus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            consensus,
            queue: Mutex::new(PreparerQueue { queue: VecDeque::new(), stopped: false }),
        })
    }

    /// Queues a driver for preparation.
    pub fn submit(&self, driver: Arc<OperationDriver>) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.stopped {
            return ShuttingDownSnafu { component: "preparer" }.fail();
        }
        queue.queue.push_back(driver);
        Ok(())
    }

    /// Number of drivers waiting to be prepared.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().queue.len()
    }

    /// Stops the queue: further submissions fail, and everything still
    /// queued is failed with `ShuttingDown`.
    pub fn stop(&self) {
        let drained: Vec<_> = {
            let mut queue = self.queue.lock();
            queue.stopped = true;
            queue.queue.drain(..).collect()
        };
        if !drained.is_empty() {
            info!(drained = drained.len(), "failing operations queued at preparer shutdown");
        }
        for driver in drained {
            driver.handle_failure(Some(
                ShuttingDownSnafu { component: "preparer" }.build(),
            ));
        }
    }

    /// Runs the drain loop until the queue is stopped and empty.
    ///
    /// This should be spawned as a background task.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.tick_interval);
        info!(
            max_batch_size = self.config.max_batch_size,
            tick_interval_us = self.config.tick_interval.as_micros() as u64,
            "starting preparer"
        );
        loop {
            ticker.tick().await;
            if !self.drain_queue() {
                break;
            }
        }
        debug!("preparer loop exited");
    }

    /// Drains the queue to empty. Returns false once the queue is stopped
    /// and has nothing left.
    fn drain_queue(&self) -> bool {
        loop {
            let batch: Vec<_> = {
                let mut queue = self.queue.lock();
                if queue.queue.is_empty() {
                    return !queue.stopped;
                }
                let take = queue.queue.len().min(self.config.max_batch_size);
                queue.queue.drain(..take).collect()
            };

            // Rounds handed back here went NOT_REPLICATING -> REPLICATING
            // under this call; the contract is that we, not the driver,
            // invoke replication, so one drain becomes one batch.
            let mut rounds = Vec::new();
            for driver in &batch {
                if let Some(round) = driver.prepare_and_start_task() {
                    rounds.push(round);
                }
            }

            if rounds.is_empty() {
                continue;
            }
            metrics::record_prepare_batch(rounds.len());
            if let Err(status) = self.consensus.replicate_batch(&rounds) {
                warn!(%status, batch_size = rounds.len(), "replicate batch failed");
                for round in &rounds {
                    round.notify_replication_failed(status.clone());
                }
            }
        }
    }
}
