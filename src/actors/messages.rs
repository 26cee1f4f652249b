//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Replies**: oneshot channels carried inside the command
//! 3. **Snapshots**: statistics are returned by value, never shared

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::model::{Monitor, MonitorId};
use crate::storage::StorageError;

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Dispatch everything that is due right now (bypassing the tick timer)
    ///
    /// Used for testing and manual refresh operations.
    TickNow {
        /// Number of jobs accepted by the region pools
        respond_to: oneshot::Sender<usize>,
    },

    /// Re-read the monitor set from the store immediately
    ReconcileNow {
        respond_to: oneshot::Sender<Result<ReconcileReport, StorageError>>,
    },

    /// Check one monitor in all of its regions now, regardless of its due time
    CheckNow {
        monitor_id: MonitorId,
        respond_to: oneshot::Sender<usize>,
    },

    /// Apply a create or edit made by the CRUD layer without waiting for
    /// the next reconciliation
    ///
    /// A paused or deleted monitor is dropped from the schedule.
    Upsert { monitor: Box<Monitor> },

    /// Drop a monitor from the schedule (pause or delete)
    Remove { monitor_id: MonitorId },

    GetNextDue {
        monitor_id: MonitorId,
        respond_to: oneshot::Sender<Option<DateTime<Utc>>>,
    },

    GetStats {
        respond_to: oneshot::Sender<SchedulerStats>,
    },

    /// Gracefully shut down the scheduler
    ///
    /// In-flight probes are not cancelled.
    Shutdown,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Monitors that entered the schedule
    pub added: usize,

    /// Monitors whose check settings changed
    pub updated: usize,

    /// Monitors that were dropped (paused, deleted or gone)
    pub removed: usize,

    /// Schedule size after the pass
    pub total: usize,
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Monitors currently in the schedule
    pub scheduled_monitors: usize,

    /// Jobs accepted by region pools
    pub dispatched: u64,

    /// Monitor-region pairs skipped because the previous check was still running
    pub overruns: u64,

    /// Normal-priority pairs skipped because their region was congested
    pub congestion_skips: u64,

    /// Jobs rejected by a full queue
    pub rejected: u64,

    pub reconciliations: u64,

    pub reconcile_failures: u64,
}

/// Snapshot of one region worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub region: String,

    /// Jobs waiting in the queue
    pub queue_len: usize,

    /// Monitors queued or being probed
    pub in_flight: usize,

    pub processed: u64,

    /// Jobs whose probe panicked
    pub panics: u64,

    /// Jobs abandoned after the hard deadline
    pub timeouts: u64,

    /// Whether the queue is at or above its high-water mark
    pub congested: bool,
}
