//! Store traits consumed by the engine
//!
//! Each collaborator of the engine is its own trait so that the CRUD layer's
//! database can implement exactly what it owns. Both bundled backends
//! ([`MemoryStore`](super::memory::MemoryStore) and `SqliteStore`) implement
//! all of them.
//!
//! ## Thread Safety
//!
//! Implementations must be `Send + Sync` as they are shared across the
//! scheduler, every region worker and the quota gate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::model::{
    AlertRecipient, Incident, IncidentId, Monitor, MonitorId, MonitorLogEntry, MonitorStatus,
    Plan, ProbeOutcome, UptimeStats,
};

/// Monitor configuration owned by the CRUD layer
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// All monitors that are neither paused nor soft-deleted
    async fn list_active_monitors(&self) -> StorageResult<Vec<Monitor>>;

    async fn get_monitor(&self, id: MonitorId) -> StorageResult<Option<Monitor>>;

    /// Update the probe-driven fields of a monitor
    ///
    /// Paused and deleted monitors are left untouched so that a late
    /// outcome never overwrites a user's pause.
    async fn update_status(
        &self,
        id: MonitorId,
        status: MonitorStatus,
        last_checked_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Number of non-deleted monitors owned by a user (paused ones count)
    async fn count_active_by_user(&self, user_id: &str) -> StorageResult<u64>;

    async fn insert_monitor(&self, monitor: Monitor) -> StorageResult<()>;

    /// Pause or resume a monitor. Pausing sets the status to `PAUSED`,
    /// resuming puts it back to `UP`.
    async fn set_paused(&self, id: MonitorId, paused: bool) -> StorageResult<()>;

    async fn soft_delete(&self, id: MonitorId) -> StorageResult<()>;

    /// Subscription plan of a user; users without a record are on `BASIC`
    async fn user_plan(&self, user_id: &str) -> StorageResult<Plan>;

    async fn set_user_plan(&self, user_id: &str, plan: Plan) -> StorageResult<()>;
}

/// Append-only probe history and monitor event log
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn append_result(&self, outcome: &ProbeOutcome) -> StorageResult<()>;

    /// The N most recent results of a monitor, oldest first
    async fn latest_results(&self, monitor_id: MonitorId, limit: usize)
    -> StorageResult<Vec<ProbeOutcome>>;

    /// Uptime over all results checked at or after `since`
    async fn uptime(&self, monitor_id: MonitorId, since: DateTime<Utc>) -> StorageResult<UptimeStats>;

    async fn append_log(&self, entry: MonitorLogEntry) -> StorageResult<()>;

    /// Log entries of a monitor, oldest first
    async fn list_logs(&self, monitor_id: MonitorId) -> StorageResult<Vec<MonitorLogEntry>>;
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// The unresolved (open or acknowledged) incident of a monitor, if any
    async fn find_open_incident(&self, monitor_id: MonitorId) -> StorageResult<Option<Incident>>;

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>>;

    async fn create_incident(&self, incident: Incident) -> StorageResult<()>;

    async fn update_incident(&self, incident: &Incident) -> StorageResult<()>;

    /// All incidents of a monitor, oldest first
    async fn list_incidents(&self, monitor_id: MonitorId) -> StorageResult<Vec<Incident>>;
}

#[async_trait]
pub trait RecipientStore: Send + Sync {
    async fn list_recipients(&self, monitor_id: MonitorId) -> StorageResult<Vec<AlertRecipient>>;

    /// Recipients across all non-deleted monitors of a user
    async fn count_recipients_by_user(&self, user_id: &str) -> StorageResult<u64>;

    async fn insert_recipient(&self, recipient: AlertRecipient) -> StorageResult<()>;
}

/// The full set of stores the engine talks to
#[derive(Clone)]
pub struct Stores {
    pub monitors: Arc<dyn MonitorStore>,
    pub results: Arc<dyn ResultStore>,
    pub incidents: Arc<dyn IncidentStore>,
    pub recipients: Arc<dyn RecipientStore>,
}

impl Stores {
    /// Use a single backend for every store
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: MonitorStore + ResultStore + IncidentStore + RecipientStore + 'static,
    {
        Self {
            monitors: backend.clone(),
            results: backend.clone(),
            incidents: backend.clone(),
            recipients: backend,
        }
    }
}
