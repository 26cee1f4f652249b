//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Testing without database dependencies
//! - Running the engine with `"backend": "none"`
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Bounded history**: results are kept in a ring buffer per monitor
//!
//! The store can simulate an outage (`set_unavailable`, `fail_next`) so
//! retry and skip behavior can be tested without a real database.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::trace;

use super::backend::{IncidentStore, MonitorStore, RecipientStore, ResultStore};
use super::error::{StorageError, StorageResult};
use crate::model::{
    AlertRecipient, Incident, IncidentId, Monitor, MonitorId, MonitorLogEntry, MonitorStatus,
    Plan, ProbeOutcome, UptimeStats,
};

/// Maximum results to keep in memory per monitor
const MAX_RESULTS_PER_MONITOR: usize = 10_000;

#[derive(Default)]
struct Inner {
    monitors: HashMap<MonitorId, Monitor>,
    plans: HashMap<String, Plan>,
    results: HashMap<MonitorId, VecDeque<ProbeOutcome>>,
    logs: HashMap<MonitorId, Vec<MonitorLogEntry>>,
    incidents: Vec<Incident>,
    recipients: Vec<AlertRecipient>,
}

/// In-memory implementation of every store trait
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    failures_remaining: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` operations fail
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".to_string()));
        }

        let consumed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StorageError::Unavailable("simulated failure".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn list_active_monitors(&self) -> StorageResult<Vec<Monitor>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .monitors
            .values()
            .filter(|m| m.is_schedulable())
            .cloned()
            .collect())
    }

    async fn get_monitor(&self, id: MonitorId) -> StorageResult<Option<Monitor>> {
        self.check_available()?;
        Ok(self.inner.read().await.monitors.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: MonitorId,
        status: MonitorStatus,
        last_checked_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        match inner.monitors.get_mut(&id) {
            Some(monitor) if monitor.is_schedulable() => {
                monitor.status = status;
                monitor.last_checked_at = Some(last_checked_at);
            }
            Some(_) => trace!("monitor {id} is paused or deleted, status left untouched"),
            None => return Err(StorageError::NotFound(format!("monitor {id}"))),
        }
        Ok(())
    }

    async fn count_active_by_user(&self, user_id: &str) -> StorageResult<u64> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .monitors
            .values()
            .filter(|m| m.user_id == user_id && !m.is_deleted)
            .count() as u64)
    }

    async fn insert_monitor(&self, monitor: Monitor) -> StorageResult<()> {
        self.check_available()?;
        self.inner.write().await.monitors.insert(monitor.id, monitor);
        Ok(())
    }

    async fn set_paused(&self, id: MonitorId, paused: bool) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let monitor = inner
            .monitors
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("monitor {id}")))?;
        monitor.is_paused = paused;
        monitor.status = if paused {
            MonitorStatus::Paused
        } else {
            MonitorStatus::Up
        };
        Ok(())
    }

    async fn soft_delete(&self, id: MonitorId) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let monitor = inner
            .monitors
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("monitor {id}")))?;
        monitor.is_deleted = true;
        Ok(())
    }

    async fn user_plan(&self, user_id: &str) -> StorageResult<Plan> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner.plans.get(user_id).copied().unwrap_or(Plan::Basic))
    }

    async fn set_user_plan(&self, user_id: &str, plan: Plan) -> StorageResult<()> {
        self.check_available()?;
        self.inner.write().await.plans.insert(user_id.to_string(), plan);
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn append_result(&self, outcome: &ProbeOutcome) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let history = inner.results.entry(outcome.monitor_id).or_default();
        if history.len() >= MAX_RESULTS_PER_MONITOR {
            history.pop_front();
        }
        history.push_back(outcome.clone());
        Ok(())
    }

    async fn latest_results(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<ProbeOutcome>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut results: Vec<ProbeOutcome> = inner
            .results
            .get(&monitor_id)
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        results.reverse();
        Ok(results)
    }

    async fn uptime(&self, monitor_id: MonitorId, since: DateTime<Utc>) -> StorageResult<UptimeStats> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let Some(history) = inner.results.get(&monitor_id) else {
            return Ok(UptimeStats::from_counts(0, 0, None));
        };

        let window: Vec<&ProbeOutcome> = history.iter().filter(|r| r.checked_at >= since).collect();
        let total = window.len() as u64;
        let up = window.iter().filter(|r| r.up).count() as u64;
        let avg = if window.is_empty() {
            None
        } else {
            Some(window.iter().map(|r| r.response_time_ms as f64).sum::<f64>() / total as f64)
        };

        Ok(UptimeStats::from_counts(total, up, avg))
    }

    async fn append_log(&self, entry: MonitorLogEntry) -> StorageResult<()> {
        self.check_available()?;
        self.inner
            .write()
            .await
            .logs
            .entry(entry.monitor_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn list_logs(&self, monitor_id: MonitorId) -> StorageResult<Vec<MonitorLogEntry>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner.logs.get(&monitor_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn find_open_incident(&self, monitor_id: MonitorId) -> StorageResult<Option<Incident>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .incidents
            .iter()
            .find(|i| i.monitor_id == monitor_id && i.status.is_unresolved())
            .cloned())
    }

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner.incidents.iter().find(|i| i.id == id).cloned())
    }

    async fn create_incident(&self, incident: Incident) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let unresolved = inner
            .incidents
            .iter()
            .any(|i| i.monitor_id == incident.monitor_id && i.status.is_unresolved());
        if incident.status.is_unresolved() && unresolved {
            return Err(StorageError::Conflict(format!(
                "monitor {} already has an unresolved incident",
                incident.monitor_id
            )));
        }
        inner.incidents.push(incident);
        Ok(())
    }

    async fn update_incident(&self, incident: &Incident) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let stored = inner
            .incidents
            .iter_mut()
            .find(|i| i.id == incident.id)
            .ok_or_else(|| StorageError::NotFound(format!("incident {}", incident.id)))?;
        *stored = incident.clone();
        Ok(())
    }

    async fn list_incidents(&self, monitor_id: MonitorId) -> StorageResult<Vec<Incident>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .incidents
            .iter()
            .filter(|i| i.monitor_id == monitor_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecipientStore for MemoryStore {
    async fn list_recipients(&self, monitor_id: MonitorId) -> StorageResult<Vec<AlertRecipient>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| r.monitor_id == monitor_id)
            .cloned()
            .collect())
    }

    async fn count_recipients_by_user(&self, user_id: &str) -> StorageResult<u64> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| {
                inner
                    .monitors
                    .get(&r.monitor_id)
                    .is_some_and(|m| m.user_id == user_id && !m.is_deleted)
            })
            .count() as u64)
    }

    async fn insert_recipient(&self, recipient: AlertRecipient) -> StorageResult<()> {
        self.check_available()?;
        self.inner.write().await.recipients.push(recipient);
        Ok(())
    }
}
