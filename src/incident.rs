//! Incident engine
//!
//! Consumes probe outcomes and drives the per-monitor state machine:
//!
//! ```text
//!            N consecutive failures in a majority of regions
//!      ┌────┐ ─────────────────────────────────────────────▶ ┌──────┐
//!      │ UP │                                                 │ DOWN │ ── renotify every 15 min
//!      └────┘ ◀───────────────────────────────────────────── └──────┘    while OPEN
//!            M consecutive successes (majority no longer down)
//! ```
//!
//! Each region keeps its own counters and only changes its verdict once a
//! threshold is reached; between thresholds it keeps the previous verdict.
//! The monitor is DOWN while more than half of its configured regions are
//! confirmed down.
//!
//! All updates for one monitor run under that monitor's async mutex, held in
//! a concurrent map, so different monitors are processed in parallel while
//! one monitor's outcomes are applied one at a time. This is the only place
//! that writes incidents and `Monitor::status`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::actors::region_pool::OutcomeSink;
use crate::config::IncidentConfig;
use crate::model::{
    Incident, IncidentId, IncidentStatus, LogLevel, Monitor, MonitorId, MonitorLogEntry,
    MonitorStatus, ProbeOutcome, ALL_REGIONS,
};
use crate::notifier::{NotificationDispatcher, NotificationKind};
use crate::retry::{RetryPolicy, retry};
use crate::storage::{StorageError, Stores};

/// Thresholds of the state machine
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentPolicy {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub renotify_interval: Duration,
}

impl Default for IncidentPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            recovery_threshold: 1,
            renotify_interval: Duration::minutes(15),
        }
    }
}

impl From<&IncidentConfig> for IncidentPolicy {
    fn from(config: &IncidentConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
            renotify_interval: Duration::minutes(i64::from(config.renotify_minutes)),
        }
    }
}

/// Confirmed state of one region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegionVerdict {
    /// Not enough outcomes yet; counts as not down
    #[default]
    Unknown,
    Up,
    Down,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionHealth {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub verdict: RegionVerdict,
    pub last_error: Option<String>,
}

impl RegionHealth {
    fn record(&mut self, outcome: &ProbeOutcome, policy: &IncidentPolicy) {
        if outcome.up {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_error = None;
            if self.consecutive_successes >= policy.recovery_threshold {
                self.verdict = RegionVerdict::Up;
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_error = Some(describe_failure(outcome));
            if self.consecutive_failures >= policy.failure_threshold {
                self.verdict = RegionVerdict::Down;
            }
        }
    }
}

fn describe_failure(outcome: &ProbeOutcome) -> String {
    match (&outcome.error_message, outcome.status_code) {
        (Some(message), _) => message.clone(),
        (None, Some(code)) => format!("status {code}"),
        (None, None) => "unknown error".to_string(),
    }
}

/// In-memory health of one monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorHealth {
    /// Last status written to the store
    pub status: MonitorStatus,
    pub regions: HashMap<String, RegionHealth>,
}

impl MonitorHealth {
    /// Seed from the stored status and the unresolved incident, so neither a
    /// restart nor a pause reopens or forgets an incident
    fn from_monitor(monitor: &Monitor, has_unresolved_incident: bool, policy: &IncidentPolicy) -> Self {
        let status = if monitor.status == MonitorStatus::Down || has_unresolved_incident {
            MonitorStatus::Down
        } else {
            MonitorStatus::Up
        };

        let regions = if status == MonitorStatus::Down {
            monitor
                .regions
                .iter()
                .map(|region| {
                    let health = RegionHealth {
                        consecutive_failures: policy.failure_threshold,
                        verdict: RegionVerdict::Down,
                        ..RegionHealth::default()
                    };
                    (region.clone(), health)
                })
                .collect()
        } else {
            HashMap::new()
        };

        Self { status, regions }
    }

    /// DOWN when more than half of the configured regions are confirmed down
    fn aggregate(&self, configured: &[String]) -> MonitorStatus {
        let down = configured
            .iter()
            .filter(|region| {
                self.regions
                    .get(region.as_str())
                    .is_some_and(|health| health.verdict == RegionVerdict::Down)
            })
            .count();

        if !configured.is_empty() && down * 2 > configured.len() {
            MonitorStatus::Down
        } else {
            MonitorStatus::Up
        }
    }

    fn summary(&self, configured: &[String]) -> String {
        let reasons: Vec<String> = configured
            .iter()
            .filter_map(|region| {
                let health = self.regions.get(region.as_str())?;
                (health.verdict == RegionVerdict::Down).then(|| {
                    format!(
                        "{region}: {}",
                        health.last_error.as_deref().unwrap_or("unknown error")
                    )
                })
            })
            .collect();

        format!("down in {}", reasons.join(", "))
    }
}

/// What applying an outcome did
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The monitor is gone, paused or deleted
    Discarded,

    /// No status change
    Unchanged,

    /// UP → DOWN; the incident is the newly opened one (or the unresolved
    /// one that already existed)
    WentDown { incident: Incident },

    /// Still DOWN
    StillDown { renotified: bool },

    /// DOWN → UP; carries the resolved incident if there was one
    Recovered { incident: Option<Incident> },
}

type HealthSlot = Arc<Mutex<Option<MonitorHealth>>>;

pub struct IncidentEngine {
    stores: Stores,
    dispatcher: Arc<NotificationDispatcher>,

    /// Notification rounds still being delivered
    pending_notifications: StdMutex<JoinSet<()>>,

    policy: IncidentPolicy,
    retry: RetryPolicy,

    /// Per-monitor lock and state; `None` until the first outcome
    health: DashMap<MonitorId, HealthSlot>,
}

impl IncidentEngine {
    pub fn new(
        stores: Stores,
        dispatcher: NotificationDispatcher,
        policy: IncidentPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            stores,
            dispatcher: Arc::new(dispatcher),
            pending_notifications: StdMutex::new(JoinSet::new()),
            policy,
            retry,
            health: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &IncidentPolicy {
        &self.policy
    }

    fn slot(&self, monitor_id: MonitorId) -> HealthSlot {
        self.health.entry(monitor_id).or_default().clone()
    }

    /// Current in-memory health of a monitor, if it has seen outcomes
    pub async fn health(&self, monitor_id: MonitorId) -> Option<MonitorHealth> {
        let slot = self.health.get(&monitor_id).map(|slot| slot.clone())?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Drop the state of a monitor unless another outcome is being applied
    pub fn forget(&self, monitor_id: MonitorId) {
        self.health
            .remove_if(&monitor_id, |_, slot| Arc::strong_count(slot) == 1);
    }

    /// Apply one outcome under the monitor's lock
    #[instrument(skip(self, outcome), fields(monitor_id = %outcome.monitor_id, region = %outcome.region, up = outcome.up))]
    pub async fn process(&self, outcome: ProbeOutcome) -> Result<Transition, StorageError> {
        let monitor_id = outcome.monitor_id;
        let slot = self.slot(monitor_id);
        let mut guard = slot.lock().await;

        let monitor = retry("get_monitor", &self.retry, || {
            self.stores.monitors.get_monitor(monitor_id)
        })
        .await?;

        let monitor = match monitor {
            Some(monitor) if monitor.is_schedulable() => monitor,
            _ => {
                debug!("monitor paused, deleted or missing, discarding outcome");
                *guard = None;
                drop(guard);
                drop(slot);
                self.forget(monitor_id);
                return Ok(Transition::Discarded);
            }
        };

        if let Err(e) = retry("append_result", &self.retry, || {
            self.stores.results.append_result(&outcome)
        })
        .await
        {
            warn!("failed to persist probe result: {e}");
        }

        if !monitor.regions.contains(&outcome.region) {
            debug!("outcome from unconfigured region ignored for status");
            return Ok(Transition::Unchanged);
        }

        let health = match guard.take() {
            Some(health) => health,
            None => {
                let unresolved = self.find_open_incident(monitor_id).await?.is_some();
                MonitorHealth::from_monitor(&monitor, unresolved, &self.policy)
            }
        };
        let health = guard.insert(health);
        health
            .regions
            .entry(outcome.region.clone())
            .or_default()
            .record(&outcome, &self.policy);

        let now = outcome.checked_at;
        let aggregate = health.aggregate(&monitor.regions);
        trace!("status {} -> {aggregate}", health.status);

        let transition = match (health.status, aggregate) {
            (MonitorStatus::Up, MonitorStatus::Down) => {
                let summary = health.summary(&monitor.regions);
                self.open_incident(&monitor, summary, now).await?
            }
            (MonitorStatus::Down, MonitorStatus::Down) => {
                let summary = health.summary(&monitor.regions);
                self.continue_incident(&monitor, summary, now).await?
            }
            (MonitorStatus::Down, MonitorStatus::Up) => self.resolve_incident(&monitor, now).await?,
            _ => {
                self.update_status(&monitor, MonitorStatus::Up, now).await?;
                Transition::Unchanged
            }
        };

        // only advance once every store write of the transition succeeded
        health.status = aggregate;

        Ok(transition)
    }

    async fn update_status(
        &self,
        monitor: &Monitor,
        status: MonitorStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        retry("update_status", &self.retry, || {
            self.stores.monitors.update_status(monitor.id, status, now)
        })
        .await
    }

    async fn find_open_incident(&self, monitor_id: MonitorId) -> Result<Option<Incident>, StorageError> {
        retry("find_open_incident", &self.retry, || {
            self.stores.incidents.find_open_incident(monitor_id)
        })
        .await
    }

    async fn create_incident(
        &self,
        monitor: &Monitor,
        summary: String,
        now: DateTime<Utc>,
    ) -> Result<Incident, StorageError> {
        let mut incident = Incident::open(monitor.id, now, summary);
        incident.last_notified_at = Some(now);

        retry("create_incident", &self.retry, || {
            self.stores.incidents.create_incident(incident.clone())
        })
        .await?;

        info!("incident {} opened: {}", incident.id, incident.summary);
        self.log_event(
            monitor.id,
            LogLevel::Error,
            "incident opened",
            json!({ "incident_id": incident.id, "summary": incident.summary }),
        )
        .await;
        self.dispatch(NotificationKind::Opened, &incident, monitor, now);

        Ok(incident)
    }

    async fn open_incident(
        &self,
        monitor: &Monitor,
        summary: String,
        now: DateTime<Utc>,
    ) -> Result<Transition, StorageError> {
        warn!("monitor {} is down", monitor.url);
        self.update_status(monitor, MonitorStatus::Down, now).await?;

        let incident = match self.find_open_incident(monitor.id).await? {
            Some(existing) => {
                debug!("unresolved incident {} already exists", existing.id);
                existing
            }
            None => self.create_incident(monitor, summary, now).await?,
        };

        Ok(Transition::WentDown { incident })
    }

    async fn continue_incident(
        &self,
        monitor: &Monitor,
        summary: String,
        now: DateTime<Utc>,
    ) -> Result<Transition, StorageError> {
        self.update_status(monitor, MonitorStatus::Down, now).await?;

        let Some(mut incident) = self.find_open_incident(monitor.id).await? else {
            // DOWN without an incident, e.g. the status was seeded from the store
            self.create_incident(monitor, summary, now).await?;
            return Ok(Transition::StillDown { renotified: false });
        };

        if incident.status != IncidentStatus::Open {
            return Ok(Transition::StillDown { renotified: false });
        }

        let due = incident
            .last_notified_at
            .is_none_or(|last| now - last > self.policy.renotify_interval);
        if !due {
            return Ok(Transition::StillDown { renotified: false });
        }

        incident.last_notified_at = Some(now);
        retry("update_incident", &self.retry, || {
            self.stores.incidents.update_incident(&incident)
        })
        .await?;

        debug!("renotifying for incident {}", incident.id);
        self.log_event(
            monitor.id,
            LogLevel::Warn,
            "incident still open, recipients renotified",
            json!({ "incident_id": incident.id }),
        )
        .await;
        self.dispatch(NotificationKind::Renotify, &incident, monitor, now);

        Ok(Transition::StillDown { renotified: true })
    }

    async fn resolve_incident(
        &self,
        monitor: &Monitor,
        now: DateTime<Utc>,
    ) -> Result<Transition, StorageError> {
        let resolved = match self.find_open_incident(monitor.id).await? {
            Some(mut incident) => {
                incident.status = IncidentStatus::Resolved;
                incident.resolved_at = Some(now);
                retry("update_incident", &self.retry, || {
                    self.stores.incidents.update_incident(&incident)
                })
                .await?;
                Some(incident)
            }
            None => None,
        };

        self.update_status(monitor, MonitorStatus::Up, now).await?;
        info!("monitor {} recovered", monitor.url);

        if let Some(incident) = &resolved {
            self.log_event(
                monitor.id,
                LogLevel::Info,
                "incident resolved",
                json!({ "incident_id": incident.id }),
            )
            .await;
            self.dispatch(NotificationKind::Resolved, incident, monitor, now);
        }

        Ok(Transition::Recovered { incident: resolved })
    }

    /// Move an open incident to ACKNOWLEDGED, which silences renotification
    ///
    /// Returns the updated incident, or `None` when the incident does not
    /// exist or is not open.
    pub async fn acknowledge(&self, incident_id: IncidentId) -> Result<Option<Incident>, StorageError> {
        let Some(incident) = self.stores.incidents.get_incident(incident_id).await? else {
            return Ok(None);
        };

        let slot = self.slot(incident.monitor_id);
        let _guard = slot.lock().await;

        // re-read under the lock, the incident may have been resolved meanwhile
        let Some(mut incident) = self.stores.incidents.get_incident(incident_id).await? else {
            return Ok(None);
        };
        if incident.status != IncidentStatus::Open {
            return Ok(None);
        }

        incident.status = IncidentStatus::Acknowledged;
        self.stores.incidents.update_incident(&incident).await?;
        info!("incident {incident_id} acknowledged");

        self.log_event(
            incident.monitor_id,
            LogLevel::Info,
            "incident acknowledged",
            json!({ "incident_id": incident.id }),
        )
        .await;

        Ok(Some(incident))
    }

    /// Deliver a notification round in the background
    ///
    /// Called once the state writes of a transition are committed; delivery
    /// never holds the monitor's lock or the region worker.
    fn dispatch(&self, kind: NotificationKind, incident: &Incident, monitor: &Monitor, now: DateTime<Utc>) {
        let dispatcher = self.dispatcher.clone();
        let incident = incident.clone();
        let monitor = monitor.clone();

        let mut pending = self
            .pending_notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            dispatcher.notify(kind, &incident, &monitor, now).await;
        });
    }

    /// Wait until every notification dispatched so far has been delivered
    /// (or has failed)
    pub async fn flush_notifications(&self) {
        let mut pending = std::mem::take(
            &mut *self
                .pending_notifications
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                error!("notification task failed: {e}");
            }
        }
    }

    async fn log_event(
        &self,
        monitor_id: MonitorId,
        level: LogLevel,
        message: &str,
        meta: serde_json::Value,
    ) {
        let entry = MonitorLogEntry::new(monitor_id, ALL_REGIONS, level, message).with_meta(meta);
        if let Err(e) = self.stores.results.append_log(entry).await {
            warn!("failed to write monitor log: {e}");
        }
    }
}

#[async_trait]
impl OutcomeSink for IncidentEngine {
    async fn handle_outcome(&self, outcome: ProbeOutcome) {
        let monitor_id = outcome.monitor_id;
        match self.process(outcome).await {
            Ok(transition) => trace!("monitor {monitor_id}: {transition:?}"),
            Err(e) => error!("failed to apply outcome for monitor {monitor_id}, skipped: {e}"),
        }
    }

    fn monitor_removed(&self, monitor_id: MonitorId) {
        self.forget(monitor_id);
    }
}
