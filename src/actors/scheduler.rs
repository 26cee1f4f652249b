//! SchedulerActor - decides which monitor is checked where and when
//!
//! The actor owns the schedule: one entry per active monitor holding its
//! current settings and the time its next check is due. Nothing else reads
//! or writes that map.
//!
//! ## Message Flow
//!
//! ```text
//! Tick (1s) ──▶ due monitors ──▶ one ProbeJob per region ──▶ RegionPool
//! Reconcile (30s) ──▶ MonitorStore::list_active_monitors ──▶ add / update / drop entries
//!     ↑
//!     └─── Commands (TickNow, ReconcileNow, CheckNow, Upsert, Remove, GetStats, Shutdown)
//! ```
//!
//! ## Priority
//!
//! Monitors that are currently DOWN are high priority. When a region's queue
//! is congested only high-priority monitors are dispatched there; the other
//! pairs are skipped for this cycle and counted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::{ReconcileReport, SchedulerCommand, SchedulerStats};
use super::region_pool::{EnqueueOutcome, ProbeJob, RegionPools};
use crate::config::SchedulerConfig;
use crate::model::{LogLevel, Monitor, MonitorId, MonitorLogEntry, MonitorStatus};
use crate::retry::{RetryPolicy, retry};
use crate::storage::{MonitorStore, ResultStore, StorageError};

#[derive(Debug, Clone)]
struct ScheduleEntry {
    monitor: Monitor,
    next_due_at: DateTime<Utc>,
}

/// Whether two versions of a monitor differ in anything that affects checks
fn check_settings_changed(old: &Monitor, new: &Monitor) -> bool {
    old.url != new.url
        || old.method != new.method
        || old.expected_status != new.expected_status
        || old.interval_minutes != new.interval_minutes
        || old.timeout_secs != new.timeout_secs
        || old.regions != new.regions
}

/// Actor owning the schedule of all active monitors
pub struct SchedulerActor {
    monitors: Arc<dyn MonitorStore>,

    /// Used for the per-monitor event log (overruns)
    results: Arc<dyn ResultStore>,

    pools: Arc<RegionPools>,

    schedule: HashMap<MonitorId, ScheduleEntry>,

    config: SchedulerConfig,

    retry: RetryPolicy,

    command_rx: mpsc::Receiver<SchedulerCommand>,

    stats: SchedulerStats,
}

impl SchedulerActor {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        results: Arc<dyn ResultStore>,
        pools: Arc<RegionPools>,
        config: SchedulerConfig,
        retry: RetryPolicy,
        command_rx: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        Self {
            monitors,
            results,
            pools,
            schedule: HashMap::new(),
            config,
            retry,
            command_rx,
            stats: SchedulerStats::default(),
        }
    }

    /// Run the actor's main loop
    ///
    /// The schedule is reconciled once before the first tick. The loop runs
    /// until a Shutdown command is received or the command channel is closed.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!("starting scheduler");

        if let Err(e) = self.reconcile(Utc::now()).await {
            error!("initial reconciliation failed: {e}");
        }

        let tick_every = self.config.tick();
        let mut ticker = interval_at(Instant::now() + tick_every, tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reconcile_every = self.config.reconcile();
        let mut reconciler = interval_at(Instant::now() + reconcile_every, reconcile_every);
        reconciler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch_due(Utc::now()).await;
                }

                _ = reconciler.tick() => {
                    if let Err(e) = self.reconcile(Utc::now()).await {
                        error!("reconciliation failed, keeping previous schedule: {e}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::TickNow { respond_to } => {
                            debug!("received TickNow command");
                            let dispatched = self.dispatch_due(Utc::now()).await;
                            let _ = respond_to.send(dispatched);
                        }

                        SchedulerCommand::ReconcileNow { respond_to } => {
                            debug!("received ReconcileNow command");
                            let report = self.reconcile(Utc::now()).await;
                            let _ = respond_to.send(report);
                        }

                        SchedulerCommand::CheckNow { monitor_id, respond_to } => {
                            debug!("received CheckNow command for {monitor_id}");
                            let dispatched = self.check_monitor(monitor_id, Utc::now()).await;
                            let _ = respond_to.send(dispatched);
                        }

                        SchedulerCommand::Upsert { monitor } => {
                            self.upsert(*monitor, Utc::now());
                        }

                        SchedulerCommand::Remove { monitor_id } => {
                            if self.unschedule(monitor_id) {
                                debug!("removed monitor {monitor_id} from schedule");
                            }
                        }

                        SchedulerCommand::GetNextDue { monitor_id, respond_to } => {
                            let next_due = self.schedule.get(&monitor_id).map(|entry| entry.next_due_at);
                            let _ = respond_to.send(next_due);
                        }

                        SchedulerCommand::GetStats { respond_to } => {
                            let _ = respond_to.send(self.snapshot_stats());
                        }

                        SchedulerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                // Command channel closed - exit
                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        info!("scheduler stopped");
    }

    fn snapshot_stats(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled_monitors: self.schedule.len(),
            ..self.stats.clone()
        }
    }

    /// Enqueue every monitor whose next check is due at `now`
    ///
    /// Returns the number of jobs accepted by the pools.
    async fn dispatch_due(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<MonitorId> = self
            .schedule
            .iter()
            .filter(|(_, entry)| entry.next_due_at <= now)
            .map(|(id, _)| *id)
            .collect();

        if due.is_empty() {
            return 0;
        }

        trace!("{} monitors due", due.len());

        let mut dispatched = 0;
        for monitor_id in due {
            dispatched += self.check_monitor(monitor_id, now).await;
        }
        dispatched
    }

    /// Enqueue one monitor in all of its regions and reschedule it
    ///
    /// The next due time is computed from `now`, not from when the probe
    /// finishes.
    async fn check_monitor(&mut self, monitor_id: MonitorId, now: DateTime<Utc>) -> usize {
        let Some(entry) = self.schedule.get_mut(&monitor_id) else {
            debug!("monitor {monitor_id} is not scheduled");
            return 0;
        };

        entry.next_due_at = now + entry.monitor.interval();
        let monitor = entry.monitor.clone();

        if !monitor.is_schedulable() {
            self.unschedule(monitor_id);
            return 0;
        }

        let high_priority = monitor.status == MonitorStatus::Down;
        let target = monitor.target();
        let mut dispatched = 0;

        for region in &monitor.regions {
            let pool = self.pools.get_or_spawn(region);

            if !high_priority && pool.is_congested() {
                self.stats.congestion_skips += 1;
                debug!("region {region} congested, skipping monitor {monitor_id}");
                continue;
            }

            match pool.enqueue(ProbeJob::new(monitor_id, region.clone(), target.clone())) {
                EnqueueOutcome::Accepted => {
                    dispatched += 1;
                    self.stats.dispatched += 1;
                }
                EnqueueOutcome::InFlight => {
                    self.stats.overruns += 1;
                    warn!("previous check of monitor {monitor_id} in {region} still running, skipping");
                    self.log_overrun(monitor_id, region).await;
                }
                EnqueueOutcome::Full => {
                    self.stats.rejected += 1;
                    warn!("queue of region {region} is full, skipping monitor {monitor_id}");
                }
                EnqueueOutcome::Closed => {
                    error!("pool of region {region} is closed");
                }
            }
        }

        dispatched
    }

    async fn log_overrun(&self, monitor_id: MonitorId, region: &str) {
        let entry = MonitorLogEntry::new(
            monitor_id,
            region,
            LogLevel::Warn,
            "check skipped: previous check still in progress",
        )
        .with_meta(json!({ "overruns": self.stats.overruns }));

        if let Err(e) = self.results.append_log(entry).await {
            warn!("failed to record overrun for monitor {monitor_id}: {e}");
        }
    }

    /// Re-read the active monitors and bring the schedule in line
    ///
    /// New monitors are due immediately. A shortened interval pulls the next
    /// check forward; a longer one takes effect after the next check.
    /// Monitors that are no longer active are dropped; their in-flight
    /// probes keep running.
    async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<ReconcileReport, StorageError> {
        let monitors = retry("list_active_monitors", &self.retry, || {
            self.monitors.list_active_monitors()
        })
        .await
        .inspect_err(|_| self.stats.reconcile_failures += 1)?;

        let mut report = ReconcileReport::default();
        let mut seen = HashSet::with_capacity(monitors.len());

        for monitor in monitors {
            if !monitor.is_schedulable() {
                continue;
            }
            seen.insert(monitor.id);

            match self.schedule.get_mut(&monitor.id) {
                None => {
                    self.schedule.insert(
                        monitor.id,
                        ScheduleEntry {
                            monitor,
                            next_due_at: now,
                        },
                    );
                    report.added += 1;
                }
                Some(entry) => {
                    if check_settings_changed(&entry.monitor, &monitor) {
                        entry.next_due_at = entry.next_due_at.min(now + monitor.interval());
                        report.updated += 1;
                    }
                    entry.monitor = monitor;
                }
            }
        }

        let gone: Vec<MonitorId> = self
            .schedule
            .keys()
            .filter(|id| !seen.contains(*id))
            .copied()
            .collect();
        for monitor_id in &gone {
            self.unschedule(*monitor_id);
        }
        report.removed = gone.len();
        report.total = self.schedule.len();

        self.stats.reconciliations += 1;
        debug!(
            "reconciled schedule: +{} ~{} -{} ({} total)",
            report.added, report.updated, report.removed, report.total
        );

        Ok(report)
    }

    /// Drop a monitor from the schedule and release what the pools keep for it
    fn unschedule(&mut self, monitor_id: MonitorId) -> bool {
        let removed = self.schedule.remove(&monitor_id).is_some();
        if removed {
            self.pools.release(monitor_id);
        }
        removed
    }

    /// Apply a single monitor change pushed by the CRUD layer
    fn upsert(&mut self, monitor: Monitor, now: DateTime<Utc>) {
        if !monitor.is_schedulable() {
            if self.unschedule(monitor.id) {
                debug!("monitor {} paused or deleted, dropped from schedule", monitor.id);
            }
            return;
        }

        match self.schedule.get_mut(&monitor.id) {
            Some(entry) => {
                if check_settings_changed(&entry.monitor, &monitor) {
                    entry.next_due_at = entry.next_due_at.min(now + monitor.interval());
                }
                entry.monitor = monitor;
            }
            None => {
                self.schedule.insert(
                    monitor.id,
                    ScheduleEntry {
                        monitor,
                        next_due_at: now,
                    },
                );
            }
        }
    }
}

/// Handle for controlling the SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the scheduler actor
    pub fn spawn(
        monitors: Arc<dyn MonitorStore>,
        results: Arc<dyn ResultStore>,
        pools: Arc<RegionPools>,
        config: SchedulerConfig,
        retry: RetryPolicy,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = SchedulerActor::new(monitors, results, pools, config, retry, cmd_rx);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Dispatch everything due now, returning the number of accepted jobs
    pub async fn tick_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TickNow { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::ReconcileNow { respond_to: tx })
            .await?;
        Ok(rx.await??)
    }

    /// Check a monitor in all of its regions immediately
    pub async fn check_now(&self, monitor_id: MonitorId) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::CheckNow {
                monitor_id,
                respond_to: tx,
            })
            .await?;
        Ok(rx.await?)
    }

    pub async fn upsert(&self, monitor: Monitor) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Upsert {
                monitor: Box::new(monitor),
            })
            .await?;
        Ok(())
    }

    pub async fn remove(&self, monitor_id: MonitorId) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Remove { monitor_id })
            .await?;
        Ok(())
    }

    pub async fn next_due(&self, monitor_id: MonitorId) -> Result<Option<DateTime<Utc>>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::GetNextDue {
                monitor_id,
                respond_to: tx,
            })
            .await?;
        Ok(rx.await?)
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::GetStats { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    /// Shut down the scheduler
    pub async fn shutdown(&self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
