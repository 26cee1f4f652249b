//! Region worker pools
//!
//! Every region gets one bounded FIFO queue drained by a fixed set of worker
//! tasks. Workers run the prober, forward the outcome to an [`OutcomeSink`]
//! (the incident engine) and loop.
//!
//! ## Message Flow
//!
//! ```text
//! Scheduler ──enqueue──▶ [bounded queue] ──▶ worker 1..N ──probe──▶ OutcomeSink
//!                                               │
//!                                 panic / hard deadline ─▶ synthetic down outcome
//! ```
//!
//! A pool never grows its queue beyond the configured capacity: a full queue
//! rejects the job and the scheduler tries again on the monitor's next due
//! time.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, instrument, warn};

use super::messages::PoolStats;
use crate::config::PoolConfig;
use crate::model::{MonitorId, ProbeOutcome, ProbeTarget};
use crate::prober::{ProbeErrorKind, Prober};

/// Error message of the outcome reported when a probe panics
pub const PROBER_INTERNAL_ERROR: &str = "prober_internal_error";

/// Receives every outcome produced by the workers
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn handle_outcome(&self, outcome: ProbeOutcome);

    /// The monitor left the schedule; state kept for it can go
    fn monitor_removed(&self, _monitor_id: MonitorId) {}
}

/// One due check of one monitor in one region
#[derive(Debug, Clone)]
pub struct ProbeJob {
    pub monitor_id: MonitorId,
    pub region: String,
    pub target: ProbeTarget,
    pub enqueued_at: DateTime<Utc>,
}

impl ProbeJob {
    pub fn new(monitor_id: MonitorId, region: impl Into<String>, target: ProbeTarget) -> Self {
        Self {
            monitor_id,
            region: region.into(),
            target,
            enqueued_at: Utc::now(),
        }
    }
}

/// What happened to a job handed to [`RegionPool::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,

    /// The previous check of this monitor in this region has not finished
    InFlight,

    /// The queue is at capacity
    Full,

    /// The pool has been shut down
    Closed,
}

#[derive(Debug, Default)]
struct PoolCounters {
    processed: AtomicU64,
    panics: AtomicU64,
    timeouts: AtomicU64,
}

/// Everything a worker task needs, shared by all workers of one region
struct WorkerContext {
    region: String,
    queue: Arc<Mutex<mpsc::Receiver<ProbeJob>>>,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn OutcomeSink>,
    in_flight: Arc<DashSet<MonitorId>>,
    counters: Arc<PoolCounters>,
    probe_margin: Duration,
}

/// Handle to the worker pool of a single region
#[derive(Clone)]
pub struct RegionPool {
    region: String,
    sender: mpsc::Sender<ProbeJob>,

    /// Keeps the queue open even when the pool runs without workers
    _queue: Arc<Mutex<mpsc::Receiver<ProbeJob>>>,

    in_flight: Arc<DashSet<MonitorId>>,
    counters: Arc<PoolCounters>,
    high_water_mark: usize,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RegionPool {
    /// Spawn `config.max_concurrency` workers for a region
    pub fn spawn(
        region: impl Into<String>,
        config: &PoolConfig,
        prober: Arc<dyn Prober>,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        let region = region.into();
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let queue = Arc::new(Mutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(DashSet::new());
        let counters = Arc::new(PoolCounters::default());

        let context = Arc::new(WorkerContext {
            region: region.clone(),
            queue: queue.clone(),
            prober,
            sink,
            in_flight: in_flight.clone(),
            counters: counters.clone(),
            probe_margin: config.probe_margin(),
        });

        for worker_id in 0..config.max_concurrency {
            tokio::spawn(worker_loop(worker_id, context.clone(), shutdown_rx.clone()));
        }

        debug!(
            "spawned {} workers for region {region}",
            config.max_concurrency
        );

        Self {
            region,
            sender,
            _queue: queue,
            in_flight,
            counters,
            high_water_mark: config.high_water_mark,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Queue a check unless the same monitor is already queued or running here
    pub fn enqueue(&self, job: ProbeJob) -> EnqueueOutcome {
        let monitor_id = job.monitor_id;

        if !self.in_flight.insert(monitor_id) {
            return EnqueueOutcome::InFlight;
        }

        match self.sender.try_send(job) {
            Ok(()) => EnqueueOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.in_flight.remove(&monitor_id);
                EnqueueOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.remove(&monitor_id);
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_congested(&self) -> bool {
        self.queue_len() >= self.high_water_mark
    }

    pub fn is_in_flight(&self, monitor_id: MonitorId) -> bool {
        self.in_flight.contains(&monitor_id)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            region: self.region.clone(),
            queue_len: self.queue_len(),
            in_flight: self.in_flight.len(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            panics: self.counters.panics.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            congested: self.is_congested(),
        }
    }

    /// Stop the workers once their current job is done
    ///
    /// Jobs still waiting in the queue are dropped.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[instrument(skip(context, shutdown), fields(region = %context.region))]
async fn worker_loop(
    worker_id: usize,
    context: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut queue = context.queue.lock().await;
            tokio::select! {
                biased;

                _ = shutdown.changed() => None,
                job = queue.recv() => job,
            }
        };

        let Some(job) = job else {
            break;
        };

        let outcome = run_job(&context, &job).await;

        let forwarded = AssertUnwindSafe(context.sink.handle_outcome(outcome))
            .catch_unwind()
            .await;
        if forwarded.is_err() {
            error!("outcome handling for monitor {} panicked", job.monitor_id);
        }

        context.in_flight.remove(&job.monitor_id);
        context.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    debug!("worker stopped");
}

/// Probe with a hard deadline, turning panics and overruns into down outcomes
async fn run_job(context: &WorkerContext, job: &ProbeJob) -> ProbeOutcome {
    let deadline =
        Duration::from_secs(u64::from(job.target.timeout_secs.max(1))) + context.probe_margin;
    let start = Instant::now();

    let probe = AssertUnwindSafe(context.prober.probe(job.monitor_id, &job.target, &job.region))
        .catch_unwind();

    match tokio::time::timeout(deadline, probe).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => {
            context.counters.panics.fetch_add(1, Ordering::Relaxed);
            error!("probe of monitor {} panicked", job.monitor_id);
            ProbeOutcome::failure(
                job.monitor_id,
                job.region.clone(),
                start.elapsed().as_millis() as u64,
                PROBER_INTERNAL_ERROR,
            )
        }
        Err(_) => {
            context.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                "probe of monitor {} exceeded its deadline of {deadline:?}",
                job.monitor_id
            );
            ProbeOutcome::failure(
                job.monitor_id,
                job.region.clone(),
                start.elapsed().as_millis() as u64,
                ProbeErrorKind::Timeout.as_str(),
            )
        }
    }
}

/// Lazily created pools, one per region
pub struct RegionPools {
    pools: DashMap<String, RegionPool>,
    config: PoolConfig,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn OutcomeSink>,
}

impl RegionPools {
    pub fn new(config: PoolConfig, prober: Arc<dyn Prober>, sink: Arc<dyn OutcomeSink>) -> Self {
        Self {
            pools: DashMap::new(),
            config,
            prober,
            sink,
        }
    }

    /// The pool of a region, spawning it on first use
    pub fn get_or_spawn(&self, region: &str) -> RegionPool {
        if let Some(pool) = self.pools.get(region) {
            return pool.clone();
        }

        self.pools
            .entry(region.to_string())
            .or_insert_with(|| {
                RegionPool::spawn(region, &self.config, self.prober.clone(), self.sink.clone())
            })
            .clone()
    }

    pub fn get(&self, region: &str) -> Option<RegionPool> {
        self.pools.get(region).map(|pool| pool.clone())
    }

    /// Tell the sink that a monitor is no longer scheduled
    pub fn release(&self, monitor_id: MonitorId) {
        self.sink.monitor_removed(monitor_id);
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.iter().map(|pool| pool.stats()).collect();
        stats.sort_by(|a, b| a.region.cmp(&b.region));
        stats
    }

    pub fn shutdown(&self) {
        for pool in self.pools.iter() {
            pool.shutdown();
        }
    }
}
