//! Wiring of the scheduler, the region pools, the incident engine and the
//! quota gate

use std::sync::Arc;

use tracing::info;

use crate::actors::messages::PoolStats;
use crate::actors::region_pool::RegionPools;
use crate::actors::scheduler::SchedulerHandle;
use crate::config::Config;
use crate::incident::{IncidentEngine, IncidentPolicy};
use crate::notifier::{NotificationDispatcher, Notifier};
use crate::prober::Prober;
use crate::quota::QuotaGate;
use crate::storage::Stores;

/// A running engine
///
/// Dropping it does not stop the background tasks; call
/// [`UptimeEngine::shutdown`].
pub struct UptimeEngine {
    scheduler: SchedulerHandle,
    pools: Arc<RegionPools>,
    incidents: Arc<IncidentEngine>,
    quota: Arc<QuotaGate>,
}

impl UptimeEngine {
    /// Spawn the scheduler actor; region pools are spawned on first use
    pub fn start(
        config: &Config,
        stores: Stores,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let retry = config.retry.policy();

        let dispatcher =
            NotificationDispatcher::new(notifier, stores.recipients.clone(), retry.clone());
        let incidents = Arc::new(IncidentEngine::new(
            stores.clone(),
            dispatcher,
            IncidentPolicy::from(&config.incident),
            retry.clone(),
        ));

        let pools = Arc::new(RegionPools::new(
            config.pool.clone(),
            prober,
            incidents.clone(),
        ));

        let scheduler = SchedulerHandle::spawn(
            stores.monitors.clone(),
            stores.results.clone(),
            pools.clone(),
            config.scheduler.clone(),
            retry,
        );

        let quota = Arc::new(QuotaGate::new(
            stores.monitors.clone(),
            stores.recipients.clone(),
            config.plans.clone(),
        ));

        info!("uptime engine started");

        Self {
            scheduler,
            pools,
            incidents,
            quota,
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn incidents(&self) -> &Arc<IncidentEngine> {
        &self.incidents
    }

    pub fn quota_gate(&self) -> &Arc<QuotaGate> {
        &self.quota
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.stats()
    }

    /// Stop scheduling and let the workers finish their current probe
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.pools.shutdown();
        self.incidents.flush_notifications().await;
        info!("uptime engine stopped");
    }
}
