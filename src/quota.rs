//! Plan quota gate
//!
//! The CRUD layer asks the gate before it creates a monitor or an alert
//! recipient. A quota that is exceeded is a normal answer
//! ([`QuotaDecision::Deny`]) carrying the limit and the current usage, not an
//! error.
//!
//! Check and creation run under a per-user lock ([`QuotaGate::admit`]) so two
//! concurrent requests of the same user can never both pass the last free
//! slot. Different users never wait on each other.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::config::PlanTable;
use crate::model::{Plan, PlanConfig};
use crate::storage::{MonitorStore, RecipientStore, StorageError, StorageResult};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota lookup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("no limits configured for plan {0}")]
    UnknownPlan(Plan),
}

/// Resources counted against a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Monitors,
    AlertRecipients,
}

impl ResourceKind {
    fn limit(&self, plan: &PlanConfig) -> i64 {
        match self {
            ResourceKind::Monitors => plan.monitors,
            ResourceKind::AlertRecipients => plan.alert_recipients,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ResourceKind::Monitors => "monitors",
            ResourceKind::AlertRecipients => "alert recipients",
        }
    }
}

/// Why a creation was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDenial {
    pub resource: ResourceKind,
    pub plan: Plan,
    pub limit: i64,
    pub current: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny(QuotaDenial),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allow)
    }
}

/// Result of [`QuotaGate::admit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<T> {
    Admitted(T),
    Denied(QuotaDenial),
}

/// Monitor settings the user's plan does not permit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum SettingsViolation {
    IntervalTooShort { requested: u32, minimum: f64 },
    RegionNotAllowed { region: String },
}

pub struct QuotaGate {
    monitors: Arc<dyn MonitorStore>,
    recipients: Arc<dyn RecipientStore>,
    plans: PlanTable,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl QuotaGate {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        recipients: Arc<dyn RecipientStore>,
        plans: PlanTable,
    ) -> Self {
        Self {
            monitors,
            recipients,
            plans,
            user_locks: DashMap::new(),
        }
    }

    async fn plan_limits(&self, user_id: &str) -> Result<(Plan, &PlanConfig), QuotaError> {
        let plan = self.monitors.user_plan(user_id).await?;
        let limits = self
            .plans
            .get_plan_limits(plan)
            .ok_or(QuotaError::UnknownPlan(plan))?;
        Ok((plan, limits))
    }

    /// Whether the user may create one more resource of the given kind
    #[instrument(skip(self))]
    pub async fn can_create(
        &self,
        user_id: &str,
        resource: ResourceKind,
    ) -> Result<QuotaDecision, QuotaError> {
        let (plan, limits) = self.plan_limits(user_id).await?;
        let limit = resource.limit(limits);

        if limit < 0 {
            return Ok(QuotaDecision::Allow);
        }

        let current = match resource {
            ResourceKind::Monitors => self.monitors.count_active_by_user(user_id).await?,
            ResourceKind::AlertRecipients => {
                self.recipients.count_recipients_by_user(user_id).await?
            }
        };

        if current >= limit as u64 {
            debug!("denied: {current}/{limit} {} on {plan}", resource.label());
            return Ok(QuotaDecision::Deny(QuotaDenial {
                resource,
                plan,
                limit,
                current,
                reason: format!(
                    "the {plan} plan allows {limit} {}, {current} already in use",
                    resource.label()
                ),
            }));
        }

        Ok(QuotaDecision::Allow)
    }

    /// Check the quota and run `create` while holding the user's lock
    ///
    /// `create` is only called when the check allows it.
    pub async fn admit<T, F, Fut>(
        &self,
        user_id: &str,
        resource: ResourceKind,
        create: F,
    ) -> Result<Admission<T>, QuotaError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let lock = self
            .user_locks
            .entry(user_id.to_string())
            .or_default()
            .clone();

        let admission = {
            let _guard = lock.lock().await;
            match self.can_create(user_id, resource).await {
                Ok(QuotaDecision::Deny(denial)) => Ok(Admission::Denied(denial)),
                Ok(QuotaDecision::Allow) => create().await.map(Admission::Admitted).map_err(QuotaError::from),
                Err(e) => Err(e),
            }
        };

        // the map holds one reference; more means another admission is waiting
        drop(lock);
        self.user_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);

        admission
    }

    /// Interval and region restrictions of the user's plan
    ///
    /// Returns every violation; an empty list means the settings are fine.
    pub async fn check_monitor_settings(
        &self,
        user_id: &str,
        interval_minutes: u32,
        regions: &[String],
    ) -> Result<Vec<SettingsViolation>, QuotaError> {
        let (_, limits) = self.plan_limits(user_id).await?;
        let mut violations = Vec::new();

        if f64::from(interval_minutes) < limits.min_check_interval {
            violations.push(SettingsViolation::IntervalTooShort {
                requested: interval_minutes,
                minimum: limits.min_check_interval,
            });
        }

        for region in regions {
            if !limits.allowed_regions.contains(region) {
                violations.push(SettingsViolation::RegionNotAllowed {
                    region: region.clone(),
                });
            }
        }

        Ok(violations)
    }
}
