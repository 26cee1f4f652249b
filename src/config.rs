use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::model::{Plan, PlanConfig};
use crate::retry::RetryPolicy;

/// Errors raised while loading the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file provided: {0}")]
    Parse(#[from] serde_json::Error),

    /// Plan limits are required; the engine cannot gate quotas without them
    #[error("configuration does not define any subscription plans")]
    MissingPlans,

    #[error("invalid limits for plan {plan}: {reason}")]
    InvalidPlan { plan: Plan, reason: String },
}

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    crate::util::get_database_path()
}

/// Where incident notifications go
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierConfig {
    /// Only write notifications to the log
    #[default]
    Log,

    /// POST every message as JSON to a mail/SMS relay
    Webhook {
        url: String,

        /// Upper bound for one delivery request
        #[serde(default = "default_webhook_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

impl NotifierConfig {
    pub fn webhook_timeout(&self) -> Duration {
        match self {
            NotifierConfig::Webhook { timeout_secs, .. } => Duration::from_secs(*timeout_secs),
            NotifierConfig::Log => Duration::from_secs(default_webhook_timeout_secs()),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: u64,
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn reconcile(&self) -> Duration {
        Duration::from_secs(self.reconcile_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            reconcile_secs: default_reconcile_secs(),
        }
    }
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_reconcile_secs() -> u64 {
    30
}

/// Limits of every region worker pool
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolConfig {
    /// Concurrent probes per region
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Queue length at which a pool reports itself congested
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// Grace on top of a monitor's timeout before a probe is abandoned
    #[serde(default = "default_probe_margin_ms")]
    pub probe_margin_ms: u64,
}

impl PoolConfig {
    pub fn probe_margin(&self) -> Duration {
        Duration::from_millis(self.probe_margin_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            queue_capacity: default_queue_capacity(),
            high_water_mark: default_high_water_mark(),
            probe_margin_ms: default_probe_margin_ms(),
        }
    }
}

fn default_max_concurrency() -> usize {
    50
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_high_water_mark() -> usize {
    800
}

fn default_probe_margin_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IncidentConfig {
    /// Consecutive failures before a region is confirmed down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before a region is confirmed up
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    #[serde(default = "default_renotify_minutes")]
    pub renotify_minutes: u32,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            renotify_minutes: default_renotify_minutes(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_recovery_threshold() -> u32 {
    1
}

fn default_renotify_minutes() -> u32 {
    15
}

/// Backoff applied to store calls at the scheduler and engine boundaries
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub max_interval_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_attempts(self.max_attempts)
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_interval_ms: default_retry_initial_ms(),
            max_interval_ms: default_retry_max_ms(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    2000
}

/// Limits per subscription plan, keyed by plan name
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(transparent)]
pub struct PlanTable {
    plans: BTreeMap<Plan, PlanConfig>,
}

impl PlanTable {
    pub fn new(plans: impl IntoIterator<Item = (Plan, PlanConfig)>) -> Self {
        Self {
            plans: plans.into_iter().collect(),
        }
    }

    pub fn get_plan_limits(&self, plan: Plan) -> Option<&PlanConfig> {
        self.plans.get(&plan)
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.plans.is_empty() {
            return Err(ConfigError::MissingPlans);
        }

        for (plan, limits) in &self.plans {
            let invalid = |reason: &str| ConfigError::InvalidPlan {
                plan: *plan,
                reason: reason.to_string(),
            };

            if limits.monitors < -1 || limits.alert_recipients < -1 {
                return Err(invalid("limits must be -1 (unlimited) or non-negative"));
            }
            if limits.min_check_interval.is_nan() || limits.min_check_interval <= 0.0 {
                return Err(invalid("minCheckInterval must be positive"));
            }
            if limits.allowed_regions.is_empty() {
                return Err(invalid("allowedRegions must not be empty"));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub incident: IncidentConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Storage configuration (optional - defaults to SQLite)
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub plans: PlanTable,
}

impl Config {
    /// A configuration with defaults everywhere and the given plan table
    pub fn with_plans(plans: PlanTable) -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            pool: PoolConfig::default(),
            incident: IncidentConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::None,
            notifier: NotifierConfig::Log,
            plans,
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;
    config.plans.validate()?;
    Ok(config)
}

pub fn read_config_file(path: &str) -> Result<Config, ConfigError> {
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    parse_config(&file_content).inspect(|config| trace!("loaded config: {config:?}"))
}
