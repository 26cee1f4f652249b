//! Helper functions for integration tests

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uptime_engine::config::{Config, PlanTable};
use uptime_engine::engine::UptimeEngine;
use uptime_engine::model::{MonitorId, Plan, PlanConfig, ProbeOutcome, ProbeTarget};
use uptime_engine::notifier::{Notifier, NotifyError};
use uptime_engine::prober::Prober;

pub fn test_plans() -> PlanTable {
    PlanTable::new([
        (
            Plan::Basic,
            PlanConfig {
                monitors: 3,
                alert_recipients: 2,
                min_check_interval: 5.0,
                data_retention_days: 7,
                allowed_regions: vec!["us-east-1".to_string()],
            },
        ),
        (
            Plan::Premium,
            PlanConfig {
                monitors: 10,
                alert_recipients: 10,
                min_check_interval: 1.0,
                data_retention_days: 30,
                allowed_regions: vec!["us-east-1".to_string(), "eu-west-1".to_string()],
            },
        ),
        (
            Plan::Enterprise,
            PlanConfig {
                monitors: -1,
                alert_recipients: -1,
                min_check_interval: 0.5,
                data_retention_days: 365,
                allowed_regions: vec![
                    "us-east-1".to_string(),
                    "eu-west-1".to_string(),
                    "ap-southeast-1".to_string(),
                ],
            },
        ),
    ])
}

/// Config whose timers never fire during a test; checks are driven through
/// the scheduler handle
pub fn manual_config() -> Config {
    let mut config = Config::with_plans(test_plans());
    config.scheduler.tick_ms = 60_000;
    config.scheduler.reconcile_secs = 3_600;
    config.retry.initial_interval_ms = 1;
    config.retry.max_interval_ms = 5;
    config
}

/// What the scripted prober answers for one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Up,
    Down,
    Panic,
}

/// Prober answering from a per-monitor script; monitors without a script
/// (or with an exhausted one) are up
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<MonitorId, VecDeque<Step>>>,
    probes: Mutex<Vec<(MonitorId, String)>>,
}

impl ScriptedProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, monitor_id: MonitorId, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(monitor_id)
            .or_default()
            .extend(steps);
    }

    pub fn probe_count(&self, monitor_id: MonitorId) -> usize {
        self.probes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == monitor_id)
            .count()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, monitor_id: MonitorId, target: &ProbeTarget, region: &str) -> ProbeOutcome {
        self.probes
            .lock()
            .unwrap()
            .push((monitor_id, region.to_string()));

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&monitor_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Up);

        match step {
            Step::Up => ProbeOutcome {
                monitor_id,
                region: region.to_string(),
                checked_at: Utc::now(),
                up: true,
                status_code: Some(target.expected_status),
                response_time_ms: 12,
                error_message: None,
            },
            Step::Down => ProbeOutcome {
                monitor_id,
                region: region.to_string(),
                checked_at: Utc::now(),
                up: false,
                status_code: Some(503),
                response_time_ms: 40,
                error_message: Some("unexpected status code: 503".to_string()),
            },
            Step::Panic => panic!("scripted prober panic"),
        }
    }
}

/// Notifier remembering every message it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, subject)| subject.clone())
            .collect()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(recipient, _)| recipient.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, subject: &str, _body: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), subject.to_string()));
        Ok(())
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 5 seconds");
}

pub fn processed_total(engine: &UptimeEngine) -> u64 {
    engine.pool_stats().iter().map(|stats| stats.processed).sum()
}

/// Trigger a check and wait until every resulting outcome has been applied
pub async fn check_and_wait(engine: &UptimeEngine, monitor_id: MonitorId) -> usize {
    let before = processed_total(engine);
    let dispatched = engine.scheduler().check_now(monitor_id).await.unwrap();
    let expected = before + dispatched as u64;
    wait_until(move || async move { processed_total(engine) >= expected }).await;
    dispatched
}
