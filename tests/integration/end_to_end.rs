//! Full path: scheduler → region pool → HTTP probe → incident engine →
//! notifier, against a mock target

use crate::helpers::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use uptime_engine::engine::UptimeEngine;
use uptime_engine::model::{AlertRecipient, IncidentStatus, Monitor, MonitorStatus};
use uptime_engine::prober::HttpProber;
use uptime_engine::storage::{
    IncidentStore, MemoryStore, MonitorStore, RecipientStore, ResultStore, Stores,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_outage_opens_incident_and_recovery_resolves_it() {
    let server = MockServer::start().await;

    // two failing responses, then healthy again
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(2)
        .mount(&server)
        .await;

    let url = format!("{}/health", server.uri());
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", url.clone())
        .with_interval(1)
        .with_timeout(5);
    store.insert_monitor(monitor.clone()).await.unwrap();
    store
        .insert_recipient(AlertRecipient::new(monitor.id, "ops@example.com"))
        .await
        .unwrap();

    let notifier = RecordingNotifier::new();
    let engine = UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        Arc::new(HttpProber::new().unwrap()),
        notifier.clone(),
    );

    // first failure only counts
    assert_eq!(check_and_wait(&engine, monitor.id).await, 1);
    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Up);
    assert!(store.find_open_incident(monitor.id).await.unwrap().is_none());

    // second consecutive failure opens the incident
    check_and_wait(&engine, monitor.id).await;
    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Down);
    let incident = store.find_open_incident(monitor.id).await.unwrap().unwrap();
    assert_eq!(incident.status, IncidentStatus::Open);
    assert!(incident.summary.contains("unexpected status code: 500"));
    engine.incidents().flush_notifications().await;
    assert_eq!(notifier.subjects(), vec![format!("[DOWN] {url}")]);
    assert_eq!(notifier.recipients(), vec!["ops@example.com".to_string()]);

    // one success resolves it
    check_and_wait(&engine, monitor.id).await;
    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Up);
    assert!(store.find_open_incident(monitor.id).await.unwrap().is_none());

    let incidents = store.list_incidents(monitor.id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].id, incident.id);
    assert_eq!(incidents[0].status, IncidentStatus::Resolved);
    assert!(incidents[0].resolved_at.is_some());

    engine.incidents().flush_notifications().await;
    assert_eq!(
        notifier.subjects(),
        vec![format!("[DOWN] {url}"), format!("[RECOVERED] {url}")]
    );

    let results = store.latest_results(monitor.id, 10).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|r| r.up).count(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_every_configured_region_is_probed() {
    let store = Arc::new(MemoryStore::new());
    let monitor =
        Monitor::new("user-1", "stub://multi").with_regions(["us-east-1", "eu-west-1", "ap-southeast-1"]);
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    let engine = UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        prober.clone(),
        RecordingNotifier::new(),
    );

    assert_eq!(check_and_wait(&engine, monitor.id).await, 3);
    assert_eq!(prober.probe_count(monitor.id), 3);

    let mut regions: Vec<String> = store
        .latest_results(monitor.id, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.region)
        .collect();
    regions.sort();
    assert_eq!(regions, vec!["ap-southeast-1", "eu-west-1", "us-east-1"]);

    let mut pools: Vec<String> = engine.pool_stats().into_iter().map(|s| s.region).collect();
    pools.sort();
    assert_eq!(pools, vec!["ap-southeast-1", "eu-west-1", "us-east-1"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_majority_of_regions_decides_status() {
    let store = Arc::new(MemoryStore::new());
    let monitor =
        Monitor::new("user-1", "stub://partial").with_regions(["us-east-1", "eu-west-1", "ap-southeast-1"]);
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    let engine = UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        prober.clone(),
        RecordingNotifier::new(),
    );

    // the scripted prober is keyed by monitor, so each check hands out the
    // steps in whatever order the regions pick them up: one region down per
    // round is never a majority
    for _ in 0..3 {
        prober.script(monitor.id, [Step::Down, Step::Up, Step::Up]);
        check_and_wait(&engine, monitor.id).await;
    }
    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Up);
    assert!(store.find_open_incident(monitor.id).await.unwrap().is_none());

    // every region failing twice is
    for _ in 0..2 {
        prober.script(monitor.id, [Step::Down, Step::Down, Step::Down]);
        check_and_wait(&engine, monitor.id).await;
    }
    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Down);
    assert!(store.find_open_incident(monitor.id).await.unwrap().is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_new_monitor_is_checked_on_the_first_tick() {
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://fresh").with_interval(1);
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    let mut config = manual_config();
    config.scheduler.tick_ms = 20;

    let engine = UptimeEngine::start(
        &config,
        Stores::from_backend(store.clone()),
        prober.clone(),
        RecordingNotifier::new(),
    );

    wait_until(|| {
        let store = store.clone();
        let id = monitor.id;
        async move { store.latest_results(id, 10).await.unwrap().len() == 1 }
    })
    .await;

    // the next check is a full interval away, so further ticks do nothing
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(prober.probe_count(monitor.id), 1);

    let next_due = engine.scheduler().next_due(monitor.id).await.unwrap().unwrap();
    assert!(next_due > chrono::Utc::now() + chrono::Duration::seconds(50));

    engine.shutdown().await;
}
