//! Failure and chaos tests for the engine
//!
//! These tests verify that the engine degrades instead of stopping:
//! - Store outages
//! - Prober crashes
//! - Notification delivery failures
//! - Monitors paused or deleted while scheduled

use crate::helpers::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uptime_engine::actors::region_pool::PROBER_INTERNAL_ERROR;
use uptime_engine::engine::UptimeEngine;
use uptime_engine::model::{AlertRecipient, Monitor, MonitorStatus};
use uptime_engine::notifier::WebhookNotifier;
use uptime_engine::storage::{
    IncidentStore, MemoryStore, MonitorStore, RecipientStore, ResultStore, Stores,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn start(store: &Arc<MemoryStore>, prober: &Arc<ScriptedProber>) -> UptimeEngine {
    UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        prober.clone(),
        RecordingNotifier::new(),
    )
}

#[tokio::test]
async fn test_store_outage_keeps_previous_schedule() {
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://outage");
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    let engine = start(&store, &prober);

    let report = engine.scheduler().reconcile_now().await.unwrap();
    assert_eq!(report.total, 1);

    store.set_unavailable(true);
    assert!(engine.scheduler().reconcile_now().await.is_err());

    // the monitor is still scheduled and can still be dispatched
    assert!(engine.scheduler().next_due(monitor.id).await.unwrap().is_some());
    let stats = engine.scheduler().stats().await.unwrap();
    assert_eq!(stats.scheduled_monitors, 1);
    assert!(stats.reconcile_failures >= 1);
    assert_eq!(engine.scheduler().check_now(monitor.id).await.unwrap(), 1);

    store.set_unavailable(false);
    let report = engine.scheduler().reconcile_now().await.unwrap();
    assert_eq!(report.total, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_store_failure_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://flaky");
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    let engine = start(&store, &prober);
    engine.scheduler().reconcile_now().await.unwrap();

    // consumed by the incident engine's monitor lookup
    store.fail_next(1);
    check_and_wait(&engine, monitor.id).await;

    assert_eq!(store.latest_results(monitor.id, 10).await.unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_prober_panic_becomes_failed_check() {
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://crash");
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    prober.script(monitor.id, [Step::Panic]);
    let engine = start(&store, &prober);

    check_and_wait(&engine, monitor.id).await;

    let results = store.latest_results(monitor.id, 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].up);
    assert_eq!(results[0].error_message.as_deref(), Some(PROBER_INTERNAL_ERROR));

    let stats = engine.pool_stats();
    assert_eq!(stats[0].panics, 1);

    // the worker survived and keeps probing
    check_and_wait(&engine, monitor.id).await;
    let results = store.latest_results(monitor.id, 10).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results.iter().filter(|r| r.up).count(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_notifier_failure_does_not_block_incident() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&relay)
        .await;

    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://down");
    store.insert_monitor(monitor.clone()).await.unwrap();
    store
        .insert_recipient(AlertRecipient::new(monitor.id, "ops@example.com"))
        .await
        .unwrap();

    let prober = ScriptedProber::new();
    prober.script(monitor.id, [Step::Down, Step::Down]);
    let engine = UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        prober.clone(),
        Arc::new(WebhookNotifier::new(format!("{}/notify", relay.uri()), Duration::from_secs(5)).unwrap()),
    );

    check_and_wait(&engine, monitor.id).await;
    check_and_wait(&engine, monitor.id).await;

    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Down);
    assert!(store.find_open_incident(monitor.id).await.unwrap().is_some());

    engine.shutdown().await;
    relay.verify().await;
}

#[tokio::test]
async fn test_slow_relay_does_not_stall_checks() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .expect(1)
        .mount(&relay)
        .await;

    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://down");
    store.insert_monitor(monitor.clone()).await.unwrap();
    store
        .insert_recipient(AlertRecipient::new(monitor.id, "ops@example.com"))
        .await
        .unwrap();

    let prober = ScriptedProber::new();
    prober.script(monitor.id, [Step::Down, Step::Down]);
    let engine = UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        prober.clone(),
        Arc::new(WebhookNotifier::new(format!("{}/notify", relay.uri()), Duration::from_secs(10)).unwrap()),
    );

    let started = Instant::now();
    check_and_wait(&engine, monitor.id).await;
    check_and_wait(&engine, monitor.id).await;
    assert!(store.find_open_incident(monitor.id).await.unwrap().is_some());
    assert!(started.elapsed() < Duration::from_secs(2));

    engine.shutdown().await;
    relay.verify().await;
}

#[tokio::test]
async fn test_paused_monitor_is_not_probed() {
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://paused");
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    let engine = start(&store, &prober);
    engine.scheduler().reconcile_now().await.unwrap();

    store.set_paused(monitor.id, true).await.unwrap();
    let mut paused = monitor.clone();
    paused.is_paused = true;
    engine.scheduler().upsert(paused).await.unwrap();

    assert_eq!(engine.scheduler().check_now(monitor.id).await.unwrap(), 0);
    assert_eq!(prober.probe_count(monitor.id), 0);
    assert!(engine.scheduler().next_due(monitor.id).await.unwrap().is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_deleted_monitor_leaves_schedule_on_reconcile() {
    let store = Arc::new(MemoryStore::new());
    let kept = Monitor::new("user-1", "stub://kept");
    let deleted = Monitor::new("user-1", "stub://deleted");
    store.insert_monitor(kept.clone()).await.unwrap();
    store.insert_monitor(deleted.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    let engine = start(&store, &prober);
    assert_eq!(engine.scheduler().reconcile_now().await.unwrap().total, 2);

    store.soft_delete(deleted.id).await.unwrap();
    let report = engine.scheduler().reconcile_now().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.total, 1);

    assert_eq!(engine.scheduler().check_now(deleted.id).await.unwrap(), 0);
    assert_eq!(check_and_wait(&engine, kept.id).await, 1);
    assert_eq!(prober.probe_count(deleted.id), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_outcome_for_deleted_monitor_is_discarded() {
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::new("user-1", "stub://gone");
    store.insert_monitor(monitor.clone()).await.unwrap();

    let prober = ScriptedProber::new();
    prober.script(monitor.id, [Step::Down, Step::Down]);
    let engine = start(&store, &prober);
    engine.scheduler().reconcile_now().await.unwrap();

    // deleted after scheduling but before the probes come back
    store.soft_delete(monitor.id).await.unwrap();
    check_and_wait(&engine, monitor.id).await;
    check_and_wait(&engine, monitor.id).await;

    assert!(store.latest_results(monitor.id, 10).await.unwrap().is_empty());
    assert!(store.list_incidents(monitor.id).await.unwrap().is_empty());

    engine.shutdown().await;
}
