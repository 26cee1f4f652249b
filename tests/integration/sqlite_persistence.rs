//! The engine on top of the SQLite store, across restarts

use crate::helpers::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use uptime_engine::engine::UptimeEngine;
use uptime_engine::model::{AlertRecipient, IncidentStatus, Monitor, MonitorStatus};
use uptime_engine::quota::{Admission, ResourceKind};
use uptime_engine::storage::sqlite::SqliteStore;
use uptime_engine::storage::{IncidentStore, MonitorStore, RecipientStore, ResultStore, Stores};

async fn open(dir: &TempDir) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(dir.path().join("uptime.db")).await.unwrap())
}

#[tokio::test]
async fn test_open_incident_survives_restart_and_resolves() {
    let dir = TempDir::new().unwrap();
    let monitor = Monitor::new("user-1", "stub://persisted");

    let notifier = RecordingNotifier::new();
    let incident_id = {
        let store = open(&dir).await;
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
            prober,
            notifier.clone(),
        );

        check_and_wait(&engine, monitor.id).await;
        check_and_wait(&engine, monitor.id).await;
        engine.shutdown().await;

        let incident = store.find_open_incident(monitor.id).await.unwrap().unwrap();
        store.close().await;
        incident.id
    };

    // a fresh process picks up the stored DOWN status and the open incident
    let store = open(&dir).await;
    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Down);

    let prober = ScriptedProber::new();
    let engine = UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        prober,
        notifier.clone(),
    );

    check_and_wait(&engine, monitor.id).await;

    let incidents = store.list_incidents(monitor.id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].id, incident_id);
    assert_eq!(incidents[0].status, IncidentStatus::Resolved);

    let stored = store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Up);
    assert_eq!(store.latest_results(monitor.id, 10).await.unwrap().len(), 3);

    engine.incidents().flush_notifications().await;
    assert_eq!(
        notifier.subjects(),
        vec![
            "[DOWN] stub://persisted".to_string(),
            "[RECOVERED] stub://persisted".to_string()
        ]
    );

    engine.shutdown().await;
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quota_holds_under_concurrency_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let engine = UptimeEngine::start(
        &manual_config(),
        Stores::from_backend(store.clone()),
        ScriptedProber::new(),
        RecordingNotifier::new(),
    );
    let gate = engine.quota_gate().clone();

    let tasks = (0..25).map(|i| {
        let gate = gate.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let monitor = Monitor::new("user-1", format!("https://{i}.example"));
            gate.admit("user-1", ResourceKind::Monitors, || store.insert_monitor(monitor))
                .await
                .unwrap()
        })
    });

    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Admission::Admitted(()))))
        .count();

    // BASIC allows 3 monitors
    assert_eq!(admitted, 3);
    assert_eq!(store.count_active_by_user("user-1").await.unwrap(), 3);

    engine.shutdown().await;
    store.close().await;
}
