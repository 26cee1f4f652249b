//! Concurrent creations racing for the last free slots of a plan

use crate::helpers::*;
use futures::future::join_all;
use std::sync::Arc;
use uptime_engine::model::{AlertRecipient, Monitor, Plan};
use uptime_engine::quota::{Admission, QuotaDecision, QuotaGate, ResourceKind};
use uptime_engine::storage::{MemoryStore, MonitorStore, RecipientStore};

fn gate(store: &Arc<MemoryStore>) -> Arc<QuotaGate> {
    Arc::new(QuotaGate::new(store.clone(), store.clone(), test_plans()))
}

/// Spawn `attempts` concurrent monitor creations for one user and return how
/// many were admitted
async fn race_monitor_creations(
    gate: &Arc<QuotaGate>,
    store: &Arc<MemoryStore>,
    user: &str,
    attempts: usize,
) -> usize {
    let tasks = (0..attempts).map(|i| {
        let gate = gate.clone();
        let store = store.clone();
        let user = user.to_string();
        tokio::spawn(async move {
            let monitor = Monitor::new(user.clone(), format!("https://{i}.example"));
            gate.admit(&user, ResourceKind::Monitors, || store.insert_monitor(monitor))
                .await
                .unwrap()
        })
    });

    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|admission| matches!(admission, Admission::Admitted(())))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creations_never_exceed_limit() {
    let store = Arc::new(MemoryStore::new());
    let gate = gate(&store);

    // BASIC allows 3; one exists already
    store
        .insert_monitor(Monitor::new("user-1", "https://existing.example"))
        .await
        .unwrap();

    let admitted = race_monitor_creations(&gate, &store, "user-1", 100).await;

    assert_eq!(admitted, 2);
    assert_eq!(store.count_active_by_user("user-1").await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_users_do_not_share_quota() {
    let store = Arc::new(MemoryStore::new());
    store.set_user_plan("user-b", Plan::Premium).await.unwrap();
    let gate = gate(&store);

    let (a, b) = tokio::join!(
        race_monitor_creations(&gate, &store, "user-a", 20),
        race_monitor_creations(&gate, &store, "user-b", 20),
    );

    assert_eq!(a, 3);
    assert_eq!(b, 10);
    assert_eq!(store.count_active_by_user("user-a").await.unwrap(), 3);
    assert_eq!(store.count_active_by_user("user-b").await.unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unlimited_plan_admits_everything() {
    let store = Arc::new(MemoryStore::new());
    store.set_user_plan("big-co", Plan::Enterprise).await.unwrap();
    let gate = gate(&store);

    let admitted = race_monitor_creations(&gate, &store, "big-co", 50).await;

    assert_eq!(admitted, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_recipient_creations_across_monitors() {
    let store = Arc::new(MemoryStore::new());
    let first = Monitor::new("user-1", "https://a.example");
    let second = Monitor::new("user-1", "https://b.example");
    store.insert_monitor(first.clone()).await.unwrap();
    store.insert_monitor(second.clone()).await.unwrap();
    let gate = gate(&store);

    let tasks = (0..30).map(|i| {
        let gate = gate.clone();
        let store = store.clone();
        let monitor_id = if i % 2 == 0 { first.id } else { second.id };
        tokio::spawn(async move {
            let recipient = AlertRecipient::new(monitor_id, format!("person{i}@example.com"));
            gate.admit("user-1", ResourceKind::AlertRecipients, || {
                store.insert_recipient(recipient)
            })
            .await
            .unwrap()
        })
    });

    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Admission::Admitted(()))))
        .count();

    // BASIC allows 2 recipients in total, not per monitor
    assert_eq!(admitted, 2);
    assert_eq!(store.count_recipients_by_user("user-1").await.unwrap(), 2);

    let decision = gate
        .can_create("user-1", ResourceKind::AlertRecipients)
        .await
        .unwrap();
    assert!(matches!(decision, QuotaDecision::Deny(ref denial) if denial.current == 2));
}
