//! Master election across separate connection pools on one SQLite file.
//!
//! Each pool stands in for a desktop instance on its own machine; the only
//! thing they share is the database.

use blotter_election::{ElectionCoordinator, ElectionSettings, TickOutcome};
use blotter_store::{LeaseStore, PresenceStore, PriorityStore, SqliteStore, WorkflowEventLog};
use blotter_types::{Clock, ManualClock, NodeIdentity, WorkflowEventType, MASTER_LOCK_NAME};
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════

async fn open(path: &Path) -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::new(path, 2, Duration::from_secs(5))
            .await
            .unwrap(),
    )
}

fn identity(user: &str) -> NodeIdentity {
    NodeIdentity::new(format!("node-{user}"), user, format!("{user}-ws"))
}

struct Instance {
    store: Arc<SqliteStore>,
    identity: NodeIdentity,
    coordinator: ElectionCoordinator<SqliteStore>,
}

impl Instance {
    async fn start(path: &Path, user: &str, clock: &Arc<ManualClock>) -> Self {
        let store = open(path).await;
        let identity = identity(user);
        let coordinator = ElectionCoordinator::new(
            store.clone(),
            identity.clone(),
            ElectionSettings::default(),
            clock.clone(),
        );
        Self {
            store,
            identity,
            coordinator,
        }
    }

    async fn beat(&self, clock: &ManualClock) {
        self.store
            .record_heartbeat(&self.identity, clock.now())
            .await
            .unwrap();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_crashed_master_is_replaced_after_lease_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("blotter.db");
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));

    let a = Instance::start(&db, "A", &clock).await;
    let b = Instance::start(&db, "B", &clock).await;
    a.store.set_priority("A", 1).await.unwrap();
    a.store.set_priority("B", 2).await.unwrap();

    a.beat(&clock).await;
    b.beat(&clock).await;
    assert_eq!(a.coordinator.tick().await, TickOutcome::Acquired);
    assert!(matches!(b.coordinator.tick().await, TickOutcome::Deferred { .. }));

    // A stops heartbeating and ticking
    for _ in 0..2 {
        clock.advance(chrono::Duration::seconds(10));
        b.beat(&clock).await;
        let outcome = b.coordinator.tick().await;
        assert!(!b.coordinator.is_master(), "B took over early: {outcome:?}");
    }

    clock.advance(chrono::Duration::seconds(11));
    b.beat(&clock).await;
    assert_eq!(b.coordinator.tick().await, TickOutcome::Acquired);

    let lease = b
        .store
        .get_current_master(MASTER_LOCK_NAME, clock.now())
        .await
        .unwrap()
        .unwrap();
    assert!(lease.is_held_by(&b.identity));
}

#[tokio::test]
async fn test_restarted_preferred_instance_waits_for_successor_lease() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("blotter.db");
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));

    let b = Instance::start(&db, "B", &clock).await;
    b.store.set_priority("A", 1).await.unwrap();
    b.store.set_priority("B", 2).await.unwrap();

    b.beat(&clock).await;
    assert_eq!(b.coordinator.tick().await, TickOutcome::Acquired);
    clock.advance(chrono::Duration::seconds(10));
    b.beat(&clock).await;
    assert_eq!(b.coordinator.tick().await, TickOutcome::Renewed);

    let a = Instance::start(&db, "A", &clock).await;
    a.beat(&clock).await;
    assert_eq!(a.coordinator.tick().await, TickOutcome::LeaseBusy);
    assert!(!a.coordinator.is_master());

    // B sees A online and steps down without releasing
    assert!(matches!(b.coordinator.tick().await, TickOutcome::Deferred { .. }));
    assert!(!b.coordinator.is_master());

    let mut promoted_after = None;
    for step in 1..=6 {
        clock.advance(chrono::Duration::seconds(10));
        a.beat(&clock).await;
        b.beat(&clock).await;
        b.coordinator.tick().await;
        if a.coordinator.tick().await == TickOutcome::Acquired {
            promoted_after = Some(step);
            break;
        }
    }

    // B's last renewal ran until +40s; A is promoted on the first tick past it
    assert_eq!(promoted_after, Some(4));
    assert!(!b.coordinator.is_master());

    let events = a.store.list_recent(20).await.unwrap();
    let acquired_by_a = events.iter().any(|e| {
        e.event_type == WorkflowEventType::MastershipAcquired && e.user_id == "A"
    });
    let lost_by_b = events
        .iter()
        .any(|e| e.event_type == WorkflowEventType::MastershipLost && e.user_id == "B");
    assert!(acquired_by_a);
    assert!(lost_by_b);
}

#[tokio::test]
async fn test_concurrent_acquires_elect_one_holder() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("blotter.db");
    let now = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
    let ttl = chrono::Duration::seconds(30);

    let mut stores = Vec::new();
    for i in 0..6 {
        stores.push((open(&db).await, identity(&format!("user{i}"))));
    }

    let attempts = join_all(stores.iter().map(|(store, who)| async move {
        store
            .try_acquire_lease(MASTER_LOCK_NAME, who, now, ttl)
            .await
            .map(|won| (who.clone(), won))
    }))
    .await;

    let winners: Vec<NodeIdentity> = attempts
        .into_iter()
        .filter_map(|attempt| match attempt {
            Ok((who, true)) => Some(who),
            _ => None,
        })
        .collect();
    assert_eq!(winners.len(), 1, "winners: {winners:?}");

    let store = open(&db).await;
    let lease = store
        .get_current_master(MASTER_LOCK_NAME, now)
        .await
        .unwrap()
        .unwrap();
    assert!(lease.is_held_by(&winners[0]));
}

#[tokio::test]
async fn test_clean_shutdown_hands_over_without_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("blotter.db");
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));

    let a = Instance::start(&db, "A", &clock).await;
    let b = Instance::start(&db, "B", &clock).await;
    a.store.set_priority("A", 1).await.unwrap();
    a.store.set_priority("B", 2).await.unwrap();

    a.beat(&clock).await;
    b.beat(&clock).await;
    assert_eq!(a.coordinator.tick().await, TickOutcome::Acquired);

    // A is taken off the desk rota and closed
    a.store.remove_priority("A").await.unwrap();
    a.coordinator.shutdown().await;
    assert!(!a.coordinator.is_master());

    // Well inside the 30s lease A would otherwise still hold
    clock.advance(chrono::Duration::seconds(1));
    b.beat(&clock).await;
    assert_eq!(b.coordinator.tick().await, TickOutcome::Acquired);
}
