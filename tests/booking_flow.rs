//! Booking from any desk, responses applied only by the elected master,
//! everything through one shared SQLite database.

use async_trait::async_trait;
use blotter_booking::{
    BookingCommand, BookingError, BookingExporter, BookingStateMachine, ExportError,
};
use blotter_election::{ElectionCoordinator, ElectionSettings, TickOutcome};
use blotter_ingest::{FileDisposition, IngestSettings, ResponseIngestor};
use blotter_store::{LinkStore, PresenceStore, PriorityStore, SqliteStore, WorkflowEventLog};
use blotter_types::{
    Clock, Leadership, LinkStatus, ManualClock, NewLink, NodeIdentity, SystemCode,
    TradeSystemLink, WorkflowEventType,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// MOCK IMPLEMENTATIONS FOR TESTING
// ═══════════════════════════════════════════════════════════════════════════

/// Records exported links instead of writing booking files
#[derive(Default)]
struct RecordingExporter {
    exported: Mutex<Vec<(i64, SystemCode)>>,
}

#[async_trait]
impl BookingExporter for RecordingExporter {
    async fn export(&self, link: &TradeSystemLink) -> Result<(), ExportError> {
        self.exported
            .lock()
            .unwrap()
            .push((link.trade_id, link.system_code));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DESK SETUP
// ═══════════════════════════════════════════════════════════════════════════

struct Desk {
    store: Arc<SqliteStore>,
    coordinator: Arc<ElectionCoordinator<SqliteStore>>,
    machine: Arc<BookingStateMachine<SqliteStore>>,
    identity: NodeIdentity,
}

impl Desk {
    async fn join(db: &Path, user: &str, clock: &Arc<ManualClock>) -> Self {
        let store = Arc::new(
            SqliteStore::new(db, 2, Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let identity = NodeIdentity::new(format!("node-{user}"), user, format!("{user}-ws"));
        let coordinator = Arc::new(ElectionCoordinator::new(
            store.clone(),
            identity.clone(),
            ElectionSettings::default(),
            clock.clone(),
        ));
        let leadership: Arc<dyn Leadership> = Arc::new(coordinator.leadership());
        let machine = Arc::new(BookingStateMachine::new(
            store.clone(),
            leadership,
            clock.clone(),
            user,
        ));
        Self {
            store,
            coordinator,
            machine,
            identity,
        }
    }

    async fn beat(&self, clock: &ManualClock) {
        self.store
            .record_heartbeat(&self.identity, clock.now())
            .await
            .unwrap();
    }

    async fn ingestor(&self, inbound: &Path) -> ResponseIngestor<SqliteStore> {
        let ingestor = ResponseIngestor::new(self.machine.clone(), IngestSettings::under(inbound));
        ingestor.ensure_dirs().await.unwrap();
        ingestor
    }
}

fn response(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

// ═══════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_trade_booked_by_one_desk_confirmed_by_master() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("blotter.db");
    let inbound = dir.path().join("inbound");
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));

    let master = Desk::join(&db, "alice", &clock).await;
    let trader = Desk::join(&db, "bob", &clock).await;
    master.store.set_priority("alice", 1).await.unwrap();
    master.store.set_priority("bob", 2).await.unwrap();
    master.beat(&clock).await;
    trader.beat(&clock).await;
    assert_eq!(master.coordinator.tick().await, TickOutcome::Acquired);
    assert!(matches!(trader.coordinator.tick().await, TickOutcome::Deferred { .. }));

    trader
        .store
        .insert_link(&NewLink::new(42, SystemCode::Mx3))
        .await
        .unwrap();
    trader
        .store
        .insert_link(&NewLink::new(42, SystemCode::Calypso))
        .await
        .unwrap();

    // Booking itself needs no mastership
    let exporter = Arc::new(RecordingExporter::default());
    let command = BookingCommand::new(trader.machine.clone(), exporter.clone());
    let submitted = command.submit_trade(42).await.unwrap();
    assert_eq!(submitted.len(), 2);
    for (system, result) in &submitted {
        let link = result.as_ref().unwrap();
        assert_eq!(link.status, LinkStatus::Pending, "{system}");
    }
    assert_eq!(exporter.exported.lock().unwrap().len(), 2);

    let ingestor = master.ingestor(&inbound).await;
    let ok = response(
        &inbound,
        "mx3-42.json",
        r#"{"trade_id":42,"system_code":"MX3","outcome":"success","external_trade_id":"DEAL123"}"#,
    );
    let failed = response(
        &inbound,
        "calypso-42.json",
        r#"{"trade_id":42,"system_code":"CALYPSO","outcome":"failure","error":"book not mapped"}"#,
    );
    assert_eq!(ingestor.process_file(&ok).await, FileDisposition::Archived);
    assert_eq!(ingestor.process_file(&failed).await, FileDisposition::Archived);
    assert!(!ok.exists());

    let mx3 = trader
        .store
        .find_link(42, SystemCode::Mx3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mx3.status, LinkStatus::Booked);
    assert_eq!(mx3.external_trade_id.as_deref(), Some("DEAL123"));
    assert_eq!(mx3.booked_by.as_deref(), Some("bob"));
    assert!(mx3.first_booked_utc.is_some());

    let calypso = trader
        .store
        .find_link(42, SystemCode::Calypso)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calypso.status, LinkStatus::Error);
    assert_eq!(calypso.last_error.as_deref(), Some("book not mapped"));

    let trail: Vec<_> = trader
        .store
        .list_for_trade(42)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        trail
            .iter()
            .filter(|t| **t == WorkflowEventType::BookingRequested)
            .count(),
        2
    );
    assert!(trail.contains(&WorkflowEventType::Booked));
    assert!(trail.contains(&WorkflowEventType::BookingFailed));

    // The failed leg can be resubmitted
    let retried = command.submit(42, SystemCode::Calypso).await.unwrap();
    assert_eq!(retried.status, LinkStatus::Pending);
    assert_eq!(retried.last_error, None);
}

#[tokio::test]
async fn test_non_master_never_applies_responses() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("blotter.db");
    let inbound = dir.path().join("inbound");
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));

    let master = Desk::join(&db, "alice", &clock).await;
    let other = Desk::join(&db, "bob", &clock).await;
    master.store.set_priority("alice", 1).await.unwrap();
    master.store.set_priority("bob", 2).await.unwrap();
    master.beat(&clock).await;
    other.beat(&clock).await;
    assert_eq!(master.coordinator.tick().await, TickOutcome::Acquired);
    other.coordinator.tick().await;

    let link = master
        .store
        .insert_link(&NewLink::new(7, SystemCode::Rtns))
        .await
        .unwrap();
    master.machine.mark_pending(link.link_id).await.unwrap();

    let err = other
        .machine
        .apply_response(
            7,
            SystemCode::Rtns,
            &blotter_booking::ResponseOutcome::Success {
                external_trade_id: "R-7".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::NotLeader));

    // A stray ingestor on the non-master leaves the file for the master
    let stray = other.ingestor(&inbound).await;
    let file = response(
        &inbound,
        "rtns-7.json",
        r#"{"trade_id":7,"system_code":"RTNS","outcome":"success","external_trade_id":"R-7"}"#,
    );
    assert_eq!(stray.process_file(&file).await, FileDisposition::Deferred);
    assert!(file.exists());

    let ingestor = master.ingestor(&inbound).await;
    let summary = ingestor.catch_up().await.unwrap();
    assert_eq!(summary.archived, 1);
    assert!(!file.exists());

    let booked = master.store.get_link(link.link_id).await.unwrap().unwrap();
    assert_eq!(booked.status, LinkStatus::Booked);
    assert_eq!(booked.external_trade_id.as_deref(), Some("R-7"));
}

#[tokio::test]
async fn test_unknown_trade_response_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("blotter.db");
    let inbound = dir.path().join("inbound");
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));

    let master = Desk::join(&db, "alice", &clock).await;
    master.store.set_priority("alice", 1).await.unwrap();
    master.beat(&clock).await;
    assert_eq!(master.coordinator.tick().await, TickOutcome::Acquired);

    let ingestor = master.ingestor(&inbound).await;
    let file = response(
        &inbound,
        "mx3-999.json",
        r#"{"trade_id":999,"system_code":"MX3","outcome":"success","external_trade_id":"X"}"#,
    );
    assert_eq!(ingestor.process_file(&file).await, FileDisposition::Quarantined);

    let quarantined = std::fs::read_dir(&ingestor.settings().quarantine_dir)
        .unwrap()
        .count();
    assert_eq!(quarantined, 1);

    let events = master.store.list_for_trade(999).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, WorkflowEventType::ResponseQuarantined);
}
