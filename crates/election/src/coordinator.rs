use blotter_metrics::MetricsCollector;
use blotter_store::{CoordinationStore, StoreError};
use blotter_types::{
    preferred_candidate, Clock, NewWorkflowEvent, NodeIdentity, WorkflowEventType,
    MASTER_LOCK_NAME,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{LeaseLeadership, MastershipHandle};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ElectionSettings {
    pub lock_name: String,

    /// Lifetime written by each successful acquire or renewal
    pub lease_ttl: chrono::Duration,

    /// How long a heartbeat keeps a user online
    pub presence_ttl: chrono::Duration,

    pub tick_interval: Duration,

    /// Failed ticks in a row before a master demotes itself
    pub max_consecutive_failures: u32,

    /// Expire our lease on graceful shutdown
    pub release_on_shutdown: bool,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            lock_name: MASTER_LOCK_NAME.to_string(),
            lease_ttl: chrono::Duration::seconds(30),
            presence_ttl: chrono::Duration::seconds(30),
            tick_interval: Duration::from_secs(10),
            max_consecutive_failures: 2,
            release_on_shutdown: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TICK OUTCOME
// ═══════════════════════════════════════════════════════════════════════════

/// What one election tick decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No priority entry has an online user
    NoCandidate,
    /// Someone else is preferred; we did not contend
    Deferred { preferred: String },
    /// We were not master and now hold the lease
    Acquired,
    /// We were master and renewed the lease
    Renewed,
    /// We are preferred but another holder's lease is still valid
    LeaseBusy,
    /// The store could not be read or written
    Unknown { reason: String },
}

impl TickOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::NoCandidate => "no_candidate",
            TickOutcome::Deferred { .. } => "deferred",
            TickOutcome::Acquired => "acquired",
            TickOutcome::Renewed => "renewed",
            TickOutcome::LeaseBusy => "lease_busy",
            TickOutcome::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Default)]
struct TickState {
    consecutive_failures: u32,
    /// Expiry of the lease we last confirmed holding
    lease_expires_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Owns this instance's mastership flag and publishes every change on a
/// watch channel. Only the coordinator writes the flag.
pub struct ElectionCoordinator<S> {
    store: Arc<S>,
    identity: NodeIdentity,
    settings: ElectionSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<TickState>,
    mastership: watch::Sender<bool>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<S: CoordinationStore + 'static> ElectionCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        identity: NodeIdentity,
        settings: ElectionSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (mastership, _) = watch::channel(false);
        Self {
            store,
            identity,
            settings,
            clock,
            state: Mutex::new(TickState::default()),
            mastership,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &ElectionSettings {
        &self.settings
    }

    /// What this instance currently believes
    pub fn is_master(&self) -> bool {
        *self.mastership.borrow()
    }

    /// `MastershipChanged` feed; the current value is visible immediately
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.mastership.subscribe()
    }

    pub fn handle(&self) -> MastershipHandle {
        MastershipHandle::new(self.subscribe())
    }

    /// Store-confirmed gate for leader-only side effects
    pub fn leadership(&self) -> LeaseLeadership<S> {
        LeaseLeadership::new(
            self.store.clone(),
            self.identity.clone(),
            self.settings.lock_name.clone(),
            self.clock.clone(),
            self.subscribe(),
        )
    }

    /// Run one election round
    pub async fn tick(&self) -> TickOutcome {
        let now = self.clock.now();
        let outcome = self.decide(now).await;

        debug!(
            node = %self.identity,
            outcome = outcome.label(),
            is_master = self.is_master(),
            "Election tick"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_election_tick(outcome.label());
        }
        outcome
    }

    async fn decide(&self, now: DateTime<Utc>) -> TickOutcome {
        let online = match self
            .store
            .list_online_users(now, self.settings.presence_ttl)
            .await
        {
            Ok(online) => online,
            Err(e) => return self.on_store_error(now, e).await,
        };
        let priority = match self.store.load_priority_list().await {
            Ok(priority) => priority,
            Err(e) => return self.on_store_error(now, e).await,
        };

        let preferred = preferred_candidate(&priority, &online).map(str::to_string);
        match preferred {
            None => {
                // Nobody to elect; a master keeps its role only while its lease lasts
                self.state().consecutive_failures = 0;
                self.demote_if_lease_lapsed(now, "no online candidate").await;
                TickOutcome::NoCandidate
            }
            Some(preferred) if preferred != self.identity.user_name => {
                {
                    let mut state = self.state();
                    state.consecutive_failures = 0;
                    state.lease_expires_at = None;
                }
                if self.is_master() {
                    info!(node = %self.identity, %preferred, "Relinquishing mastership to preferred candidate");
                    self.set_master(false, now).await;
                }
                TickOutcome::Deferred { preferred }
            }
            Some(_) => self.contend(now).await,
        }
    }

    async fn contend(&self, now: DateTime<Utc>) -> TickOutcome {
        let started = Instant::now();
        let acquired = self
            .store
            .try_acquire_lease(&self.settings.lock_name, &self.identity, now, self.settings.lease_ttl)
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.record_lease_cas(started.elapsed());
        }

        match acquired {
            Ok(true) => self.confirm_acquired(now).await,
            Ok(false) => {
                {
                    let mut state = self.state();
                    state.consecutive_failures = 0;
                    state.lease_expires_at = None;
                }
                if self.is_master() {
                    warn!(node = %self.identity, "Lease renewal refused; stepping down");
                    self.set_master(false, now).await;
                }
                TickOutcome::LeaseBusy
            }
            Err(e) => self.on_store_error(now, e).await,
        }
    }

    /// Reread the lease after a successful write before claiming it
    async fn confirm_acquired(&self, now: DateTime<Utc>) -> TickOutcome {
        let current = match self
            .store
            .get_current_master(&self.settings.lock_name, now)
            .await
        {
            Ok(current) => current,
            Err(e) => return self.on_store_error(now, e).await,
        };

        match current {
            Some(lease) if lease.is_held_by(&self.identity) => {
                {
                    let mut state = self.state();
                    state.consecutive_failures = 0;
                    state.lease_expires_at = Some(lease.expires_at_utc);
                }
                if self.set_master(true, now).await {
                    TickOutcome::Acquired
                } else {
                    TickOutcome::Renewed
                }
            }
            other => {
                warn!(
                    node = %self.identity,
                    holder = ?other.map(|l| format!("{}@{}", l.held_by_user, l.held_by_machine)),
                    "Lease write succeeded but reconfirmation did not"
                );
                self.state().lease_expires_at = None;
                if self.is_master() {
                    self.set_master(false, now).await;
                }
                TickOutcome::LeaseBusy
            }
        }
    }

    /// Store trouble never grants or extends mastership
    async fn on_store_error(&self, now: DateTime<Utc>, err: StoreError) -> TickOutcome {
        let (failures, lease_lapsed) = {
            let mut state = self.state();
            state.consecutive_failures += 1;
            let lapsed = state.lease_expires_at.map_or(true, |expires| now >= expires);
            (state.consecutive_failures, lapsed)
        };

        warn!(
            node = %self.identity,
            error = %err,
            consecutive_failures = failures,
            "Election tick could not reach the store"
        );

        if self.is_master()
            && (failures >= self.settings.max_consecutive_failures || lease_lapsed)
        {
            error!(
                node = %self.identity,
                consecutive_failures = failures,
                "Demoting after sustained store failure"
            );
            self.state().lease_expires_at = None;
            self.set_master(false, now).await;
        }

        TickOutcome::Unknown {
            reason: err.to_string(),
        }
    }

    async fn demote_if_lease_lapsed(&self, now: DateTime<Utc>, why: &str) {
        let lapsed = self
            .state()
            .lease_expires_at
            .map_or(true, |expires| now >= expires);
        if self.is_master() && lapsed {
            info!(node = %self.identity, reason = why, "Lease lapsed; stepping down");
            self.state().lease_expires_at = None;
            self.set_master(false, now).await;
        }
    }

    /// Flip the flag; returns whether it changed
    async fn set_master(&self, is_master: bool, now: DateTime<Utc>) -> bool {
        let changed = self.mastership.send_if_modified(|current| {
            if *current == is_master {
                false
            } else {
                *current = is_master;
                true
            }
        });
        if !changed {
            return false;
        }

        if is_master {
            info!(node = %self.identity, lock = %self.settings.lock_name, "Became master");
        } else {
            info!(node = %self.identity, lock = %self.settings.lock_name, "No longer master");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_mastership(is_master);
        }

        let event_type = if is_master {
            WorkflowEventType::MastershipAcquired
        } else {
            WorkflowEventType::MastershipLost
        };
        let event = NewWorkflowEvent::for_node(event_type, &self.identity.user_name, now)
            .with_details(format!("{} on {}", self.identity, self.settings.lock_name));
        if let Err(e) = self.store.append(&event).await {
            warn!(error = %e, event = %event_type, "Failed to record mastership event");
        }

        true
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TickState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tick on the configured cadence until `shutdown` flips to true, then
    /// step down and release the lease
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            node = %self.identity,
            lock = %self.settings.lock_name,
            interval = ?self.settings.tick_interval,
            "Election loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!(node = %self.identity, "Election loop stopped");
    }

    /// Step down locally, then expire our lease if configured to
    pub async fn shutdown(&self) {
        let now = self.clock.now();
        self.state().lease_expires_at = None;
        self.set_master(false, now).await;

        if !self.settings.release_on_shutdown {
            return;
        }
        match self
            .store
            .release_lease(&self.settings.lock_name, &self.identity, now)
            .await
        {
            Ok(true) => info!(node = %self.identity, "Released master lease"),
            Ok(false) => debug!(node = %self.identity, "No lease of ours to release"),
            Err(e) => warn!(node = %self.identity, error = %e, "Lease release failed; it will expire"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use blotter_store::{InMemoryStore, LeaseStore, PresenceStore, PriorityStore, WorkflowEventLog};
    use blotter_types::{Leadership, ManualClock};

    struct Desk {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Desk {
        async fn new(priority: &[(&str, i32)]) -> Self {
            let store = Arc::new(InMemoryStore::new());
            for (user, order) in priority {
                store.set_priority(user, *order).await.unwrap();
            }
            Self {
                store,
                clock: Arc::new(ManualClock::at_millis(1_700_000_000_000)),
            }
        }

        fn identity(user: &str) -> NodeIdentity {
            NodeIdentity::new(format!("node-{user}"), user, format!("{user}-desk"))
        }

        fn node(&self, user: &str) -> ElectionCoordinator<InMemoryStore> {
            ElectionCoordinator::new(
                self.store.clone(),
                Self::identity(user),
                ElectionSettings::default(),
                self.clock.clone(),
            )
        }

        async fn heartbeat(&self, users: &[&str]) {
            for user in users {
                self.store
                    .record_heartbeat(&Self::identity(user), self.clock.now())
                    .await
                    .unwrap();
            }
        }

        fn advance(&self, secs: i64) {
            self.clock.advance(chrono::Duration::seconds(secs));
        }
    }

    #[tokio::test]
    async fn test_lowest_online_priority_becomes_sole_master() {
        let desk = Desk::new(&[("A", 1), ("B", 2), ("C", 3)]).await;
        let b = desk.node("B");
        let c = desk.node("C");
        desk.heartbeat(&["B", "C"]).await;

        assert_eq!(c.tick().await, TickOutcome::Deferred { preferred: "B".to_string() });
        assert_eq!(b.tick().await, TickOutcome::Acquired);

        for _ in 0..3 {
            desk.advance(10);
            desk.heartbeat(&["B", "C"]).await;
            assert_eq!(b.tick().await, TickOutcome::Renewed);
            assert!(matches!(c.tick().await, TickOutcome::Deferred { .. }));
        }

        assert!(b.is_master());
        assert!(!c.is_master());
    }

    #[tokio::test]
    async fn test_no_candidate_does_nothing() {
        let desk = Desk::new(&[("A", 1)]).await;
        let b = desk.node("B");
        desk.heartbeat(&["B"]).await;

        assert_eq!(b.tick().await, TickOutcome::NoCandidate);
        assert!(!b.is_master());
        assert!(desk.store.get_lease(MASTER_LOCK_NAME).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fresh_lease_blocks_preferred_candidate() {
        let desk = Desk::new(&[("A", 1), ("B", 2)]).await;
        let a = desk.node("A");
        let b = desk.node("B");

        desk.heartbeat(&["A", "B"]).await;
        assert_eq!(a.tick().await, TickOutcome::Acquired);

        // A goes silent; once its presence lapses B is preferred but the lease still stands
        desk.advance(29);
        desk.heartbeat(&["B"]).await;
        assert!(matches!(b.tick().await, TickOutcome::Deferred { .. }));

        desk.advance(1);
        desk.heartbeat(&["B"]).await;
        assert_eq!(b.tick().await, TickOutcome::LeaseBusy);
        assert!(!b.is_master());
    }

    #[tokio::test]
    async fn test_failover_waits_for_lease_expiry() {
        let desk = Desk::new(&[("A", 1), ("B", 2)]).await;
        let a = desk.node("A");
        let b = desk.node("B");

        desk.heartbeat(&["A", "B"]).await;
        assert_eq!(a.tick().await, TickOutcome::Acquired);
        let expires = desk
            .store
            .get_lease(MASTER_LOCK_NAME)
            .await
            .unwrap()
            .unwrap()
            .expires_at_utc;

        // A crashes. B keeps ticking every ten seconds.
        let mut acquired_at = None;
        for _ in 0..6 {
            desk.advance(10);
            desk.heartbeat(&["B"]).await;
            if b.tick().await == TickOutcome::Acquired {
                acquired_at = Some(desk.clock.now());
                break;
            }
        }

        let acquired_at = acquired_at.expect("B never acquired");
        assert!(acquired_at > expires);
        assert!(acquired_at - expires <= chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_master_relinquishes_to_preferred_candidate() {
        let desk = Desk::new(&[("A", 1), ("B", 2)]).await;
        let a = desk.node("A");
        let b = desk.node("B");

        desk.heartbeat(&["B"]).await;
        assert_eq!(b.tick().await, TickOutcome::Acquired);
        let mut rx = b.subscribe();
        assert!(*rx.borrow_and_update());

        desk.advance(5);
        desk.heartbeat(&["A", "B"]).await;
        assert_eq!(b.tick().await, TickOutcome::Deferred { preferred: "A".to_string() });
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());

        // A must wait for B's lease to lapse
        assert_eq!(a.tick().await, TickOutcome::LeaseBusy);
        desk.advance(31);
        desk.heartbeat(&["A", "B"]).await;
        assert_eq!(a.tick().await, TickOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_store_errors_never_grant_mastership() {
        let desk = Desk::new(&[("A", 1)]).await;
        let a = desk.node("A");
        desk.heartbeat(&["A"]).await;

        desk.store.set_unavailable(true);
        assert!(matches!(a.tick().await, TickOutcome::Unknown { .. }));
        assert!(!a.is_master());
    }

    #[tokio::test]
    async fn test_sustained_store_failure_demotes_master() {
        let desk = Desk::new(&[("A", 1)]).await;
        let a = desk.node("A");
        desk.heartbeat(&["A"]).await;
        assert_eq!(a.tick().await, TickOutcome::Acquired);

        desk.store.set_unavailable(true);
        desk.advance(10);
        assert!(matches!(a.tick().await, TickOutcome::Unknown { .. }));
        assert!(a.is_master(), "a single failed tick inside the lease keeps mastership");

        desk.advance(10);
        assert!(matches!(a.tick().await, TickOutcome::Unknown { .. }));
        assert!(!a.is_master());
    }

    #[tokio::test]
    async fn test_store_failure_after_expiry_demotes_immediately() {
        let desk = Desk::new(&[("A", 1)]).await;
        let settings = ElectionSettings {
            max_consecutive_failures: 10,
            ..Default::default()
        };
        let a = ElectionCoordinator::new(
            desk.store.clone(),
            Desk::identity("A"),
            settings,
            desk.clock.clone(),
        );
        desk.heartbeat(&["A"]).await;
        assert_eq!(a.tick().await, TickOutcome::Acquired);

        desk.store.set_unavailable(true);
        desk.advance(30);
        a.tick().await;
        assert!(!a.is_master());
    }

    #[tokio::test]
    async fn test_mastership_events_recorded() {
        let desk = Desk::new(&[("A", 1)]).await;
        let a = desk.node("A");
        desk.heartbeat(&["A"]).await;

        a.tick().await;
        a.shutdown().await;

        let events = desk.store.list_recent(10).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&WorkflowEventType::MastershipAcquired));
        assert!(kinds.contains(&WorkflowEventType::MastershipLost));
        assert!(events.iter().all(|e| e.trade_id.is_none()));
    }

    #[tokio::test]
    async fn test_shutdown_releases_lease() {
        let desk = Desk::new(&[("A", 1), ("B", 2)]).await;
        let a = desk.node("A");
        let b = desk.node("B");
        desk.heartbeat(&["A", "B"]).await;
        assert_eq!(a.tick().await, TickOutcome::Acquired);

        a.shutdown().await;
        assert!(!a.is_master());
        assert!(desk
            .store
            .get_current_master(MASTER_LOCK_NAME, desk.clock.now())
            .await
            .unwrap()
            .is_none());

        // B takes over as soon as A's presence has lapsed
        desk.advance(31);
        desk.heartbeat(&["B"]).await;
        assert_eq!(b.tick().await, TickOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_leadership_confirms_against_store() {
        let desk = Desk::new(&[("A", 1)]).await;
        let a = desk.node("A");
        let leadership = a.leadership();
        assert!(!leadership.confirm().await);

        desk.heartbeat(&["A"]).await;
        a.tick().await;
        assert!(leadership.confirm().await);

        // Lease taken over behind our back: the cached flag is not enough
        desk.store.put_lease(blotter_types::LeaseRecord {
            lock_name: MASTER_LOCK_NAME.to_string(),
            held_by_user: "Z".to_string(),
            held_by_machine: "Z-desk".to_string(),
            last_heartbeat_utc: desk.clock.now(),
            expires_at_utc: desk.clock.now() + chrono::Duration::seconds(30),
        });
        assert!(a.is_master());
        assert!(!leadership.confirm().await);
    }

    #[tokio::test]
    async fn test_run_loop_acquires_and_releases() {
        let desk = Desk::new(&[("A", 1)]).await;
        let settings = ElectionSettings {
            tick_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let a = Arc::new(ElectionCoordinator::new(
            desk.store.clone(),
            Desk::identity("A"),
            settings,
            desk.clock.clone(),
        ));
        desk.heartbeat(&["A"]).await;

        let mut rx = a.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(a.clone().run(stop_rx));

        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|m| *m))
            .await
            .expect("never became master")
            .unwrap();

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!a.is_master());
        assert!(desk
            .store
            .get_current_master(MASTER_LOCK_NAME, desk.clock.now())
            .await
            .unwrap()
            .is_none());
    }
}
