use async_trait::async_trait;
use blotter_types::{
    LeaseRecord, LinkStatus, LinkUpdate, NewLink, NewWorkflowEvent, NodeIdentity, PresenceRecord,
    PriorityEntry, SystemCode, TradeSystemLink, WorkflowEvent,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::store::{LeaseStore, LinkStore, PresenceStore, PriorityStore, WorkflowEventLog};
use crate::StoreError;

// ═══════════════════════════════════════════════════════════════════════════
// IN-MEMORY STORE (for testing and simulation)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct State {
    presence: HashMap<String, PresenceRecord>,
    priority: HashMap<String, i32>,
    leases: HashMap<String, LeaseRecord>,
    links: BTreeMap<i64, TradeSystemLink>,
    next_link_id: i64,
    events: Vec<WorkflowEvent>,
}

/// Shared-database stand-in. Each operation runs under one mutex, which gives
/// the same per-statement atomicity the SQL store relies on.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the database being unreachable (for testing)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Force the stored lease row (for testing crash/restart scenarios)
    pub fn put_lease(&self, lease: LeaseRecord) {
        self.lock().leases.insert(lease.lock_name.clone(), lease);
    }

    /// Force a link status, bypassing transition guards (for testing)
    pub fn put_link_status(&self, link_id: i64, status: LinkStatus) {
        if let Some(link) = self.lock().links.get_mut(&link_id) {
            link.status = status;
        }
    }

    /// Number of audit events recorded (for testing)
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionError(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(self.lock())
    }
}

#[async_trait]
impl PresenceStore for InMemoryStore {
    async fn record_heartbeat(
        &self,
        identity: &NodeIdentity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.check()?;
        state.presence.insert(
            identity.user_name.clone(),
            PresenceRecord {
                node_id: identity.node_id.clone(),
                user_name: identity.user_name.clone(),
                machine_name: identity.machine_name.clone(),
                last_seen_utc: now,
            },
        );
        Ok(())
    }

    async fn list_online_users(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.check()?;
        let mut users: Vec<String> = state
            .presence
            .values()
            .filter(|p| p.is_online(now, ttl))
            .map(|p| p.user_name.clone())
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        let state = self.check()?;
        let mut rows: Vec<_> = state.presence.values().cloned().collect();
        rows.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        Ok(rows)
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn try_acquire_lease(
        &self,
        lock_name: &str,
        candidate: &NodeIdentity,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.check()?;
        let granted = LeaseRecord {
            lock_name: lock_name.to_string(),
            held_by_user: candidate.user_name.clone(),
            held_by_machine: candidate.machine_name.clone(),
            last_heartbeat_utc: now,
            expires_at_utc: now + ttl,
        };

        let take = match state.leases.get(lock_name) {
            None => true,
            Some(lease) => lease.expires_at_utc < now || lease.is_held_by(candidate),
        };
        if take {
            state.leases.insert(lock_name.to_string(), granted);
        }
        Ok(take)
    }

    async fn get_current_master(
        &self,
        lock_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, StoreError> {
        let state = self.check()?;
        Ok(state
            .leases
            .get(lock_name)
            .filter(|lease| lease.is_valid(now))
            .cloned())
    }

    async fn get_lease(&self, lock_name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(self.check()?.leases.get(lock_name).cloned())
    }

    async fn release_lease(
        &self,
        lock_name: &str,
        holder: &NodeIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.check()?;
        match state.leases.get_mut(lock_name) {
            Some(lease) if lease.is_held_by(holder) => {
                lease.expires_at_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl PriorityStore for InMemoryStore {
    async fn load_priority_list(&self) -> Result<Vec<PriorityEntry>, StoreError> {
        let state = self.check()?;
        let mut entries: Vec<PriorityEntry> = state
            .priority
            .iter()
            .map(|(user, order)| PriorityEntry::new(user.clone(), *order))
            .collect();
        entries.sort_by(|a, b| {
            a.order_no
                .cmp(&b.order_no)
                .then_with(|| a.user_name.cmp(&b.user_name))
        });
        Ok(entries)
    }

    async fn set_priority(&self, user_name: &str, order_no: i32) -> Result<(), StoreError> {
        self.check()?.priority.insert(user_name.to_string(), order_no);
        Ok(())
    }

    async fn remove_priority(&self, user_name: &str) -> Result<bool, StoreError> {
        Ok(self.check()?.priority.remove(user_name).is_some())
    }
}

#[async_trait]
impl LinkStore for InMemoryStore {
    async fn insert_link(&self, link: &NewLink) -> Result<TradeSystemLink, StoreError> {
        let mut state = self.check()?;
        let duplicate = state.links.values().any(|l| {
            !l.is_deleted && l.trade_id == link.trade_id && l.system_code == link.system_code
        });
        if duplicate {
            return Err(StoreError::DuplicateLink {
                trade_id: link.trade_id,
                system_code: link.system_code,
            });
        }

        state.next_link_id += 1;
        let record = TradeSystemLink {
            link_id: state.next_link_id,
            trade_id: link.trade_id,
            system_code: link.system_code,
            status: LinkStatus::New,
            external_trade_id: None,
            last_status_utc: None,
            last_error: None,
            book_flag: link.book_flag,
            stp_mode: link.stp_mode.clone(),
            booked_by: None,
            first_booked_utc: None,
            last_booked_utc: None,
            is_deleted: false,
        };
        state.links.insert(record.link_id, record.clone());
        Ok(record)
    }

    async fn get_link(&self, link_id: i64) -> Result<Option<TradeSystemLink>, StoreError> {
        Ok(self.check()?.links.get(&link_id).cloned())
    }

    async fn find_link(
        &self,
        trade_id: i64,
        system_code: SystemCode,
    ) -> Result<Option<TradeSystemLink>, StoreError> {
        let state = self.check()?;
        Ok(state
            .links
            .values()
            .find(|l| !l.is_deleted && l.trade_id == trade_id && l.system_code == system_code)
            .cloned())
    }

    async fn list_links_for_trade(
        &self,
        trade_id: i64,
    ) -> Result<Vec<TradeSystemLink>, StoreError> {
        let state = self.check()?;
        Ok(state
            .links
            .values()
            .filter(|l| !l.is_deleted && l.trade_id == trade_id)
            .cloned()
            .collect())
    }

    async fn list_links_by_status(
        &self,
        statuses: &[LinkStatus],
        systems: &[SystemCode],
    ) -> Result<Vec<TradeSystemLink>, StoreError> {
        let state = self.check()?;
        Ok(state
            .links
            .values()
            .filter(|l| {
                !l.is_deleted
                    && statuses.contains(&l.status)
                    && (systems.is_empty() || systems.contains(&l.system_code))
            })
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        link_id: i64,
        from: &[LinkStatus],
        update: &LinkUpdate,
    ) -> Result<bool, StoreError> {
        let mut state = self.check()?;
        match state.links.get_mut(&link_id) {
            Some(link) if !link.is_deleted && from.contains(&link.status) => {
                update.apply(link);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_deleted(&self, link_id: i64) -> Result<bool, StoreError> {
        let mut state = self.check()?;
        match state.links.get_mut(&link_id) {
            Some(link) if !link.is_deleted => {
                link.is_deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl WorkflowEventLog for InMemoryStore {
    async fn append(&self, event: &NewWorkflowEvent) -> Result<i64, StoreError> {
        let mut state = self.check()?;
        let event_id = state.events.len() as i64 + 1;
        state.events.push(WorkflowEvent {
            event_id,
            trade_id: event.trade_id,
            timestamp_utc: event.timestamp_utc,
            event_type: event.event_type,
            system_code: event.system_code,
            user_id: event.user_id.clone(),
            details: event.details.clone(),
        });
        Ok(event_id)
    }

    async fn list_for_trade(&self, trade_id: i64) -> Result<Vec<WorkflowEvent>, StoreError> {
        let state = self.check()?;
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.trade_id == Some(trade_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.timestamp_utc, e.event_id));
        Ok(events)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<WorkflowEvent>, StoreError> {
        let state = self.check()?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| std::cmp::Reverse((e.timestamp_utc, e.event_id)));
        events.truncate(limit);
        Ok(events)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use blotter_types::{ErrorText, WorkflowEventType};
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn node(user: &str) -> NodeIdentity {
        NodeIdentity::new(format!("node-{user}"), user, format!("{user}-pc"))
    }

    #[tokio::test]
    async fn test_presence_online_window() {
        let store = InMemoryStore::new();
        store.record_heartbeat(&node("A"), at(0)).await.unwrap();
        store.record_heartbeat(&node("B"), at(20)).await.unwrap();

        let online = store
            .list_online_users(at(35), Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(online, vec!["B".to_string()]);

        // A heartbeat is an upsert, not a second row
        store.record_heartbeat(&node("A"), at(34)).await.unwrap();
        assert_eq!(store.list_presence().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_lease_blocks_other_candidate() {
        let store = InMemoryStore::new();
        let ttl = Duration::seconds(30);

        assert!(store.try_acquire_lease("L", &node("A"), at(0), ttl).await.unwrap());
        assert!(!store.try_acquire_lease("L", &node("B"), at(10), ttl).await.unwrap());

        // Holder renews
        assert!(store.try_acquire_lease("L", &node("A"), at(10), ttl).await.unwrap());
        let master = store.get_current_master("L", at(39)).await.unwrap().unwrap();
        assert_eq!(master.held_by_user, "A");
        assert_eq!(master.expires_at_utc, at(40));
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let store = InMemoryStore::new();
        let ttl = Duration::seconds(30);

        store.try_acquire_lease("L", &node("A"), at(0), ttl).await.unwrap();
        assert!(!store.try_acquire_lease("L", &node("B"), at(30), ttl).await.unwrap());
        assert!(store.try_acquire_lease("L", &node("B"), at(31), ttl).await.unwrap());

        let master = store.get_current_master("L", at(31)).await.unwrap().unwrap();
        assert_eq!(master.held_by_user, "B");
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let store = Arc::new(InMemoryStore::new());
        let ttl = Duration::seconds(30);

        let attempts = ["A", "B", "C", "D"].map(|user| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .try_acquire_lease("L", &node(user), at(100), ttl)
                    .await
                    .unwrap()
            })
        });

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let store = InMemoryStore::new();
        let ttl = Duration::seconds(30);
        store.try_acquire_lease("L", &node("A"), at(0), ttl).await.unwrap();

        assert!(!store.release_lease("L", &node("B"), at(5)).await.unwrap());
        assert!(store.release_lease("L", &node("A"), at(5)).await.unwrap());
        assert!(store.get_current_master("L", at(5)).await.unwrap().is_none());
        assert!(store.try_acquire_lease("L", &node("B"), at(6), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let store = InMemoryStore::new();
        store.set_priority("C", 3).await.unwrap();
        store.set_priority("A", 1).await.unwrap();
        store.set_priority("B", 2).await.unwrap();

        let users: Vec<_> = store
            .load_priority_list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.user_name)
            .collect();
        assert_eq!(users, vec!["A", "B", "C"]);

        assert!(store.remove_priority("B").await.unwrap());
        assert!(!store.remove_priority("B").await.unwrap());
    }

    #[tokio::test]
    async fn test_single_live_link_per_trade_and_system() {
        let store = InMemoryStore::new();
        let link = store
            .insert_link(&NewLink::new(42, SystemCode::Mx3))
            .await
            .unwrap();
        assert_eq!(link.status, LinkStatus::New);

        let dup = store.insert_link(&NewLink::new(42, SystemCode::Mx3)).await;
        assert!(matches!(dup, Err(StoreError::DuplicateLink { .. })));

        // Another system on the same trade is fine
        store
            .insert_link(&NewLink::new(42, SystemCode::Calypso))
            .await
            .unwrap();

        // After a soft delete the pair may be linked again
        assert!(store.mark_deleted(link.link_id).await.unwrap());
        store
            .insert_link(&NewLink::new(42, SystemCode::Mx3))
            .await
            .unwrap();
        assert_eq!(store.list_links_for_trade(42).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_guarded_transition() {
        let store = InMemoryStore::new();
        let link = store
            .insert_link(&NewLink::new(7, SystemCode::Rtns))
            .await
            .unwrap();

        let to_pending = LinkUpdate::to(LinkStatus::Pending, at(1)).with_booked_by("alice");
        assert!(store
            .transition(link.link_id, &LinkStatus::BOOKABLE, &to_pending)
            .await
            .unwrap());
        assert!(!store
            .transition(link.link_id, &LinkStatus::BOOKABLE, &to_pending)
            .await
            .unwrap());

        let to_error = LinkUpdate::to(LinkStatus::Error, at(2))
            .with_error(ErrorText::Set("rejected by RTNS".to_string()));
        assert!(store
            .transition(link.link_id, &[LinkStatus::Pending], &to_error)
            .await
            .unwrap());

        let stored = store.get_link(link.link_id).await.unwrap().unwrap();
        assert_eq!(stored.status, LinkStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("rejected by RTNS"));
        assert_eq!(stored.booked_by.as_deref(), Some("alice"));

        let pending = store
            .list_links_by_status(&[LinkStatus::Pending], &[])
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_events_ordered_per_trade() {
        let store = InMemoryStore::new();
        store
            .append(&NewWorkflowEvent::for_trade(1, WorkflowEventType::Booked, "u", at(5)))
            .await
            .unwrap();
        store
            .append(&NewWorkflowEvent::for_trade(
                1,
                WorkflowEventType::BookingRequested,
                "u",
                at(1),
            ))
            .await
            .unwrap();
        store
            .append(&NewWorkflowEvent::for_node(
                WorkflowEventType::MastershipAcquired,
                "u",
                at(3),
            ))
            .await
            .unwrap();

        let events = store.list_for_trade(1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, WorkflowEventType::BookingRequested);
        assert_eq!(events[1].event_type, WorkflowEventType::Booked);

        let recent = store.list_recent(1).await.unwrap();
        assert_eq!(recent[0].event_type, WorkflowEventType::Booked);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let result = store.list_online_users(at(0), Duration::seconds(30)).await;
        assert!(matches!(result, Err(StoreError::ConnectionError(_))));

        store.set_unavailable(false);
        assert!(store.list_online_users(at(0), Duration::seconds(30)).await.is_ok());
    }
}
