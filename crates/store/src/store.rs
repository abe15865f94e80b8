use async_trait::async_trait;
use blotter_types::{
    LeaseRecord, LinkStatus, LinkUpdate, NewLink, NewWorkflowEvent, NodeIdentity, PresenceRecord,
    PriorityEntry, SystemCode, TradeSystemLink, WorkflowEvent,
};
use chrono::{DateTime, Duration, Utc};

use crate::StoreError;

// ═══════════════════════════════════════════════════════════════════════════
// PRESENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Durable heartbeat table; one live row per user
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Idempotent upsert setting `last_seen_utc = now`
    async fn record_heartbeat(
        &self,
        identity: &NodeIdentity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Distinct user names seen within `ttl` of `now`
    async fn list_online_users(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<String>, StoreError>;

    /// Every presence row, online or not
    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, StoreError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// LEASE
// ═══════════════════════════════════════════════════════════════════════════

/// Single-row-per-lock-name lease arbitrated by compare-and-swap
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// One conditional write: take the lease if it has expired or is already
    /// held by `candidate`. Returns whether a row was affected.
    async fn try_acquire_lease(
        &self,
        lock_name: &str,
        candidate: &NodeIdentity,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// The holder whose lease is still valid at `now`
    async fn get_current_master(
        &self,
        lock_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, StoreError>;

    /// The raw lease row, expired or not
    async fn get_lease(&self, lock_name: &str) -> Result<Option<LeaseRecord>, StoreError>;

    /// Expire the lease immediately, but only if `holder` owns it
    async fn release_lease(
        &self,
        lock_name: &str,
        holder: &NodeIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// PRIORITY
// ═══════════════════════════════════════════════════════════════════════════

/// Externally configured candidate preference
#[async_trait]
pub trait PriorityStore: Send + Sync {
    /// Entries ordered by ascending order number, then user name
    async fn load_priority_list(&self) -> Result<Vec<PriorityEntry>, StoreError>;

    async fn set_priority(&self, user_name: &str, order_no: i32) -> Result<(), StoreError>;

    async fn remove_priority(&self, user_name: &str) -> Result<bool, StoreError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// TRADE SYSTEM LINKS
// ═══════════════════════════════════════════════════════════════════════════

/// Trade-to-booking-system links and their guarded status transitions
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Create a NEW link; at most one live link per (trade, system)
    async fn insert_link(&self, link: &NewLink) -> Result<TradeSystemLink, StoreError>;

    async fn get_link(&self, link_id: i64) -> Result<Option<TradeSystemLink>, StoreError>;

    /// The live (non-deleted) link for a trade on one system
    async fn find_link(
        &self,
        trade_id: i64,
        system_code: SystemCode,
    ) -> Result<Option<TradeSystemLink>, StoreError>;

    async fn list_links_for_trade(&self, trade_id: i64)
        -> Result<Vec<TradeSystemLink>, StoreError>;

    /// Live links in any of `statuses`; an empty `systems` slice means all systems
    async fn list_links_by_status(
        &self,
        statuses: &[LinkStatus],
        systems: &[SystemCode],
    ) -> Result<Vec<TradeSystemLink>, StoreError>;

    /// Conditional update `WHERE link_id = ? AND status IN (from)`.
    ///
    /// Returns false when no row matched: the link moved on, was deleted, or
    /// never existed. Callers treat that as contention, not failure.
    async fn transition(
        &self,
        link_id: i64,
        from: &[LinkStatus],
        update: &LinkUpdate,
    ) -> Result<bool, StoreError>;

    /// Soft delete; links are never physically removed
    async fn mark_deleted(&self, link_id: i64) -> Result<bool, StoreError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKFLOW EVENTS
// ═══════════════════════════════════════════════════════════════════════════

/// Append-only audit trail; no update or delete exists.
#[async_trait]
pub trait WorkflowEventLog: Send + Sync {
    async fn append(&self, event: &NewWorkflowEvent) -> Result<i64, StoreError>;

    /// Events for one trade ordered by timestamp, then insertion
    async fn list_for_trade(&self, trade_id: i64) -> Result<Vec<WorkflowEvent>, StoreError>;

    /// Most recent events first
    async fn list_recent(&self, limit: usize) -> Result<Vec<WorkflowEvent>, StoreError>;
}

/// Everything one blotter instance needs from the shared database
pub trait CoordinationStore:
    PresenceStore + LeaseStore + PriorityStore + LinkStore + WorkflowEventLog
{
}

impl<T> CoordinationStore for T where
    T: PresenceStore + LeaseStore + PriorityStore + LinkStore + WorkflowEventLog
{
}
