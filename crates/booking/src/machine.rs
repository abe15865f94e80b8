use blotter_metrics::{LinkSpan, MetricsCollector};
use blotter_store::{LinkStore, WorkflowEventLog};
use blotter_types::{
    AckDraft, Clock, ErrorText, Leadership, LinkStatus, LinkUpdate, NewWorkflowEvent, SystemCode,
    TradeSystemLink, WorkflowEventType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn, Instrument};

use crate::{AckTransport, BookingError, TransportError};

// ═══════════════════════════════════════════════════════════════════════════
// RESPONSES
// ═══════════════════════════════════════════════════════════════════════════

/// Result a booking system reported for one trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ResponseOutcome {
    Success { external_trade_id: String },
    Failure { error: String },
}

// ═══════════════════════════════════════════════════════════════════════════
// STATE MACHINE
// ═══════════════════════════════════════════════════════════════════════════

/// Drives trade system links through their booking and acknowledgement
/// statuses.
///
/// Every status change is a guarded update against the shared store; a guard
/// that matches no row surfaces as [`BookingError::Conflict`] and is never
/// retried here. Transitions on one link are serialized within the process.
pub struct BookingStateMachine<S> {
    store: Arc<S>,
    leadership: Arc<dyn Leadership>,
    clock: Arc<dyn Clock>,
    user_id: String,
    metrics: Option<Arc<MetricsCollector>>,
    link_locks: LinkLocks,
}

impl<S: LinkStore + WorkflowEventLog + 'static> BookingStateMachine<S> {
    pub fn new(
        store: Arc<S>,
        leadership: Arc<dyn Leadership>,
        clock: Arc<dyn Clock>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            leadership,
            clock,
            user_id: user_id.into(),
            metrics: None,
            link_locks: LinkLocks::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// NEW or ERROR -> PENDING. Allowed on any instance.
    pub async fn mark_pending(&self, link_id: i64) -> Result<TradeSystemLink, BookingError> {
        let _guard = self.lock_link(link_id).await;
        let link = self.load(link_id).await?;
        let span = LinkSpan::new(link.trade_id, link.system_code).span();

        async {
            let update = LinkUpdate::to(LinkStatus::Pending, self.clock.now())
                .with_error(ErrorText::Clear)
                .with_booked_by(&self.user_id);
            let details = format!("booking requested by {}", self.user_id);
            self.advance(&link, update, details).await
        }
        .instrument(span)
        .await
    }

    /// Apply a booking system's response. Leader only.
    ///
    /// A replayed success refreshes the last-booked timestamp; a replayed
    /// failure with the same text is a no-op.
    pub async fn apply_response(
        &self,
        trade_id: i64,
        system_code: SystemCode,
        outcome: &ResponseOutcome,
    ) -> Result<TradeSystemLink, BookingError> {
        self.require_leader().await?;

        let found = self
            .store
            .find_link(trade_id, system_code)
            .await?
            .ok_or(BookingError::LinkNotFound {
                trade_id,
                system_code,
            })?;
        let _guard = self.lock_link(found.link_id).await;
        let link = self.load(found.link_id).await?;
        let span = LinkSpan::new(trade_id, system_code).span();

        async {
            let now = self.clock.now();
            match outcome {
                ResponseOutcome::Success { external_trade_id } => {
                    if external_trade_id.trim().is_empty() {
                        return Err(BookingError::Validation(
                            "success response without external trade id".to_string(),
                        ));
                    }
                    if link.status == LinkStatus::Booked {
                        if let Some(booked_as) = link
                            .external_trade_id
                            .as_deref()
                            .filter(|id| *id != external_trade_id.as_str())
                        {
                            return Err(BookingError::Validation(format!(
                                "already booked as {booked_as}, response says {external_trade_id}"
                            )));
                        }
                    }
                    let update = LinkUpdate::to(LinkStatus::Booked, now)
                        .with_external_trade_id(external_trade_id)
                        .with_error(ErrorText::Clear)
                        .booked();
                    let details = format!("booked as {external_trade_id}");
                    self.advance(&link, update, details).await
                }
                ResponseOutcome::Failure { error } => {
                    if link.status == LinkStatus::Error
                        && link.last_error.as_deref() == Some(error.as_str())
                    {
                        debug!(link_id = link.link_id, "Duplicate failure response ignored");
                        return Ok(link.clone());
                    }
                    let update = LinkUpdate::to(LinkStatus::Error, now)
                        .with_error(ErrorText::Set(error.clone()));
                    self.advance(&link, update, error.clone()).await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// NEW -> ReadyToAck once core processing has every acknowledgement field.
    ///
    /// Missing data is a validation error and leaves the link untouched.
    pub async fn mark_ready_to_ack(
        &self,
        link_id: i64,
        draft: &AckDraft,
    ) -> Result<TradeSystemLink, BookingError> {
        let _guard = self.lock_link(link_id).await;
        let link = self.load(link_id).await?;

        if !link.system_code.supports_acknowledgement() {
            return Err(BookingError::AcknowledgementUnsupported {
                system_code: link.system_code,
            });
        }
        let missing = draft.missing_fields();
        if !missing.is_empty() {
            return Err(missing_fields_error(&missing));
        }

        let update = LinkUpdate::to(LinkStatus::ReadyToAck, self.clock.now());
        self.advance(&link, update, "acknowledgement data complete".to_string())
            .instrument(LinkSpan::new(link.trade_id, link.system_code).span())
            .await
    }

    /// Transmit the acknowledgement for a ReadyToAck or AckFailed link. Leader only.
    ///
    /// Session failures move the link to AckFailed; a venue rejection moves it
    /// to Rejected; incomplete data is a validation error with no transition.
    pub async fn send_acknowledgement(
        &self,
        link_id: i64,
        draft: &AckDraft,
        transport: &dyn AckTransport,
    ) -> Result<TradeSystemLink, BookingError> {
        self.require_leader().await?;

        let _guard = self.lock_link(link_id).await;
        let link = self.load(link_id).await?;
        let span = LinkSpan::new(link.trade_id, link.system_code).span();

        async {
            if link.status.is_terminal() {
                return Err(BookingError::TerminalState {
                    link_id,
                    status: link.status,
                });
            }
            if !link.status.can_transition_to(LinkStatus::AckSent) {
                return Err(BookingError::InvalidTransition {
                    from: link.status,
                    to: LinkStatus::AckSent,
                });
            }

            let ack = draft
                .build(link.trade_id)
                .map_err(|missing| missing_fields_error(&missing))?;

            let sent = transport.send(&ack).await;
            let now = self.clock.now();
            match sent {
                Ok(()) => {
                    self.record_ack_attempt("sent");
                    let update = LinkUpdate::to(LinkStatus::AckSent, now).with_error(ErrorText::Clear);
                    let details = format!("acknowledged report {}", ack.trade_report_id);
                    self.advance(&link, update, details).await
                }
                Err(TransportError::Session(reason)) => {
                    self.record_ack_attempt("transport_failed");
                    warn!(link_id, %reason, "Acknowledgement transport failed");
                    if link.status == LinkStatus::AckFailed {
                        // Still AckFailed; only the attempt is recorded
                        self.record_event(
                            NewWorkflowEvent::for_trade(
                                link.trade_id,
                                WorkflowEventType::AckFailed,
                                &self.user_id,
                                now,
                            )
                            .with_system(link.system_code)
                            .with_details(reason),
                        )
                        .await;
                        return Ok(link.clone());
                    }
                    let update = LinkUpdate::to(LinkStatus::AckFailed, now)
                        .with_error(ErrorText::Set(reason.clone()));
                    self.advance(&link, update, reason).await
                }
                Err(TransportError::Rejected(reason)) => {
                    self.record_ack_attempt("rejected");
                    let update = LinkUpdate::to(LinkStatus::Rejected, now)
                        .with_error(ErrorText::Set(reason.clone()));
                    self.advance(&link, update, reason).await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Business rejection of a pending acknowledgement. Leader only.
    pub async fn reject(&self, link_id: i64, reason: &str) -> Result<TradeSystemLink, BookingError> {
        self.require_leader().await?;

        let _guard = self.lock_link(link_id).await;
        let link = self.load(link_id).await?;

        let update = LinkUpdate::to(LinkStatus::Rejected, self.clock.now())
            .with_error(ErrorText::Set(reason.to_string()));
        self.advance(&link, update, reason.to_string())
            .instrument(LinkSpan::new(link.trade_id, link.system_code).span())
            .await
    }

    /// Append an event on behalf of this instance's user
    pub async fn record_event(&self, event: NewWorkflowEvent) {
        if let Err(e) = self.store.append(&event).await {
            // The status change already landed; a missing audit row is tolerated
            warn!(error = %e, event = %event.event_type, "Failed to append workflow event");
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    async fn require_leader(&self) -> Result<(), BookingError> {
        if self.leadership.confirm().await {
            Ok(())
        } else {
            Err(BookingError::NotLeader)
        }
    }

    async fn lock_link(&self, link_id: i64) -> LinkGuard<'_> {
        self.link_locks.acquire(link_id).await
    }

    async fn load(&self, link_id: i64) -> Result<TradeSystemLink, BookingError> {
        self.store
            .get_link(link_id)
            .await?
            .filter(|link| !link.is_deleted)
            .ok_or(BookingError::NotFound(link_id))
    }

    /// Guarded write of `update`, then its workflow event
    async fn advance(
        &self,
        link: &TradeSystemLink,
        update: LinkUpdate,
        details: String,
    ) -> Result<TradeSystemLink, BookingError> {
        let target = update.status;
        if link.status.is_terminal() {
            return Err(BookingError::TerminalState {
                link_id: link.link_id,
                status: link.status,
            });
        }
        if !link.status.can_transition_to(target) {
            return Err(BookingError::InvalidTransition {
                from: link.status,
                to: target,
            });
        }

        let from = LinkStatus::predecessors(target);
        if !self.store.transition(link.link_id, &from, &update).await? {
            return Err(self.explain_miss(link, target).await);
        }

        let mut updated = link.clone();
        update.apply(&mut updated);

        info!(
            link_id = link.link_id,
            from = %link.status,
            to = %target,
            "Link status changed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(link.system_code, target);
        }

        if let Some(event_type) = WorkflowEventType::for_status(target) {
            let event =
                NewWorkflowEvent::for_trade(link.trade_id, event_type, &self.user_id, update.at)
                    .with_system(link.system_code)
                    .with_details(details);
            self.record_event(event).await;
        }

        Ok(updated)
    }

    /// Reread a link whose guard matched nothing and name the reason
    async fn explain_miss(&self, link: &TradeSystemLink, target: LinkStatus) -> BookingError {
        if let Some(metrics) = &self.metrics {
            metrics.record_conflict(link.system_code);
        }

        match self.store.get_link(link.link_id).await {
            Ok(Some(current)) if !current.is_deleted => {
                warn!(
                    link_id = link.link_id,
                    expected = %link.status,
                    actual = %current.status,
                    target = %target,
                    "Link changed underneath transition"
                );
                if current.status.is_terminal() {
                    BookingError::TerminalState {
                        link_id: link.link_id,
                        status: current.status,
                    }
                } else {
                    BookingError::Conflict {
                        link_id: link.link_id,
                        target,
                        actual: current.status,
                    }
                }
            }
            Ok(_) => BookingError::NotFound(link.link_id),
            Err(e) => e.into(),
        }
    }

    fn record_ack_attempt(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_ack_attempt(result);
        }
    }
}

/// Per-link async locks. An entry lives only while some task holds or waits
/// on it.
#[derive(Default)]
struct LinkLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl LinkLocks {
    async fn acquire(&self, link_id: i64) -> LinkGuard<'_> {
        let lock = self.entries().entry(link_id).or_default().clone();
        LinkGuard {
            owner: self,
            link_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries().len()
    }
}

struct LinkGuard<'a> {
    owner: &'a LinkLocks,
    link_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LinkGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut entries = self.owner.entries();
        // Waiters hold their own clone; only the map's reference left means idle
        if entries
            .get(&self.link_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            entries.remove(&self.link_id);
        }
    }
}

fn missing_fields_error(missing: &[&str]) -> BookingError {
    BookingError::Validation(format!(
        "missing acknowledgement fields: {}",
        missing.join(", ")
    ))
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
