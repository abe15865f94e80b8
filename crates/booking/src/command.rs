use async_trait::async_trait;
use blotter_metrics::MetricsCollector;
use blotter_store::{LinkStore, WorkflowEventLog};
use blotter_types::{LinkStatus, NewWorkflowEvent, SystemCode, TradeSystemLink, WorkflowEventType};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{BookingError, BookingStateMachine};

/// Export service that hands a link to its booking system
#[async_trait]
pub trait BookingExporter: Send + Sync {
    async fn export(&self, link: &TradeSystemLink) -> Result<(), ExportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExportError(pub String);

/// User-initiated booking. Runs on any instance.
///
/// The export must succeed before the link is moved to PENDING; a failed
/// export leaves the link as it was and is recorded in the workflow log.
pub struct BookingCommand<S> {
    machine: Arc<BookingStateMachine<S>>,
    exporter: Arc<dyn BookingExporter>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<S: LinkStore + WorkflowEventLog + 'static> BookingCommand<S> {
    pub fn new(machine: Arc<BookingStateMachine<S>>, exporter: Arc<dyn BookingExporter>) -> Self {
        Self {
            machine,
            exporter,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Book one trade on one system
    pub async fn submit(
        &self,
        trade_id: i64,
        system_code: SystemCode,
    ) -> Result<TradeSystemLink, BookingError> {
        let link = self
            .machine
            .store()
            .find_link(trade_id, system_code)
            .await?
            .ok_or(BookingError::LinkNotFound {
                trade_id,
                system_code,
            })?;

        if !LinkStatus::BOOKABLE.contains(&link.status) {
            return Err(if link.status.is_terminal() {
                BookingError::TerminalState {
                    link_id: link.link_id,
                    status: link.status,
                }
            } else {
                BookingError::InvalidTransition {
                    from: link.status,
                    to: LinkStatus::Pending,
                }
            });
        }

        if let Err(e) = self.exporter.export(&link).await {
            warn!(trade_id, system = %system_code, error = %e, "Export failed; link left unchanged");
            if let Some(metrics) = &self.metrics {
                metrics.record_export_failure(system_code);
            }
            let event = NewWorkflowEvent::for_trade(
                trade_id,
                WorkflowEventType::ExportFailed,
                self.machine.user_id(),
                self.machine.now(),
            )
            .with_system(system_code)
            .with_details(e.to_string());
            self.machine.record_event(event).await;
            return Err(BookingError::Export(e.0));
        }

        let pending = self.machine.mark_pending(link.link_id).await?;
        info!(trade_id, system = %system_code, "Booking requested");
        Ok(pending)
    }

    /// Book every live link of a trade that is flagged for booking
    pub async fn submit_trade(
        &self,
        trade_id: i64,
    ) -> Result<Vec<(SystemCode, Result<TradeSystemLink, BookingError>)>, BookingError> {
        let links = self.machine.store().list_links_for_trade(trade_id).await?;

        let mut results = Vec::new();
        for link in links.into_iter().filter(|l| l.book_flag) {
            let result = self.submit(trade_id, link.system_code).await;
            results.push((link.system_code, result));
        }
        Ok(results)
    }
}
