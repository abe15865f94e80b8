use std::time::Duration;

use blotter_types::{LinkStatus, SystemCode};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::*;

/// Metrics collector for a blotter instance
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ELECTION METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record one election tick and the label of its outcome
    pub fn record_election_tick(&self, outcome: &str) {
        ELECTION_TICKS.with_label_values(&[outcome]).inc();
    }

    /// Record a mastership change as seen by this instance
    pub fn record_mastership(&self, is_master: bool) {
        IS_MASTER.set(if is_master { 1 } else { 0 });
        let direction = if is_master { "acquired" } else { "lost" };
        MASTERSHIP_CHANGES.with_label_values(&[direction]).inc();
    }

    pub fn record_lease_cas(&self, latency: Duration) {
        LEASE_CAS_LATENCY.observe(latency.as_millis() as f64);
    }

    pub fn record_heartbeat(&self, success: bool) {
        if success {
            HEARTBEATS.inc();
        } else {
            HEARTBEAT_FAILURES.inc();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BOOKING METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn record_transition(&self, system: SystemCode, status: LinkStatus) {
        LINK_TRANSITIONS
            .with_label_values(&[system.as_str(), status.as_str()])
            .inc();
    }

    pub fn record_conflict(&self, system: SystemCode) {
        TRANSITION_CONFLICTS.with_label_values(&[system.as_str()]).inc();
    }

    /// `result` is one of `sent`, `transport_failed`, `rejected`
    pub fn record_ack_attempt(&self, result: &str) {
        ACK_ATTEMPTS.with_label_values(&[result]).inc();
    }

    pub fn record_export_failure(&self, system: SystemCode) {
        EXPORT_FAILURES.with_label_values(&[system.as_str()]).inc();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INGEST METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn record_ingested_file(&self, disposition: &str) {
        INGEST_FILES.with_label_values(&[disposition]).inc();
    }

    pub fn set_ingest_active(&self, active: bool) {
        INGEST_ACTIVE.set(if active { 1 } else { 0 });
    }

    pub fn record_reconcile_pass(&self) {
        RECONCILE_PASSES.inc();
    }

    pub fn record_log_error(&self, target: &str) {
        LOG_ERRORS.with_label_values(&[target]).inc();
    }

    /// Role last reported through [`record_mastership`](Self::record_mastership)
    pub fn is_master(&self) -> bool {
        IS_MASTER.get() == 1
    }

    pub fn is_ingest_active(&self) -> bool {
        INGEST_ACTIVE.get() == 1
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXPORT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Export metrics in Prometheus text format
    pub fn export_metrics(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingError(e.to_string()))
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics error types
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("encoding error: {0}")]
    EncodingError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        assert!(collector.export_metrics().is_ok());
    }

    #[test]
    fn test_record_election_metrics() {
        let collector = MetricsCollector::new();

        collector.record_election_tick("renewed");
        collector.record_mastership(true);
        collector.record_lease_cas(Duration::from_millis(3));
        collector.record_heartbeat(false);

        let metrics = collector.export_metrics().unwrap();
        assert!(metrics.contains("blotter_election_ticks_total"));
        assert!(metrics.contains("blotter_mastership_changes_total"));
        assert!(metrics.contains("blotter_lease_cas_latency_ms"));
        assert!(metrics.contains("blotter_heartbeat_failures_total"));
        assert!(metrics.contains("blotter_is_master"));
    }

    #[test]
    fn test_record_booking_metrics() {
        let collector = MetricsCollector::new();

        collector.record_transition(SystemCode::Mx3, LinkStatus::Booked);
        collector.record_conflict(SystemCode::Calypso);
        collector.record_ack_attempt("transport_failed");

        let metrics = collector.export_metrics().unwrap();
        assert!(metrics.contains("blotter_link_transitions_total"));
        assert!(metrics.contains("BOOKED"));
        assert!(metrics.contains("blotter_transition_conflicts_total"));
        assert!(metrics.contains("transport_failed"));
    }

    #[test]
    fn test_record_ingest_metrics() {
        let collector = MetricsCollector::new();

        collector.set_ingest_active(true);
        collector.record_ingested_file("quarantined");
        collector.record_reconcile_pass();

        let metrics = collector.export_metrics().unwrap();
        assert!(metrics.contains("blotter_ingest_files_total"));
        assert!(metrics.contains("quarantined"));
        assert!(metrics.contains("blotter_reconcile_passes_total"));
    }
}
