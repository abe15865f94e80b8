use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    // ═══════════════════════════════════════════════════════════════════════════
    // ELECTION METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// 1 while this instance holds the master lease
    pub static ref IS_MASTER: IntGauge = register_int_gauge!(
        "blotter_is_master",
        "Whether this instance currently believes it is master"
    )
    .unwrap();

    /// Election ticks by outcome
    pub static ref ELECTION_TICKS: IntCounterVec = register_int_counter_vec!(
        "blotter_election_ticks_total",
        "Election ticks by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Mastership changes by direction (acquired / lost)
    pub static ref MASTERSHIP_CHANGES: IntCounterVec = register_int_counter_vec!(
        "blotter_mastership_changes_total",
        "Mastership transitions observed by this instance",
        &["direction"]
    )
    .unwrap();

    /// Lease compare-and-swap round trip (in milliseconds)
    pub static ref LEASE_CAS_LATENCY: Histogram = register_histogram!(
        "blotter_lease_cas_latency_ms",
        "Lease acquire/renew latency in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap();

    // ═══════════════════════════════════════════════════════════════════════════
    // PRESENCE METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    pub static ref HEARTBEATS: IntCounter = register_int_counter!(
        "blotter_heartbeats_total",
        "Presence heartbeats written"
    )
    .unwrap();

    pub static ref HEARTBEAT_FAILURES: IntCounter = register_int_counter!(
        "blotter_heartbeat_failures_total",
        "Presence heartbeats that failed to write"
    )
    .unwrap();

    // ═══════════════════════════════════════════════════════════════════════════
    // BOOKING METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Successful link transitions by system and destination status
    pub static ref LINK_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "blotter_link_transitions_total",
        "Trade system link transitions by destination status",
        &["system", "status"]
    )
    .unwrap();

    /// Guarded updates that matched no row
    pub static ref TRANSITION_CONFLICTS: IntCounterVec = register_int_counter_vec!(
        "blotter_transition_conflicts_total",
        "Link transitions lost to a concurrent writer",
        &["system"]
    )
    .unwrap();

    /// Outbound acknowledgement attempts by result
    pub static ref ACK_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "blotter_ack_attempts_total",
        "Acknowledgement sends by result",
        &["result"]
    )
    .unwrap();

    pub static ref EXPORT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "blotter_export_failures_total",
        "Booking exports that failed before the link moved to PENDING",
        &["system"]
    )
    .unwrap();

    // ═══════════════════════════════════════════════════════════════════════════
    // INGEST METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Response files handled by disposition
    pub static ref INGEST_FILES: IntCounterVec = register_int_counter_vec!(
        "blotter_ingest_files_total",
        "Response files processed by disposition",
        &["disposition"]
    )
    .unwrap();

    /// 1 while the response watcher is running
    pub static ref INGEST_ACTIVE: IntGauge = register_int_gauge!(
        "blotter_ingest_active",
        "Whether the response ingestor is running"
    )
    .unwrap();

    pub static ref RECONCILE_PASSES: IntCounter = register_int_counter!(
        "blotter_reconcile_passes_total",
        "Full scans of the inbound response folder"
    )
    .unwrap();

    // ═══════════════════════════════════════════════════════════════════════════
    // SYSTEM METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// ERROR-level log events by target
    pub static ref LOG_ERRORS: IntCounterVec = register_int_counter_vec!(
        "blotter_log_errors_total",
        "Error events emitted through tracing",
        &["target"]
    )
    .unwrap();
}
