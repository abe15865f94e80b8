//! Metrics and logging for blotter instances
//!
//! Prometheus counters for election, booking and ingest activity, the
//! `/metrics` endpoint that exposes them, and tracing initialisation.
//!
//! # Example
//!
//! ```no_run
//! use blotter_metrics::{MetricsCollector, MetricsServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let collector = Arc::new(MetricsCollector::new());
//!     collector.record_election_tick("no_candidate");
//!
//!     let server = MetricsServer::new(collector.clone(), "0.0.0.0:9090".to_string());
//!     server.serve(std::future::pending()).await.unwrap();
//! }
//! ```

pub mod collector;
pub mod http;
pub mod metrics;
pub mod tracing;

pub use collector::{MetricsCollector, MetricsError};
pub use http::{MetricsServer, MetricsServerError, NodeStatus};
pub use tracing::{
    init_tracing, CorrelationId, LinkSpan, MetricsLayer, TracingError, DEFAULT_LOG_FILTER,
};
