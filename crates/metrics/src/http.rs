use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::collector::MetricsCollector;

/// Scrape endpoint plus a small role check for desk tooling
pub struct MetricsServer {
    collector: Arc<MetricsCollector>,
    addr: String,
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub role: &'static str,
    pub ingesting: bool,
}

impl NodeStatus {
    pub fn new(is_master: bool, ingesting: bool) -> Self {
        Self {
            role: if is_master { "master" } else { "standby" },
            ingesting,
        }
    }
}

impl MetricsServer {
    pub fn new(collector: Arc<MetricsCollector>, addr: String) -> Self {
        Self { collector, addr }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(scrape))
            .route("/status", get(status))
            .with_state(self.collector.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<(), MetricsServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| MetricsServerError::Bind(self.addr.clone(), e.to_string()))?;
        tracing::info!(addr = %self.addr, "Metrics endpoint listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| MetricsServerError::Serve(e.to_string()))
    }
}

async fn scrape(State(collector): State<Arc<MetricsCollector>>) -> Response {
    match collector.export_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn status(State(collector): State<Arc<MetricsCollector>>) -> Json<NodeStatus> {
    Json(NodeStatus::new(
        collector.is_master(),
        collector.is_ingest_active(),
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsServerError {
    #[error("cannot bind metrics endpoint to {0}: {1}")]
    Bind(String, String),
    #[error("metrics endpoint failed: {0}")]
    Serve(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scrape_returns_prometheus_text() {
        let collector = Arc::new(MetricsCollector::new());
        collector.record_heartbeat(true);

        let response = scrape(State(collector)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_status_body() {
        let body = serde_json::to_value(NodeStatus::new(true, false)).unwrap();
        assert_eq!(body, serde_json::json!({"role": "master", "ingesting": false}));

        assert_eq!(NodeStatus::new(false, false).role, "standby");
    }

    #[tokio::test]
    async fn test_status_endpoint_responds() {
        let collector = Arc::new(MetricsCollector::new());
        let Json(body) = status(State(collector)).await;
        assert!(body.role == "master" || body.role == "standby");
    }

    #[tokio::test]
    async fn test_bind_error_is_reported() {
        let collector = Arc::new(MetricsCollector::new());
        let server = MetricsServer::new(collector, "not-an-address".to_string());

        let result = server.serve(async {}).await;
        assert!(matches!(result, Err(MetricsServerError::Bind(..))));
    }
}
