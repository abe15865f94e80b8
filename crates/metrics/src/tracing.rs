use blotter_types::SystemCode;
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::collector::MetricsCollector;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set; an empty `level` falls back to
/// [`DEFAULT_LOG_FILTER`]. `json` switches the fmt layer to
/// one JSON object per line. When a collector is given, ERROR events are
/// also counted per target.
pub fn init_tracing(
    level: &str,
    json: bool,
    collector: Option<Arc<MetricsCollector>>,
) -> Result<(), TracingError> {
    let level = if level.trim().is_empty() {
        DEFAULT_LOG_FILTER
    } else {
        level
    };
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| TracingError::InitError(e.to_string()))?,
    };

    let (plain_layer, json_layer) = if json {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .json();
        (None, Some(layer))
    } else {
        let layer = fmt::layer().with_target(true).with_level(true);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain_layer)
        .with(json_layer)
        .with(collector.map(MetricsLayer::new))
        .try_init()
        .map_err(|e| TracingError::InitError(e.to_string()))?;

    Ok(())
}

/// Default filter directive when neither config nor `RUST_LOG` says otherwise
pub const DEFAULT_LOG_FILTER: &str = "info,blotter=debug";

/// Tracing layer that counts error events
pub struct MetricsLayer {
    collector: Arc<MetricsCollector>,
}

impl MetricsLayer {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

impl<S> Layer<S> for MetricsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() == Level::ERROR {
            self.collector.record_log_error(metadata.target());
        }
    }
}

/// Correlation ID tying together the log lines of one ingest pass or command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Span context for work on one trade system link
#[derive(Debug, Clone)]
pub struct LinkSpan {
    pub correlation_id: CorrelationId,
    pub trade_id: i64,
    pub system_code: SystemCode,
}

impl LinkSpan {
    pub fn new(trade_id: i64, system_code: SystemCode) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            trade_id,
            system_code,
        }
    }

    /// Span to instrument async work with
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "link",
            correlation_id = %self.correlation_id,
            trade_id = self.trade_id,
            system = %self.system_code,
        )
    }
}

/// Tracing error types
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("tracing initialization error: {0}")]
    InitError(String),
}
