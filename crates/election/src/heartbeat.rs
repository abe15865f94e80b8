use blotter_metrics::MetricsCollector;
use blotter_store::PresenceStore;
use blotter_types::{Clock, NodeIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Periodic presence writer. Failures are logged and never stop the loop.
pub struct Heartbeat<S> {
    store: Arc<S>,
    identity: NodeIdentity,
    clock: Arc<dyn Clock>,
    interval: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<S: PresenceStore + 'static> Heartbeat<S> {
    pub fn new(
        store: Arc<S>,
        identity: NodeIdentity,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
            interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Write one heartbeat; returns whether it reached the store
    pub async fn beat(&self) -> bool {
        let now = self.clock.now();
        let ok = match self.store.record_heartbeat(&self.identity, now).await {
            Ok(()) => {
                debug!(node = %self.identity, "Heartbeat recorded");
                true
            }
            Err(e) => {
                warn!(node = %self.identity, error = %e, "Heartbeat failed");
                false
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_heartbeat(ok);
        }
        ok
    }

    /// Beat immediately, then on every interval until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(node = %self.identity, interval = ?self.interval, "Heartbeat loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.beat().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(node = %self.identity, "Heartbeat loop stopped");
    }
}
