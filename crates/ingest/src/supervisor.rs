use blotter_election::MastershipHandle;
use blotter_metrics::MetricsCollector;
use blotter_store::{LinkStore, WorkflowEventLog};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{IngestError, ResponseIngestor};

struct ActiveIngest {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<(), IngestError>>,
}

/// Starts the ingestor when this instance becomes master and stops it as
/// soon as mastership is lost.
///
/// Stopping signals the ingestor, waits at most `stop_grace` for the current
/// file to finish and then aborts the task, so it never waits on the store.
pub struct IngestSupervisor<S> {
    ingestor: Arc<ResponseIngestor<S>>,
    mastership: MastershipHandle,
    stop_grace: Duration,
    metrics: Option<Arc<MetricsCollector>>,
    active: Option<ActiveIngest>,
}

impl<S: LinkStore + WorkflowEventLog + 'static> IngestSupervisor<S> {
    pub fn new(
        ingestor: Arc<ResponseIngestor<S>>,
        mastership: MastershipHandle,
        stop_grace: Duration,
    ) -> Self {
        Self {
            ingestor,
            mastership,
            stop_grace,
            metrics: None,
            active: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Follow mastership changes until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.mastership.is_master() {
            self.start();
        }

        loop {
            tokio::select! {
                changed = self.mastership.changed() => match changed {
                    Some(true) => self.start(),
                    Some(false) => self.stop().await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    fn start(&mut self) {
        if self.active.is_some() {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.ingestor.clone().run(stop_rx));
        self.active = Some(ActiveIngest { stop, handle });

        info!("Became master; response ingestion starting");
        if let Some(metrics) = &self.metrics {
            metrics.set_ingest_active(true);
        }
    }

    async fn stop(&mut self) {
        let Some(ActiveIngest { stop, mut handle }) = self.active.take() else {
            return;
        };

        let _ = stop.send(true);
        match tokio::time::timeout(self.stop_grace, &mut handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Response ingestion ended with an error"),
            Ok(Err(e)) => warn!(error = %e, "Response ingestion task failed"),
            Err(_) => {
                warn!(grace = ?self.stop_grace, "Response ingestion did not stop in time; aborting");
                handle.abort();
            }
        }

        info!("Response ingestion stopped");
        if let Some(metrics) = &self.metrics {
            metrics.set_ingest_active(false);
        }
    }
}
