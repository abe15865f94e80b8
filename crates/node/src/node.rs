use blotter_booking::BookingStateMachine;
use blotter_config::{AppConfig, ElectionConfig, IngestConfig};
use blotter_election::{ElectionCoordinator, ElectionSettings, Heartbeat};
use blotter_ingest::{IngestSettings, IngestSupervisor, ResponseIngestor};
use blotter_metrics::{MetricsCollector, MetricsServer};
use blotter_store::SqliteStore;
use blotter_types::{Clock, Leadership, SystemClock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::identity::resolve_identity;

pub fn election_settings(config: &ElectionConfig) -> ElectionSettings {
    ElectionSettings {
        lock_name: config.lock_name.clone(),
        lease_ttl: chrono::Duration::seconds(config.lease_ttl_secs as i64),
        presence_ttl: chrono::Duration::seconds(config.presence_ttl_secs as i64),
        tick_interval: config.tick_interval(),
        max_consecutive_failures: config.max_consecutive_failures,
        release_on_shutdown: config.release_on_shutdown,
    }
}

pub fn ingest_settings(config: &IngestConfig) -> IngestSettings {
    IngestSettings {
        inbound_dir: config.inbound_dir.clone(),
        archive_dir: config.archive_dir.clone(),
        quarantine_dir: config.quarantine_dir.clone(),
        system_codes: config.system_codes.clone(),
        reconcile_interval: config.reconcile_interval(),
        settle_window: config.settle_window(),
    }
}

/// Run heartbeat, election and (when configured) ingestion until Ctrl-C
pub async fn run(config: AppConfig, metrics: Arc<MetricsCollector>) -> anyhow::Result<()> {
    let identity = resolve_identity(&config.node);
    info!(
        node_id = %identity.node_id,
        user = %identity.user_name,
        machine = %identity.machine_name,
        lock = %config.election.lock_name,
        "Starting blotter node"
    );

    let store = Arc::new(
        SqliteStore::connect(&config.database.url, config.database.max_connections).await?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let heartbeat = Heartbeat::new(
        store.clone(),
        identity.clone(),
        clock.clone(),
        config.election.heartbeat_interval(),
    )
    .with_metrics(metrics.clone());
    tasks.push(tokio::spawn(heartbeat.run(shutdown_rx.clone())));

    let coordinator = Arc::new(
        ElectionCoordinator::new(
            store.clone(),
            identity.clone(),
            election_settings(&config.election),
            clock.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    if config.ingest.enabled {
        let leadership: Arc<dyn Leadership> = Arc::new(coordinator.leadership());
        let machine = Arc::new(
            BookingStateMachine::new(store.clone(), leadership, clock.clone(), &identity.user_name)
                .with_metrics(metrics.clone()),
        );
        let ingestor = Arc::new(
            ResponseIngestor::new(machine, ingest_settings(&config.ingest))
                .with_metrics(metrics.clone()),
        );
        let supervisor =
            IngestSupervisor::new(ingestor, coordinator.handle(), config.ingest.stop_grace())
                .with_metrics(metrics.clone());
        tasks.push(tokio::spawn(supervisor.run(shutdown_rx.clone())));
    } else {
        info!("Response ingestion disabled on this node");
    }

    tasks.push(tokio::spawn(coordinator.clone().run(shutdown_rx.clone())));

    if config.metrics.enabled {
        let server = MetricsServer::new(metrics.clone(), config.metrics.socket_addr());
        let mut stop = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            };
            if let Err(e) = server.serve(shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    info!(node_id = %identity.node_id, "Blotter node stopped");
    Ok(())
}
