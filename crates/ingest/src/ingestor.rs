use blotter_booking::{BookingError, BookingStateMachine};
use blotter_metrics::MetricsCollector;
use blotter_store::{LinkStore, WorkflowEventLog};
use blotter_types::{
    LinkStatus, NewWorkflowEvent, SystemCode, TradeSystemLink, WorkflowEventType,
};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{is_candidate, IngestError, ResponseFile};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub inbound_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub quarantine_dir: PathBuf,

    /// Booking systems whose responses this desk handles
    pub system_codes: Vec<SystemCode>,

    /// Rescan of the inbound folder while active
    pub reconcile_interval: Duration,

    /// A file that fails to parse is only quarantined once it has been left
    /// untouched this long; younger files may still be mid-write
    pub settle_window: Duration,
}

impl IngestSettings {
    /// Default layout under one inbound folder
    pub fn under(inbound_dir: impl Into<PathBuf>) -> Self {
        let inbound_dir = inbound_dir.into();
        Self {
            archive_dir: inbound_dir.join("archive"),
            quarantine_dir: inbound_dir.join("quarantine"),
            inbound_dir,
            system_codes: SystemCode::ALL.to_vec(),
            reconcile_interval: Duration::from_secs(60),
            settle_window: Duration::from_secs(2),
        }
    }
}

/// What happened to one inbound file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDisposition {
    /// Applied and moved to the archive folder
    Archived,
    /// Unusable; moved to the quarantine folder
    Quarantined,
    /// Left in place for a later pass
    Deferred,
    /// Not a response file, or already gone
    Skipped,
}

impl FileDisposition {
    pub fn label(&self) -> &'static str {
        match self {
            FileDisposition::Archived => "archived",
            FileDisposition::Quarantined => "quarantined",
            FileDisposition::Deferred => "deferred",
            FileDisposition::Skipped => "skipped",
        }
    }
}

/// Tally of one scan over the inbound folder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub archived: usize,
    pub quarantined: usize,
    pub deferred: usize,
}

impl PassSummary {
    fn add(&mut self, disposition: FileDisposition) {
        match disposition {
            FileDisposition::Archived => self.archived += 1,
            FileDisposition::Quarantined => self.quarantined += 1,
            FileDisposition::Deferred => self.deferred += 1,
            FileDisposition::Skipped => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INGESTOR
// ═══════════════════════════════════════════════════════════════════════════

/// Turns response files into booking transitions while this instance is master
pub struct ResponseIngestor<S> {
    machine: Arc<BookingStateMachine<S>>,
    settings: IngestSettings,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<S: LinkStore + WorkflowEventLog + 'static> ResponseIngestor<S> {
    pub fn new(machine: Arc<BookingStateMachine<S>>, settings: IngestSettings) -> Self {
        Self {
            machine,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub async fn ensure_dirs(&self) -> Result<(), IngestError> {
        for dir in [
            &self.settings.inbound_dir,
            &self.settings.archive_dir,
            &self.settings.quarantine_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Apply one response file and dispose of it
    pub async fn process_file(&self, path: &Path) -> FileDisposition {
        let disposition = self.dispose(path).await;
        if disposition != FileDisposition::Skipped {
            debug!(file = %path.display(), disposition = disposition.label(), "Processed response file");
            if let Some(metrics) = &self.metrics {
                metrics.record_ingested_file(disposition.label());
            }
        }
        disposition
    }

    async fn dispose(&self, path: &Path) -> FileDisposition {
        if !is_candidate(path) {
            return FileDisposition::Skipped;
        }

        let (bytes, modified) = match tokio::fs::metadata(path).await {
            Ok(meta) if !meta.is_file() => return FileDisposition::Skipped,
            // Created but not yet written
            Ok(meta) if meta.len() == 0 => return FileDisposition::Deferred,
            Ok(meta) => match tokio::fs::read(path).await {
                Ok(bytes) => (bytes, meta.modified().ok()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return FileDisposition::Skipped
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Cannot read response file");
                    return FileDisposition::Deferred;
                }
            },
            Err(_) => return FileDisposition::Skipped,
        };

        let response = match ResponseFile::parse(&bytes) {
            Ok(response) => response,
            Err(e) if self.is_unsettled(modified) => {
                debug!(file = %path.display(), error = %e, "Unparseable response still settling");
                return FileDisposition::Deferred;
            }
            Err(e) => {
                let event = NewWorkflowEvent::for_node(
                    WorkflowEventType::ResponseQuarantined,
                    self.machine.user_id(),
                    self.machine.now(),
                )
                .with_details(format!("{}: {e}", file_label(path)));
                return self.quarantine(path, &e.to_string(), event).await;
            }
        };

        if !self.settings.system_codes.contains(&response.system_code) {
            let reason = format!("{} is not handled here", response.system_code);
            return self
                .quarantine(path, &reason, self.quarantine_event(&response, path, &reason))
                .await;
        }

        match self
            .machine
            .apply_response(response.trade_id, response.system_code, &response.outcome)
            .await
        {
            Ok(link) => {
                info!(
                    trade_id = response.trade_id,
                    system = %response.system_code,
                    status = %link.status,
                    "Applied booking response"
                );
                self.archive(path).await
            }
            Err(e) if e.is_transient() => {
                warn!(file = %path.display(), error = %e, "Response deferred");
                FileDisposition::Deferred
            }
            Err(e) => {
                let reason = e.to_string();
                let event = self.quarantine_event(&response, path, &reason);
                if matches!(e, BookingError::Store(_)) {
                    error!(file = %path.display(), error = %e, "Store rejected response");
                }
                self.quarantine(path, &reason, event).await
            }
        }
    }

    /// Scan the inbound folder once. Also reports links still awaiting a
    /// response so a newly promoted master can see its backlog.
    pub async fn catch_up(&self) -> Result<PassSummary, IngestError> {
        match self
            .machine
            .store()
            .list_links_by_status(&[LinkStatus::Pending], &self.settings.system_codes)
            .await
        {
            Ok(pending) if pending.is_empty() => debug!("No links awaiting a booking response"),
            Ok(pending) => info!(
                pending = pending.len(),
                links = ?awaiting_response(&pending),
                "Links awaiting a booking response"
            ),
            Err(e) => warn!(error = %e, "Could not list pending links"),
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.settings.inbound_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_candidate(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut summary = PassSummary::default();
        for path in files {
            summary.add(self.process_file(&path).await);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_reconcile_pass();
        }
        if summary != PassSummary::default() {
            info!(
                archived = summary.archived,
                quarantined = summary.quarantined,
                deferred = summary.deferred,
                "Reconciliation pass"
            );
        }
        Ok(summary)
    }

    /// Watch the inbound folder until `stop` flips to true.
    ///
    /// Catch-up runs once before relying on filesystem events, then again on
    /// every reconcile interval. If the platform watcher cannot be created the
    /// periodic rescan carries on alone.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<(), IngestError> {
        self.ensure_dirs().await?;
        let inbound = tokio::fs::canonicalize(&self.settings.inbound_dir).await?;

        let (tx, rx) = mpsc::channel::<Event>(256);
        let (watcher, mut events) = match start_watcher(&inbound, tx) {
            Ok(watcher) => (Some(watcher), Some(rx)),
            Err(e) => {
                warn!(dir = %inbound.display(), error = %e, "Folder watch unavailable; polling only");
                (None, None)
            }
        };

        info!(dir = %inbound.display(), "Response ingestion started");
        if let Err(e) = self.catch_up().await {
            warn!(error = %e, "Catch-up pass failed");
        }

        let mut ticker = tokio::time::interval(self.settings.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = next_event(&mut events) => {
                    match event {
                        Some(event) if is_arrival(&event.kind) => {
                            for path in event.paths {
                                if path.parent() == Some(inbound.as_path()) {
                                    self.process_file(&path).await;
                                }
                            }
                        }
                        Some(_) => {}
                        None => {
                            warn!("Folder watch closed; polling only");
                            events = None;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.catch_up().await {
                        warn!(error = %e, "Reconciliation pass failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        drop(watcher);
        info!(dir = %inbound.display(), "Response ingestion stopped");
        Ok(())
    }

    /// Whether a file was touched within the settle window. An unknown or
    /// future mtime counts as unsettled.
    fn is_unsettled(&self, modified: Option<SystemTime>) -> bool {
        if self.settings.settle_window.is_zero() {
            return false;
        }
        match modified.map(|at| SystemTime::now().duration_since(at)) {
            Some(Ok(age)) => age < self.settings.settle_window,
            _ => true,
        }
    }

    fn quarantine_event(
        &self,
        response: &ResponseFile,
        path: &Path,
        reason: &str,
    ) -> NewWorkflowEvent {
        NewWorkflowEvent::for_trade(
            response.trade_id,
            WorkflowEventType::ResponseQuarantined,
            self.machine.user_id(),
            self.machine.now(),
        )
        .with_system(response.system_code)
        .with_details(format!("{}: {reason}", file_label(path)))
    }

    async fn archive(&self, path: &Path) -> FileDisposition {
        match move_into(path, &self.settings.archive_dir).await {
            Ok(_) => FileDisposition::Archived,
            Err(e) => {
                // Applied already; a replay on the next pass is harmless
                warn!(file = %path.display(), error = %e, "Failed to archive response file");
                FileDisposition::Deferred
            }
        }
    }

    async fn quarantine(
        &self,
        path: &Path,
        reason: &str,
        event: NewWorkflowEvent,
    ) -> FileDisposition {
        warn!(file = %path.display(), %reason, "Quarantining response file");
        self.machine.record_event(event).await;
        match move_into(path, &self.settings.quarantine_dir).await {
            Ok(_) => FileDisposition::Quarantined,
            Err(e) => {
                error!(file = %path.display(), error = %e, "Failed to quarantine response file");
                FileDisposition::Deferred
            }
        }
    }
}

fn start_watcher(dir: &Path, tx: mpsc::Sender<Event>) -> Result<RecommendedWatcher, IngestError> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(e) = tx.blocking_send(event) {
                    debug!("Dropping folder event: {}", e);
                }
            }
            Err(e) => error!("Folder watch error: {}", e),
        },
        notify::Config::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| IngestError::Watch(e.to_string()))?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| IngestError::Watch(e.to_string()))?;
    Ok(watcher)
}

async fn next_event(events: &mut Option<mpsc::Receiver<Event>>) -> Option<Event> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// `trade_id/SYSTEM` labels for a backlog log line
fn awaiting_response(pending: &[TradeSystemLink]) -> Vec<String> {
    pending
        .iter()
        .map(|link| format!("{}/{}", link.trade_id, link.system_code))
        .collect()
}

/// Created, renamed into place or closed after writing. Plain data writes
/// are not arrivals; the close that follows them is.
fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Move `path` into `dir`, prefixing a timestamp so names never collide
async fn move_into(path: &Path, dir: &Path) -> Result<PathBuf, IngestError> {
    tokio::fs::create_dir_all(dir).await?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    let target = dir.join(format!("{stamp}-{}", file_label(path)));

    if tokio::fs::rename(path, &target).await.is_err() {
        // Different filesystem
        tokio::fs::copy(path, &target).await?;
        tokio::fs::remove_file(path).await?;
    }
    Ok(target)
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
