//! Core configuration structures for a blotter instance

use blotter_types::{SystemCode, MASTER_LOCK_NAME};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Identity this instance presents to the shared database
    pub node: NodeConfig,

    /// Shared database connection
    pub database: DatabaseConfig,

    /// Lease and presence timing
    pub election: ElectionConfig,

    /// Booking response folder handling
    pub ingest: IngestConfig,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,
}

/// Node identity. Unset fields are resolved from the host at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: Option<String>,
    pub user_name: Option<String>,
    pub machine_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,

    /// Connection pool size
    pub max_connections: u32,
}

/// Election timing. All instances sharing a database should agree on these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub lock_name: String,

    /// Lease lifetime granted by each successful acquire or renewal
    pub lease_ttl_secs: u64,

    /// Election loop cadence
    pub tick_interval_secs: u64,

    /// Presence heartbeat cadence
    pub heartbeat_interval_secs: u64,

    /// How long a heartbeat keeps a user online
    pub presence_ttl_secs: u64,

    /// Failed ticks in a row before a master demotes itself
    pub max_consecutive_failures: u32,

    /// Expire our lease on graceful shutdown instead of waiting for the TTL
    pub release_on_shutdown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,

    /// Folder booking systems drop response files into
    pub inbound_dir: PathBuf,

    /// Where processed files are moved
    pub archive_dir: PathBuf,

    /// Where unresolvable files are moved
    pub quarantine_dir: PathBuf,

    /// Systems whose PENDING links are reconciled on promotion
    pub system_codes: Vec<SystemCode>,

    /// Full rescan cadence while master
    pub reconcile_interval_secs: u64,

    /// How long a stop request waits for the ingestor before aborting it
    pub stop_grace_ms: u64,

    /// Unparseable files modified more recently than this are retried, not quarantined
    pub settle_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `info,blotter_election=debug`
    pub level: String,

    /// Emit one JSON object per line instead of plain text
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl ElectionConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }
}

impl IngestConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }
}

impl MetricsConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

// Default value functions
fn default_database_url() -> String {
    "sqlite://blotter.db?mode=rwc".to_string()
}

fn default_log_level() -> String {
    "info,blotter=debug".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: 4,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_name: MASTER_LOCK_NAME.to_string(),
            lease_ttl_secs: 30,
            tick_interval_secs: 10,
            heartbeat_interval_secs: 8,
            presence_ttl_secs: 30,
            max_consecutive_failures: 2,
            release_on_shutdown: true,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inbound_dir: PathBuf::from("inbound"),
            archive_dir: PathBuf::from("inbound/archive"),
            quarantine_dir: PathBuf::from("inbound/quarantine"),
            system_codes: SystemCode::ALL.to_vec(),
            reconcile_interval_secs: 60,
            stop_grace_ms: 2_000,
            settle_window_ms: 2_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}
