//! Configuration validation

use crate::{AppConfig, ConfigError, ElectionConfig, IngestConfig, Result};
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate the entire application configuration, reporting every problem at once
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let mut errors = Vec::new();

    for (field, value) in [
        ("node.node_id", &config.node.node_id),
        ("node.user_name", &config.node.user_name),
        ("node.machine_name", &config.node.machine_name),
    ] {
        if matches!(value, Some(v) if v.trim().is_empty()) {
            errors.push(ValidationError::new(field, "must not be blank when set"));
        }
    }

    if config.database.url.is_empty() {
        errors.push(ValidationError::new("database.url", "database url is required"));
    } else if !config.database.url.starts_with("sqlite:") {
        errors.push(ValidationError::new(
            "database.url",
            "only sqlite: urls are supported",
        ));
    }

    if config.database.max_connections == 0 {
        errors.push(ValidationError::new(
            "database.max_connections",
            "must be greater than 0",
        ));
    }

    errors.extend(validate_election(&config.election));

    if config.ingest.enabled {
        errors.extend(validate_ingest(&config.ingest));
    }

    if let Err(e) = validate_log_level(&config.logging.level) {
        errors.push(e);
    }

    if config.metrics.enabled && config.metrics.port == 0 {
        errors.push(ValidationError::new(
            "metrics.port",
            "metrics port must be greater than 0",
        ));
    }

    // Return all errors if any were found
    if !errors.is_empty() {
        let error_msg = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ConfigError::ValidationError(error_msg));
    }

    Ok(())
}

/// Timing rules for the lease protocol
pub fn validate_election(election: &ElectionConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if election.lock_name.trim().is_empty() {
        errors.push(ValidationError::new("election.lock_name", "lock name is required"));
    }

    for (field, value) in [
        ("election.lease_ttl_secs", election.lease_ttl_secs),
        ("election.tick_interval_secs", election.tick_interval_secs),
        ("election.heartbeat_interval_secs", election.heartbeat_interval_secs),
        ("election.presence_ttl_secs", election.presence_ttl_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    // A master must get at least one renewal attempt in before its lease lapses
    if election.tick_interval_secs >= election.lease_ttl_secs {
        errors.push(ValidationError::new(
            "election.tick_interval_secs",
            "must be shorter than election.lease_ttl_secs",
        ));
    }

    if election.heartbeat_interval_secs.saturating_mul(3) > election.presence_ttl_secs {
        errors.push(ValidationError::new(
            "election.heartbeat_interval_secs",
            "must be at most a third of election.presence_ttl_secs",
        ));
    }

    if election.max_consecutive_failures == 0 {
        errors.push(ValidationError::new(
            "election.max_consecutive_failures",
            "must be at least 1",
        ));
    }

    errors
}

/// Folder layout and cadence of response ingestion
pub fn validate_ingest(ingest: &IngestConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if ingest.inbound_dir.as_os_str().is_empty() {
        errors.push(ValidationError::new("ingest.inbound_dir", "inbound folder is required"));
    }

    if ingest.archive_dir == ingest.inbound_dir {
        errors.push(ValidationError::new(
            "ingest.archive_dir",
            "must differ from ingest.inbound_dir",
        ));
    }

    if ingest.quarantine_dir == ingest.inbound_dir || ingest.quarantine_dir == ingest.archive_dir {
        errors.push(ValidationError::new(
            "ingest.quarantine_dir",
            "must differ from the inbound and archive folders",
        ));
    }

    if ingest.system_codes.is_empty() {
        errors.push(ValidationError::new(
            "ingest.system_codes",
            "at least one system code must be listed",
        ));
    }

    let unique: HashSet<_> = ingest.system_codes.iter().collect();
    if unique.len() != ingest.system_codes.len() {
        errors.push(ValidationError::new(
            "ingest.system_codes",
            "duplicate system codes found",
        ));
    }

    if ingest.reconcile_interval_secs == 0 {
        errors.push(ValidationError::new(
            "ingest.reconcile_interval_secs",
            "must be greater than 0",
        ));
    }

    errors
}

/// Validate log level
fn validate_log_level(level: &str) -> std::result::Result<(), ValidationError> {
    // Directive lists such as `info,blotter_ingest=trace` are checked by their first entry
    let base = level.split(',').next().unwrap_or_default();
    match base.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new(
            "logging.level",
            format!("invalid log level '{level}', must start with one of: trace, debug, info, warn, error"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseConfig, LoggingConfig, NodeConfig};
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = AppConfig {
            logging: LoggingConfig {
                level: "verbose".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(validate_config(&config).is_err());

        let config = AppConfig {
            logging: LoggingConfig {
                level: "info,blotter_ingest=trace".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_tick_must_fit_inside_lease() {
        let election = ElectionConfig {
            lease_ttl_secs: 10,
            tick_interval_secs: 10,
            ..Default::default()
        };

        let errors = validate_election(&election);
        assert!(errors
            .iter()
            .any(|e| e.field == "election.tick_interval_secs"));
    }

    #[test]
    fn test_heartbeat_cadence_against_presence_ttl() {
        let election = ElectionConfig {
            heartbeat_interval_secs: 11,
            presence_ttl_secs: 30,
            ..Default::default()
        };

        let errors = validate_election(&election);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "election.heartbeat_interval_secs");
    }

    #[test]
    fn test_ingest_folders_must_differ() {
        let ingest = IngestConfig {
            inbound_dir: PathBuf::from("in"),
            archive_dir: PathBuf::from("in"),
            quarantine_dir: PathBuf::from("in"),
            ..Default::default()
        };

        let errors = validate_ingest(&ingest);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_disabled_ingest_is_not_validated() {
        let config = AppConfig {
            ingest: IngestConfig {
                enabled: false,
                system_codes: vec![],
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_all_errors_reported_together() {
        let config = AppConfig {
            node: NodeConfig {
                user_name: Some("  ".to_string()),
                ..Default::default()
            },
            database: DatabaseConfig {
                url: "postgres://db".to_string(),
                max_connections: 0,
            },
            ..Default::default()
        };

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("node.user_name"));
        assert!(err.contains("database.url"));
        assert!(err.contains("database.max_connections"));
    }
}
