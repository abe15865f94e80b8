//! Blotter node - one desktop instance's coordination daemon
//!
//! Every instance heartbeats into the shared database and takes part in the
//! master election. Only the elected master ingests booking responses.

mod admin;
mod identity;
mod node;

use blotter_config::{validate_config, ConfigLoader};
use blotter_metrics::{init_tracing, MetricsCollector};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (TOML, YAML or JSON); BLOTTER_* environment variables override it
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node until Ctrl-C (default)
    Run,
    /// Show the current lease holder and presence
    Master,
    /// Inspect or edit the master priority list
    Priority {
        #[command(subcommand)]
        action: PriorityAction,
    },
    /// Show the links and workflow events of a trade
    Trade { trade_id: i64 },
}

#[derive(Subcommand, Debug)]
pub(crate) enum PriorityAction {
    List,
    Set { user: String, order: i32 },
    Remove { user: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load(cli.config.as_deref())?;
    validate_config(&config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let metrics = Arc::new(MetricsCollector::new());
            init_tracing(&config.logging.level, config.logging.json, Some(metrics.clone()))?;
            node::run(config, metrics).await
        }
        Command::Master => {
            init_tracing("warn", false, None)?;
            admin::show_master(&config).await
        }
        Command::Priority { action } => {
            init_tracing("warn", false, None)?;
            admin::priority(&config, action).await
        }
        Command::Trade { trade_id } => {
            init_tracing("warn", false, None)?;
            admin::show_trade(&config, trade_id).await
        }
    }
}
