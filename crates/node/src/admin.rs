//! One-shot administration commands against the shared database

use blotter_config::AppConfig;
use blotter_store::{
    LeaseStore, LinkStore, PresenceStore, PriorityStore, SqliteStore, WorkflowEventLog,
};
use blotter_types::{preferred_candidate, Clock, SystemClock};

use crate::PriorityAction;

async fn open(config: &AppConfig) -> anyhow::Result<SqliteStore> {
    Ok(SqliteStore::connect(&config.database.url, config.database.max_connections).await?)
}

/// Current lease holder and who is online
pub async fn show_master(config: &AppConfig) -> anyhow::Result<()> {
    let store = open(config).await?;
    let now = SystemClock.now();
    let lock_name = &config.election.lock_name;

    match store.get_lease(lock_name).await? {
        Some(lease) if lease.is_valid(now) => println!(
            "{lock_name}: held by {}@{} until {}",
            lease.held_by_user,
            lease.held_by_machine,
            lease.expires_at_utc.to_rfc3339()
        ),
        Some(lease) => println!(
            "{lock_name}: vacant (last held by {}@{}, expired {})",
            lease.held_by_user,
            lease.held_by_machine,
            lease.expires_at_utc.to_rfc3339()
        ),
        None => println!("{lock_name}: never held"),
    }

    let presence_ttl = chrono::Duration::seconds(config.election.presence_ttl_secs as i64);
    for record in store.list_presence().await? {
        let state = if record.is_online(now, presence_ttl) {
            "online"
        } else {
            "offline"
        };
        println!(
            "  {:<16} {:<16} {:<8} last seen {}",
            record.user_name,
            record.machine_name,
            state,
            record.last_seen_utc.to_rfc3339()
        );
    }
    Ok(())
}

pub async fn priority(config: &AppConfig, action: PriorityAction) -> anyhow::Result<()> {
    let store = open(config).await?;

    match action {
        PriorityAction::List => {
            let now = SystemClock.now();
            let presence_ttl = chrono::Duration::seconds(config.election.presence_ttl_secs as i64);
            let online = store.list_online_users(now, presence_ttl).await?;
            let entries = store.load_priority_list().await?;
            let preferred = preferred_candidate(&entries, &online);

            for entry in &entries {
                let marker = if preferred == Some(entry.user_name.as_str()) {
                    "*"
                } else if online.contains(&entry.user_name) {
                    "+"
                } else {
                    " "
                };
                println!("{marker} {:>4}  {}", entry.order_no, entry.user_name);
            }
            if entries.is_empty() {
                println!("priority list is empty; no instance will become master");
            }
        }
        PriorityAction::Set { user, order } => {
            store.set_priority(&user, order).await?;
            println!("{user} -> {order}");
        }
        PriorityAction::Remove { user } => {
            if store.remove_priority(&user).await? {
                println!("removed {user}");
            } else {
                anyhow::bail!("{user} is not on the priority list");
            }
        }
    }
    Ok(())
}

/// Links and audit trail of one trade
pub async fn show_trade(config: &AppConfig, trade_id: i64) -> anyhow::Result<()> {
    let store = open(config).await?;

    let links = store.list_links_for_trade(trade_id).await?;
    if links.is_empty() {
        println!("trade {trade_id}: no live links");
    }
    for link in links {
        println!(
            "{:<14} {:<10} ext={:<12} booked_by={:<10} err={}",
            link.system_code.as_str(),
            link.status.as_str(),
            link.external_trade_id.as_deref().unwrap_or("-"),
            link.booked_by.as_deref().unwrap_or("-"),
            link.last_error.as_deref().unwrap_or("-"),
        );
    }

    for event in store.list_for_trade(trade_id).await? {
        println!(
            "  {} {:<22} {:<14} {:<10} {}",
            event.timestamp_utc.to_rfc3339(),
            event.event_type.as_str(),
            event.system_code.map(|s| s.as_str()).unwrap_or("-"),
            event.user_id,
            event.details
        );
    }
    Ok(())
}
