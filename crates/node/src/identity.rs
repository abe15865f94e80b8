use blotter_config::NodeConfig;
use blotter_types::NodeIdentity;

/// Configured values win, then the usual environment variables
pub fn resolve_identity(config: &NodeConfig) -> NodeIdentity {
    resolve_with(config, |key| std::env::var(key).ok())
}

fn resolve_with(config: &NodeConfig, env: impl Fn(&str) -> Option<String>) -> NodeIdentity {
    let first_env = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| env(*key))
            .find(|value| !value.trim().is_empty())
    };

    let user_name = config
        .user_name
        .clone()
        .or_else(|| first_env(&["USER", "USERNAME"]))
        .unwrap_or_else(|| "unknown".to_string());
    let machine_name = config
        .machine_name
        .clone()
        .or_else(|| first_env(&["HOSTNAME", "COMPUTERNAME"]))
        .unwrap_or_else(|| "localhost".to_string());
    let node_id = config
        .node_id
        .clone()
        .unwrap_or_else(|| format!("{machine_name}-{}", uuid::Uuid::new_v4()));

    NodeIdentity::new(node_id, user_name, machine_name)
}
