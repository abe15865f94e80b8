use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who this running instance is
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub user_name: String,
    pub machine_name: String,
}

impl NodeIdentity {
    pub fn new(
        node_id: impl Into<String>,
        user_name: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            user_name: user_name.into(),
            machine_name: machine_name.into(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_name, self.machine_name)
    }
}

/// Liveness row written by every running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub node_id: String,
    pub user_name: String,
    pub machine_name: String,
    pub last_seen_utc: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn is_online(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_seen_utc < ttl
    }
}

/// The single row per lock name arbitrating mastership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lock_name: String,
    pub held_by_user: String,
    pub held_by_machine: String,
    pub last_heartbeat_utc: DateTime<Utc>,
    pub expires_at_utc: DateTime<Utc>,
}

impl LeaseRecord {
    /// A holder is the valid master only strictly before expiry
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at_utc
    }

    pub fn is_held_by(&self, identity: &NodeIdentity) -> bool {
        self.held_by_user == identity.user_name && self.held_by_machine == identity.machine_name
    }
}

/// Candidate preference; lower order numbers win
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEntry {
    pub user_name: String,
    pub order_no: i32,
}

impl PriorityEntry {
    pub fn new(user_name: impl Into<String>, order_no: i32) -> Self {
        Self {
            user_name: user_name.into(),
            order_no,
        }
    }
}

/// First entry (by ascending order number) whose user is online.
///
/// Ties on order number fall back to user name so every instance computes the
/// same answer from the same inputs.
pub fn preferred_candidate<'a, I>(priority: &'a [PriorityEntry], online: I) -> Option<&'a str>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let online: Vec<I::Item> = online.into_iter().collect();
    let mut ordered: Vec<&PriorityEntry> = priority.iter().collect();
    ordered.sort_by(|a, b| {
        a.order_no
            .cmp(&b.order_no)
            .then_with(|| a.user_name.cmp(&b.user_name))
    });

    ordered
        .into_iter()
        .find(|entry| online.iter().any(|u| u.as_ref() == entry.user_name))
        .map(|entry| entry.user_name.as_str())
}
