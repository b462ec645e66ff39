//! Provisioned instances and their audit trail.
//!
//! An [`Instance`] is one user's long-running agent process plus the metadata
//! the control plane tracks for it. Every lifecycle operation leaves exactly
//! one [`LogEntry`] behind.

pub mod logs;
pub mod ports;
pub mod status;
pub mod store;

pub use logs::{DeploymentLogStore, LogAction, LogEntry, LogStatus};
pub use ports::PortAllocator;
pub use status::reconcile_status;
pub use store::InstanceStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Internal lifecycle state of an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Deploying,
    Running,
    Stopped,
    Restarting,
    Error,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 5] = [
        InstanceStatus::Deploying,
        InstanceStatus::Running,
        InstanceStatus::Stopped,
        InstanceStatus::Restarting,
        InstanceStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Deploying => "deploying",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deploying" => Some(InstanceStatus::Deploying),
            "running" => Some(InstanceStatus::Running),
            "stopped" => Some(InstanceStatus::Stopped),
            "restarting" => Some(InstanceStatus::Restarting),
            "error" => Some(InstanceStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub user_id: String,
    pub port: i64,
    /// Backend resource handle. `None` until the backend confirms creation.
    pub container_id: Option<String>,
    /// Deterministic resource name, see [`resource_name`].
    pub container_name: String,
    pub status: InstanceStatus,
    pub service_url: Option<String>,
    pub access_url: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic backend resource name for a user slot.
///
/// This is the idempotency key used to find resources left behind by a
/// deploy that crashed before its row was recorded. The slug alone is lossy
/// (`User_42` and `user-42` share one), so a digest of the raw id keeps
/// distinct users apart.
pub fn resource_name(user_id: &str) -> String {
    let slug: String = user_id
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() {
                character.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(RESOURCE_SLUG_LIMIT)
        .collect();
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "anonymous" } else { slug };
    let digest = hex::encode(Sha256::digest(user_id.as_bytes()));
    format!("berth-{slug}-{}", &digest[..8])
}

/// Keeps names within DNS label limits once prefix and digest are added.
const RESOURCE_SLUG_LIMIT: usize = 40;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_name_is_stable_and_dns_safe() {
        let name = resource_name("User_42");
        assert!(name.starts_with("berth-user-42-"), "{name}");
        assert_eq!(name.len(), "berth-user-42-".len() + 8);
        assert_eq!(name, resource_name("User_42"));
        assert!(resource_name("__").starts_with("berth-anonymous-"));

        let long = resource_name(&"x".repeat(200));
        assert!(long.len() <= 63);
        assert!(long.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn ids_with_the_same_slug_get_distinct_names() {
        assert_ne!(resource_name("User_42"), resource_name("user-42"));
        assert_ne!(resource_name("user.42"), resource_name("user-42"));
        assert_ne!(resource_name("__"), resource_name("--"));
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        for status in InstanceStatus::ALL {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InstanceStatus::parse("SUCCESS"), None);
    }
}
