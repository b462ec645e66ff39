//! Folding backend deployment status onto the internal state machine.

use super::InstanceStatus;

/// Map a backend-reported deployment status onto the internal status.
///
/// - `success` → running.
/// - transient labels (`building`, `deploying`, `initializing`, `waiting`,
///   `removing`) → deploying, except that a restart in progress stays
///   restarting so a user-initiated restart does not flap.
/// - `failed` / `crashed` → error.
/// - anything else leaves the current status alone; new backend vocabulary
///   must not raise false alarms.
pub fn reconcile_status(current: InstanceStatus, backend_status: &str) -> InstanceStatus {
    match backend_status.trim().to_ascii_lowercase().as_str() {
        "success" => InstanceStatus::Running,
        "building" | "deploying" | "initializing" | "waiting" | "removing" => {
            if current == InstanceStatus::Restarting {
                InstanceStatus::Restarting
            } else {
                InstanceStatus::Deploying
            }
        }
        "failed" | "crashed" => InstanceStatus::Error,
        _ => current,
    }
}

/// Whether a backend status is final for completion polling.
pub fn is_terminal_success(backend_status: &str) -> bool {
    backend_status.eq_ignore_ascii_case("success")
}

pub fn is_terminal_failure(backend_status: &str) -> bool {
    matches!(
        backend_status.trim().to_ascii_lowercase().as_str(),
        "failed" | "crashed"
    )
}
