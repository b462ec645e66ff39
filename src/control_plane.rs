//! Remote control-plane seam.
//!
//! [`ControlPlane`] mirrors the handful of platform operations the remote
//! backend needs. [`ControlPlaneClient`] is the GraphQL-over-HTTP
//! implementation; tests substitute in-memory fakes.

pub mod client;

pub use client::ControlPlaneClient;

use crate::compiler::SecretEnv;
use crate::error::ControlPlaneError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type CpResult<T> = std::result::Result<T, ControlPlaneError>;

/// The most recent deployment of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    /// Platform status label, e.g. `SUCCESS`, `BUILDING`, `CRASHED`.
    pub status: String,
    #[serde(default)]
    pub static_url: Option<String>,
}

/// Settings applied after a service is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstanceSettings {
    pub start_command: String,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::Always => "ALWAYS",
            RestartPolicy::OnFailure => "ON_FAILURE",
            RestartPolicy::Never => "NEVER",
        }
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Create a service running `image` with initial variables. Returns the
    /// service id. Never retried by callers.
    async fn create_service(&self, name: &str, image: &str, variables: &SecretEnv)
    -> CpResult<String>;

    async fn update_service_instance(
        &self,
        service_id: &str,
        settings: &ServiceInstanceSettings,
    ) -> CpResult<()>;

    /// Create a public domain for the service. Returns the host name.
    async fn create_service_domain(&self, service_id: &str) -> CpResult<String>;

    /// Trigger a fresh deployment with the current variables.
    async fn redeploy_service(&self, service_id: &str) -> CpResult<()>;

    /// Remove a deployment while keeping the service.
    async fn remove_deployment(&self, deployment_id: &str) -> CpResult<()>;

    async fn restart_deployment(&self, deployment_id: &str) -> CpResult<()>;

    async fn delete_service(&self, service_id: &str) -> CpResult<()>;

    async fn latest_deployment(&self, service_id: &str) -> CpResult<Option<Deployment>>;

    async fn deployment_logs(&self, deployment_id: &str, limit: usize) -> CpResult<Vec<String>>;

    /// Merge variables into the service's variable set.
    async fn upsert_variables(&self, service_id: &str, variables: &SecretEnv) -> CpResult<()>;

    async fn find_service_by_name(&self, name: &str) -> CpResult<Option<String>>;
}
