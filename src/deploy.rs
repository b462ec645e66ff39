//! Deployment providers: one lifecycle contract, two backends.
//!
//! [`DeploymentProvider`] is selected once at startup from configuration and
//! handed around as `Arc<dyn DeploymentProvider>`. Callers never branch on
//! the backend kind.

pub mod local;
pub mod remote;
pub mod retry;
pub mod start_command;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use crate::compiler::provider_env_var;
use crate::desired::DesiredConfiguration;
use crate::error::{DeployError, Result};
use crate::instances::{DeploymentLogStore, Instance, InstanceStatus, InstanceStore, LogAction};

use async_trait::async_trait;
use serde::Serialize;

/// What `deploy` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployOutcome {
    pub instance_id: String,
    pub resource_id: Option<String>,
    pub resource_name: String,
    pub port: i64,
    pub access_url: Option<String>,
    pub status: InstanceStatus,
}

/// Lifecycle contract shared by the remote and local backends.
///
/// Every mutating method appends exactly one deployment log entry, success or
/// failure, before it returns.
#[async_trait]
pub trait DeploymentProvider: Send + Sync + 'static {
    /// Short backend name for logs and CLI output.
    fn kind(&self) -> &'static str;

    /// Create the user's instance, replacing any previous one and any orphaned
    /// backend resource with the same deterministic name.
    async fn deploy(&self, user_id: &str, desired: &DesiredConfiguration) -> Result<DeployOutcome>;

    async fn start(&self, instance_id: &str) -> Result<()>;

    async fn stop(&self, instance_id: &str) -> Result<()>;

    async fn restart(&self, instance_id: &str) -> Result<()>;

    /// Remove the backend resource first, then the instance row.
    async fn destroy(&self, instance_id: &str) -> Result<()>;

    /// Roll out a fresh process with the configuration already applied.
    async fn redeploy(&self, instance_id: &str) -> Result<()>;

    /// Reconcile backend status into storage and report whether the instance
    /// is running.
    async fn check_health(&self, instance_id: &str) -> Result<bool>;

    async fn get_logs(&self, instance_id: &str, tail: usize) -> Result<String>;

    /// Push a recompiled configuration and restart the process on it.
    async fn update_config(&self, instance_id: &str, desired: &DesiredConfiguration) -> Result<()>;

    async fn get_service_url(&self, instance_id: &str) -> Result<Option<String>>;

    async fn get_access_url(&self, instance_id: &str) -> Result<Option<String>>;

    /// Block until the current rollout finishes. Resolves with the access URL
    /// on success.
    async fn wait_until_ready(&self, instance_id: &str) -> Result<Option<String>>;
}

/// Reject configurations that can never start, before touching the backend.
pub fn validate_desired(desired: &DesiredConfiguration) -> Result<()> {
    if desired.provider.trim().is_empty() {
        return Err(DeployError::Validation("AI provider is not set".into()).into());
    }
    if provider_env_var(&desired.provider).is_none() {
        return Err(DeployError::Validation(format!(
            "unknown AI provider '{}'",
            desired.provider
        ))
        .into());
    }
    if desired.api_key.trim().is_empty() {
        return Err(DeployError::Validation(format!(
            "API key for provider '{}' is missing",
            desired.provider
        ))
        .into());
    }
    if desired.gateway_token.trim().is_empty() {
        return Err(DeployError::Validation("gateway token is missing".into()).into());
    }
    Ok(())
}

/// Instance rows plus the audit log, shared by both backends.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub instances: InstanceStore,
    pub logs: DeploymentLogStore,
}

impl Ledger {
    pub fn new(instances: InstanceStore, logs: DeploymentLogStore) -> Self {
        Self { instances, logs }
    }

    /// Write the one log entry for a lifecycle operation and pass the result
    /// through. A failure to write the log never masks the operation's error.
    pub async fn record<T>(
        &self,
        instance: &Instance,
        action: LogAction,
        success_message: &str,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                self.logs.success(instance, action, success_message).await?;
                tracing::info!(instance_id = %instance.id, %action, "{success_message}");
                Ok(value)
            }
            Err(error) => {
                let message = format!("{action} failed");
                if let Err(log_error) = self
                    .logs
                    .failure(instance, action, &message, &error.to_string())
                    .await
                {
                    tracing::error!(instance_id = %instance.id, %log_error, "failed to record deployment log");
                }
                tracing::warn!(instance_id = %instance.id, %action, %error, "{message}");
                Err(error)
            }
        }
    }

    /// Mark a failed creation: status ERROR plus the failure entry.
    pub async fn fail_deploy<T>(&self, instance: &Instance, error: crate::Error) -> Result<T> {
        if let Err(status_error) = self
            .instances
            .set_status(&instance.id, InstanceStatus::Error)
            .await
        {
            tracing::error!(instance_id = %instance.id, %status_error, "failed to mark instance as errored");
        }
        self.record(instance, LogAction::Deploy, "deployed", Err(error))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::generate_gateway_token;

    fn desired() -> DesiredConfiguration {
        DesiredConfiguration {
            provider: "anthropic".into(),
            api_key: "k1".into(),
            model: "claude-sonnet-4".into(),
            gateway_token: generate_gateway_token(),
            ..Default::default()
        }
    }

    #[test]
    fn complete_configuration_passes() {
        assert!(validate_desired(&desired()).is_ok());
    }

    #[test]
    fn missing_pieces_are_validation_errors() {
        let cases = [
            DesiredConfiguration {
                api_key: "  ".into(),
                ..desired()
            },
            DesiredConfiguration {
                provider: "bogus".into(),
                ..desired()
            },
            DesiredConfiguration {
                gateway_token: String::new(),
                ..desired()
            },
        ];
        for case in cases {
            let error = validate_desired(&case).expect_err("must be rejected");
            assert!(matches!(
                error,
                crate::Error::Deploy(DeployError::Validation(_))
            ));
        }
    }
}
