//! Remote backend driven through the platform control plane.
//!
//! Services are created from a prebuilt image with the secret environment as
//! service variables. The compiled runtime config travels as one more
//! variable and the start command writes identity files before exec'ing the
//! runtime.

use super::retry::{RetryPolicy, Sleeper, TokioSleeper, with_cooldown_retry};
use super::start_command::StartCommand;
use super::{DeployOutcome, DeploymentProvider, Ledger, validate_desired};
use crate::compiler::{AGENT_NAME_VAR, GATEWAY_PORT, SYSTEM_PROMPT_VAR, SecretEnv, compile};
use crate::control_plane::{ControlPlane, RestartPolicy, ServiceInstanceSettings};
use crate::desired::DesiredConfiguration;
use crate::error::{DeployError, Result};
use crate::instances::status::{is_terminal_failure, is_terminal_success};
use crate::instances::{Instance, InstanceStatus, LogAction, reconcile_status, resource_name};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Variable carrying the gateway bearer token.
pub const GATEWAY_TOKEN_VAR: &str = "GATEWAY_TOKEN";
/// Variable carrying the compiled runtime config as JSON.
pub const RUNTIME_CONFIG_VAR: &str = "BERTH_RUNTIME_CONFIG";
/// Variable carrying the base64 bridge artifact.
pub const BRIDGE_VAR: &str = "BERTH_BRIDGE_B64";

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub image: String,
    pub entrypoint: String,
    /// Private network domain; service URLs are `http://<name>.<domain>:<port>`.
    pub internal_domain: Option<String>,
    /// Base64 bridge artifact shipped as a variable.
    pub bridge_b64: Option<String>,
    pub max_restarts: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub failure_log_lines: usize,
    pub retry: RetryPolicy,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/openclaw/openclaw:latest".into(),
            entrypoint: "node /app/dist/index.js gateway".into(),
            internal_domain: Some("railway.internal".into()),
            bridge_b64: None,
            max_restarts: 10,
            poll_interval: Duration::from_secs(3),
            poll_timeout: Duration::from_secs(120),
            failure_log_lines: 30,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct RemoteBackend {
    control: Arc<dyn ControlPlane>,
    ledger: Ledger,
    settings: RemoteSettings,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RemoteBackend {
    pub fn new(control: Arc<dyn ControlPlane>, ledger: Ledger, settings: RemoteSettings) -> Self {
        Self {
            control,
            ledger,
            settings,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Service variables: secret env plus gateway token, compiled config and
    /// the optional bridge.
    fn service_variables(&self, desired: &DesiredConfiguration) -> SecretEnv {
        let compiled = compile(desired);
        let mut variables = compiled.env.clone();
        variables.insert(GATEWAY_TOKEN_VAR.into(), desired.gateway_token.clone());
        variables.insert(RUNTIME_CONFIG_VAR.into(), compiled.config_json());
        if let Some(bridge) = &self.settings.bridge_b64 {
            variables.insert(BRIDGE_VAR.into(), bridge.clone());
        }
        variables
    }

    fn instance_settings(&self, desired: &DesiredConfiguration, variables: &SecretEnv) -> ServiceInstanceSettings {
        let start_command = StartCommand::new(&self.settings.entrypoint, &desired.workspace)
            .with_agent_name(variables.contains_key(AGENT_NAME_VAR))
            .with_system_prompt(variables.contains_key(SYSTEM_PROMPT_VAR))
            .build();

        ServiceInstanceSettings {
            start_command,
            restart_policy: RestartPolicy::OnFailure,
            max_restarts: self.settings.max_restarts,
        }
    }

    fn service_url(&self, name: &str) -> Option<String> {
        self.settings
            .internal_domain
            .as_deref()
            .map(|domain| format!("http://{name}.{domain}:{GATEWAY_PORT}"))
    }

    /// Backend service id for an instance. A missing handle is repaired from
    /// the deterministic name; this and `deploy` are the only writers.
    async fn resolve_service_id(&self, instance: &Instance) -> Result<String> {
        if let Some(service_id) = &instance.container_id {
            return Ok(service_id.clone());
        }

        let found = self
            .control
            .find_service_by_name(&instance.container_name)
            .await?;
        match found {
            Some(service_id) => {
                tracing::info!(
                    instance_id = %instance.id,
                    service_id = %service_id,
                    "repaired missing service handle from resource name"
                );
                self.ledger
                    .instances
                    .set_container_id(&instance.id, &service_id)
                    .await?;
                Ok(service_id)
            }
            None => Err(DeployError::ResourceNotFound {
                name: instance.container_name.clone(),
            }
            .into()),
        }
    }

    async fn delete_service(&self, service_id: &str) -> Result<()> {
        with_cooldown_retry("delete service", &self.settings.retry, self.sleeper.as_ref(), || {
            self.control.delete_service(service_id)
        })
        .await
    }

    async fn trigger_deploy(&self, service_id: &str) -> Result<()> {
        with_cooldown_retry("redeploy service", &self.settings.retry, self.sleeper.as_ref(), || {
            self.control.redeploy_service(service_id)
        })
        .await
    }

    /// Free the user's slot before a new row takes it. Backend teardown is
    /// best-effort: a service that survives it keeps the deterministic name
    /// and is removed again by [`Self::remove_orphan`] under the new row.
    async fn retire_previous(&self, user_id: &str) -> Result<()> {
        let Some(existing) = self.ledger.instances.get_by_user(user_id).await? else {
            return Ok(());
        };
        let teardown = match self.resolve_service_id(&existing).await {
            Ok(service_id) => self.delete_service(&service_id).await,
            Err(crate::Error::Deploy(DeployError::ResourceNotFound { .. })) => Ok(()),
            Err(error) => Err(error),
        };
        self.ledger.instances.delete(&existing.id).await?;
        match teardown {
            Ok(()) => {
                self.ledger
                    .logs
                    .success(&existing, LogAction::Cleanup, "removed previous instance before redeploy")
                    .await
            }
            Err(error) => {
                tracing::warn!(instance_id = %existing.id, %error, "best-effort teardown of previous service failed");
                self.ledger
                    .logs
                    .failure(
                        &existing,
                        LogAction::Cleanup,
                        "previous service left behind before redeploy",
                        &error.to_string(),
                    )
                    .await
            }
        }
    }

    /// Delete a service already holding this instance's name, logged on the
    /// instance that replaces it.
    async fn remove_orphan(&self, instance: &Instance) -> Result<()> {
        let Some(orphan_id) = self
            .control
            .find_service_by_name(&instance.container_name)
            .await?
        else {
            return Ok(());
        };
        tracing::info!(service_id = %orphan_id, name = %instance.container_name, "removing orphaned service");
        self.delete_service(&orphan_id).await?;
        self.ledger
            .logs
            .success(instance, LogAction::Cleanup, format!("removed orphaned service {orphan_id}"))
            .await
    }

    async fn provision(&self, instance: &Instance, desired: &DesiredConfiguration) -> Result<DeployOutcome> {
        let variables = self.service_variables(desired);
        let service_id = self
            .control
            .create_service(&instance.container_name, &self.settings.image, &variables)
            .await?;
        self.ledger
            .instances
            .set_container_id(&instance.id, &service_id)
            .await?;

        let settings = self.instance_settings(desired, &variables);
        with_cooldown_retry("update service instance", &self.settings.retry, self.sleeper.as_ref(), || {
            self.control.update_service_instance(&service_id, &settings)
        })
        .await?;

        let access_url = match self.control.create_service_domain(&service_id).await {
            Ok(domain) => Some(format!("https://{domain}")),
            Err(error) => {
                tracing::warn!(instance_id = %instance.id, %error, "public domain creation failed, continuing without one");
                None
            }
        };
        let service_url = self.service_url(&instance.container_name);
        self.ledger
            .instances
            .set_urls(&instance.id, service_url.as_deref(), access_url.as_deref())
            .await?;

        self.trigger_deploy(&service_id).await?;

        Ok(DeployOutcome {
            instance_id: instance.id.clone(),
            resource_id: Some(service_id),
            resource_name: instance.container_name.clone(),
            port: instance.port,
            access_url,
            status: InstanceStatus::Deploying,
        })
    }
}

#[async_trait]
impl DeploymentProvider for RemoteBackend {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn deploy(&self, user_id: &str, desired: &DesiredConfiguration) -> Result<DeployOutcome> {
        validate_desired(desired)?;
        let name = resource_name(user_id);

        self.retire_previous(user_id).await?;
        let instance = self.ledger.instances.create(user_id, &name).await?;

        let result: Result<DeployOutcome> = async {
            self.remove_orphan(&instance).await?;
            self.provision(&instance, desired).await
        }
        .await;
        match result {
            Ok(outcome) => {
                self.ledger
                    .record(&instance, LogAction::Deploy, "deployed", Ok(outcome))
                    .await
            }
            Err(error) => self.ledger.fail_deploy(&instance, error).await,
        }
    }

    async fn start(&self, instance_id: &str) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            let service_id = self.resolve_service_id(&instance).await?;
            self.trigger_deploy(&service_id).await?;
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Deploying)
                .await
        }
        .await;
        self.ledger
            .record(&instance, LogAction::Start, "started", result)
            .await
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            let service_id = self.resolve_service_id(&instance).await?;
            if let Some(deployment) = self.control.latest_deployment(&service_id).await? {
                with_cooldown_retry("remove deployment", &self.settings.retry, self.sleeper.as_ref(), || {
                    self.control.remove_deployment(&deployment.id)
                })
                .await?;
            }
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Stopped)
                .await
        }
        .await;
        self.ledger
            .record(&instance, LogAction::Stop, "stopped", result)
            .await
    }

    async fn restart(&self, instance_id: &str) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            let service_id = self.resolve_service_id(&instance).await?;
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Restarting)
                .await?;
            match self.control.latest_deployment(&service_id).await? {
                Some(deployment) => {
                    with_cooldown_retry("restart deployment", &self.settings.retry, self.sleeper.as_ref(), || {
                        self.control.restart_deployment(&deployment.id)
                    })
                    .await
                }
                None => self.trigger_deploy(&service_id).await,
            }
        }
        .await;
        self.ledger
            .record(&instance, LogAction::Restart, "restarted", result)
            .await
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            match self.resolve_service_id(&instance).await {
                Ok(service_id) => self.delete_service(&service_id).await?,
                Err(crate::Error::Deploy(DeployError::ResourceNotFound { name })) => {
                    tracing::info!(instance_id = %instance.id, name, "no backend service left to delete");
                }
                Err(error) => return Err(error),
            }
            self.ledger.instances.delete(&instance.id).await.map(|_| ())
        }
        .await;
        self.ledger
            .record(&instance, LogAction::Destroy, "destroyed", result)
            .await
    }

    async fn redeploy(&self, instance_id: &str) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            let service_id = self.resolve_service_id(&instance).await?;
            self.trigger_deploy(&service_id).await?;
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Deploying)
                .await
        }
        .await;
        self.ledger
            .record(&instance, LogAction::Redeploy, "redeploy triggered", result)
            .await
    }

    async fn check_health(&self, instance_id: &str) -> Result<bool> {
        let instance = self.ledger.instances.require(instance_id).await?;

        let latest = match self.resolve_service_id(&instance).await {
            Ok(service_id) => self.control.latest_deployment(&service_id).await,
            Err(error) => {
                tracing::warn!(instance_id = %instance.id, %error, "health check could not resolve service");
                return Ok(false);
            }
        };

        let status = match latest {
            Ok(Some(deployment)) => reconcile_status(instance.status, &deployment.status),
            Ok(None) => instance.status,
            Err(error) => {
                tracing::warn!(instance_id = %instance.id, %error, "health check failed to reach control plane");
                return Ok(false);
            }
        };

        if status != instance.status {
            tracing::info!(instance_id = %instance.id, from = %instance.status, to = %status, "instance status changed");
        }
        self.ledger
            .instances
            .record_health(&instance.id, status)
            .await?;
        Ok(status == InstanceStatus::Running)
    }

    async fn get_logs(&self, instance_id: &str, tail: usize) -> Result<String> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let service_id = self.resolve_service_id(&instance).await?;
        let Some(deployment) = self.control.latest_deployment(&service_id).await? else {
            return Ok(String::new());
        };
        let lines = self.control.deployment_logs(&deployment.id, tail).await?;
        Ok(lines.join("\n"))
    }

    async fn update_config(&self, instance_id: &str, desired: &DesiredConfiguration) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            validate_desired(desired)?;
            let service_id = self.resolve_service_id(&instance).await?;
            let variables = self.service_variables(desired);
            with_cooldown_retry("upsert variables", &self.settings.retry, self.sleeper.as_ref(), || {
                self.control.upsert_variables(&service_id, &variables)
            })
            .await?;

            // Identity presence may have changed, so the start command is
            // refreshed along with the variables.
            let settings = self.instance_settings(desired, &variables);
            with_cooldown_retry("update service instance", &self.settings.retry, self.sleeper.as_ref(), || {
                self.control.update_service_instance(&service_id, &settings)
            })
            .await?;

            self.trigger_deploy(&service_id).await?;
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Deploying)
                .await
        }
        .await;
        self.ledger
            .record(&instance, LogAction::UpdateConfig, "configuration applied", result)
            .await
    }

    async fn get_service_url(&self, instance_id: &str) -> Result<Option<String>> {
        let instance = self.ledger.instances.require(instance_id).await?;
        Ok(instance
            .service_url
            .or_else(|| self.service_url(&instance.container_name)))
    }

    async fn get_access_url(&self, instance_id: &str) -> Result<Option<String>> {
        Ok(self.ledger.instances.require(instance_id).await?.access_url)
    }

    async fn wait_until_ready(&self, instance_id: &str) -> Result<Option<String>> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let service_id = self.resolve_service_id(&instance).await?;
        let started = Instant::now();
        let mut slept = Duration::ZERO;

        loop {
            if let Some(deployment) = self.control.latest_deployment(&service_id).await? {
                if is_terminal_success(&deployment.status) {
                    self.ledger
                        .instances
                        .record_health(&instance.id, InstanceStatus::Running)
                        .await?;
                    let refreshed = self.ledger.instances.require(&instance.id).await?;
                    return Ok(refreshed.access_url.or_else(|| {
                        deployment.static_url.map(|host| format!("https://{host}"))
                    }));
                }
                if is_terminal_failure(&deployment.status) {
                    let logs = self
                        .control
                        .deployment_logs(&deployment.id, self.settings.failure_log_lines)
                        .await
                        .unwrap_or_else(|error| vec![format!("failed to fetch logs: {error}")]);
                    self.ledger
                        .instances
                        .record_health(&instance.id, InstanceStatus::Error)
                        .await?;
                    return Err(DeployError::DeploymentFailed {
                        status: deployment.status.to_lowercase(),
                        logs,
                    }
                    .into());
                }
            }

            if started.elapsed().max(slept) >= self.settings.poll_timeout {
                return Err(DeployError::TimedOut {
                    secs: self.settings.poll_timeout.as_secs(),
                }
                .into());
            }
            self.sleeper.sleep(self.settings.poll_interval).await;
            slept += self.settings.poll_interval;
        }
    }
}
