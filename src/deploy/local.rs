//! Local backend driven through a container engine.
//!
//! The compiled runtime config is written to a host file and mounted
//! read-only; the engine has no config-blob primitive. There is no live
//! reload: configuration only takes effect when the process starts.

pub mod docker;

pub use docker::DockerEngine;

use super::retry::{Sleeper, TokioSleeper};
use super::start_command::{IDENTITY_FILES, identity_documents};
use super::{DeployOutcome, DeploymentProvider, Ledger, validate_desired};
use crate::compiler::{AGENT_NAME_VAR, GATEWAY_PORT, SYSTEM_PROMPT_VAR, compile};
use crate::deploy::remote::GATEWAY_TOKEN_VAR;
use crate::desired::DesiredConfiguration;
use crate::error::{DeployError, Result};
use crate::instances::{Instance, InstanceStatus, LogAction, reconcile_status, resource_name};

use anyhow::Context as _;
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Label holding a digest of the environment a container was created with.
pub const ENV_DIGEST_LABEL: &str = "berth.env-digest";

/// Env var recording the container-side workspace path.
const WORKSPACE_VAR: &str = "BERTH_WORKSPACE";

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    /// `host:container[:ro]` bind mounts.
    pub binds: Vec<String>,
    pub network: String,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub host_ip: String,
    pub host_port: i64,
    pub container_port: u16,
    pub labels: BTreeMap<String, String>,
}

/// What an inspect call reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    /// Engine state label, e.g. `running`, `exited`, `restarting`.
    pub status: String,
    pub running: bool,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Container engine operations used by [`LocalBackend`].
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    async fn ensure_network(&self, name: &str) -> Result<()>;
    async fn ensure_image(&self, image: &str) -> Result<()>;
    /// Create (not start) a container. Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn restart(&self, name: &str) -> Result<()>;
    /// Force-remove. `Ok(false)` when no such container exists.
    async fn remove(&self, name: &str) -> Result<bool>;
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>>;
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub image: String,
    pub network: String,
    /// Host root; per-user dirs live under `<root>/users/<user>/`.
    pub root: PathBuf,
    pub cpus: f64,
    pub memory_mb: i64,
    /// Host path of the bridge artifact, mounted read-only when set.
    pub bridge_path: Option<PathBuf>,
    pub bridge_mount: String,
    /// Where the runtime reads its config inside the container.
    pub config_mount: String,
    /// Env var telling the runtime where its config file is.
    pub config_path_var: String,
    pub host_ip: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub failure_log_lines: usize,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/openclaw/openclaw:latest".into(),
            network: "berth".into(),
            root: PathBuf::from("berth-data"),
            cpus: 1.0,
            memory_mb: 1024,
            bridge_path: None,
            bridge_mount: "/opt/berth/bridge.js".into(),
            config_mount: "/config/runtime.json".into(),
            config_path_var: "OPENCLAW_CONFIG_PATH".into(),
            host_ip: "127.0.0.1".into(),
            poll_interval: Duration::from_secs(3),
            poll_timeout: Duration::from_secs(120),
            failure_log_lines: 30,
        }
    }
}

/// Host directories for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDirs {
    pub config: PathBuf,
    pub workspace: PathBuf,
}

impl UserDirs {
    pub fn new(root: &Path, user_id: &str) -> Self {
        // The resource name is already filesystem-safe.
        let slot = resource_name(user_id);
        let base = root.join("users").join(slot.trim_start_matches("berth-"));
        Self {
            config: base.join("config"),
            workspace: base.join("workspace"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("runtime.json")
    }

    pub async fn ensure(&self) -> Result<()> {
        for dir in [&self.config, &self.workspace] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub struct LocalBackend {
    engine: Arc<dyn ContainerEngine>,
    ledger: Ledger,
    settings: LocalSettings,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    pub fn new(engine: Arc<dyn ContainerEngine>, ledger: Ledger, settings: LocalSettings) -> Self {
        Self {
            engine,
            ledger,
            settings,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn dirs(&self, instance: &Instance) -> UserDirs {
        UserDirs::new(&self.settings.root, &instance.user_id)
    }

    /// Write the runtime config and identity files to the host. Returns the
    /// container environment.
    async fn write_host_files(&self, dirs: &UserDirs, desired: &DesiredConfiguration) -> Result<Vec<String>> {
        dirs.ensure().await?;
        let compiled = compile(desired);

        let config_file = dirs.config_file();
        tokio::fs::write(&config_file, compiled.config_json())
            .await
            .with_context(|| format!("failed to write {}", config_file.display()))?;

        let documents = identity_documents(
            compiled.env.get(AGENT_NAME_VAR).map(String::as_str),
            compiled.env.get(SYSTEM_PROMPT_VAR).map(String::as_str),
        );
        for file_name in IDENTITY_FILES {
            let path = dirs.workspace.join(file_name);
            match documents.iter().find(|(name, _)| *name == file_name) {
                Some((_, contents)) => tokio::fs::write(&path, contents)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => {
                        return Err(anyhow::Error::new(error)
                            .context(format!("failed to remove {}", path.display()))
                            .into());
                    }
                },
            }
        }

        let mut env = compiled.env;
        env.insert(GATEWAY_TOKEN_VAR.into(), desired.gateway_token.clone());
        env.insert(
            self.settings.config_path_var.clone(),
            self.settings.config_mount.clone(),
        );
        env.insert(WORKSPACE_VAR.into(), desired.workspace.clone());
        Ok(env
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect())
    }

    fn container_spec(&self, instance: &Instance, dirs: &UserDirs, workspace: &str, env: Vec<String>) -> ContainerSpec {
        let mut binds = vec![
            format!("{}:{}:ro", dirs.config_file().display(), self.settings.config_mount),
            format!("{}:{}", dirs.workspace.display(), workspace),
        ];
        if let Some(bridge) = &self.settings.bridge_path {
            binds.push(format!("{}:{}:ro", bridge.display(), self.settings.bridge_mount));
        }

        ContainerSpec {
            name: instance.container_name.clone(),
            image: self.settings.image.clone(),
            binds,
            network: self.settings.network.clone(),
            nano_cpus: (self.settings.cpus * 1_000_000_000.0) as i64,
            memory_bytes: self.settings.memory_mb * 1024 * 1024,
            host_ip: self.settings.host_ip.clone(),
            host_port: instance.port,
            container_port: GATEWAY_PORT,
            labels: BTreeMap::from([
                ("berth.instance".to_string(), instance.id.clone()),
                ("berth.user".to_string(), instance.user_id.clone()),
                (ENV_DIGEST_LABEL.to_string(), env_digest(&env)),
            ]),
            env,
        }
    }

    /// Remove whatever sits at this name, then create and start a fresh one.
    async fn replace_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.engine.remove(&spec.name).await?;
        let container_id = self.engine.create(spec).await?;
        self.engine.start(&spec.name).await?;
        Ok(container_id)
    }

    /// Free the user's slot before a new row takes it. A container that
    /// survives removal is caught by [`Self::remove_orphan`] under the new row.
    async fn retire_previous(&self, user_id: &str) -> Result<()> {
        let Some(existing) = self.ledger.instances.get_by_user(user_id).await? else {
            return Ok(());
        };
        let removal = self.engine.remove(&existing.container_name).await;
        self.ledger.instances.delete(&existing.id).await?;
        match removal {
            Ok(_) => {
                self.ledger
                    .logs
                    .success(&existing, LogAction::Cleanup, "removed previous instance before redeploy")
                    .await
            }
            Err(error) => {
                tracing::warn!(instance_id = %existing.id, %error, "best-effort removal of previous container failed");
                self.ledger
                    .logs
                    .failure(
                        &existing,
                        LogAction::Cleanup,
                        "previous container left behind before redeploy",
                        &error.to_string(),
                    )
                    .await
            }
        }
    }

    async fn remove_orphan(&self, instance: &Instance) -> Result<()> {
        if !self.engine.remove(&instance.container_name).await? {
            return Ok(());
        }
        tracing::info!(name = %instance.container_name, "removed orphaned container");
        self.ledger
            .logs
            .success(
                instance,
                LogAction::Cleanup,
                format!("removed orphaned container {}", instance.container_name),
            )
            .await
    }

    async fn provision(&self, instance: &Instance, desired: &DesiredConfiguration) -> Result<DeployOutcome> {
        self.engine.ensure_network(&self.settings.network).await?;
        self.engine.ensure_image(&self.settings.image).await?;

        let dirs = self.dirs(instance);
        let env = self.write_host_files(&dirs, desired).await?;
        let spec = self.container_spec(instance, &dirs, &desired.workspace, env);

        let container_id = self.engine.create(&spec).await?;
        self.ledger
            .instances
            .set_container_id(&instance.id, &container_id)
            .await?;
        self.engine.start(&spec.name).await?;

        let service_url = format!("http://{}:{GATEWAY_PORT}", instance.container_name);
        let access_url = format!("http://{}:{}", self.settings.host_ip, instance.port);
        self.ledger
            .instances
            .set_urls(&instance.id, Some(&service_url), Some(&access_url))
            .await?;

        Ok(DeployOutcome {
            instance_id: instance.id.clone(),
            resource_id: Some(container_id),
            resource_name: instance.container_name.clone(),
            port: instance.port,
            access_url: Some(access_url),
            status: InstanceStatus::Deploying,
        })
    }

    /// Map an engine state label onto the internal state machine.
    fn reconcile(current: InstanceStatus, state: &ContainerState) -> InstanceStatus {
        if state.running {
            return reconcile_status(current, "success");
        }
        match state.status.as_str() {
            "created" | "restarting" => reconcile_status(current, "deploying"),
            "exited" | "dead" if current == InstanceStatus::Stopped => current,
            "exited" | "dead" => reconcile_status(current, "failed"),
            other => reconcile_status(current, other),
        }
    }
}

#[async_trait]
impl DeploymentProvider for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
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
            self.engine.start(&instance.container_name).await?;
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Running)
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
            self.engine.stop(&instance.container_name).await?;
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
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Restarting)
                .await?;
            self.engine.restart(&instance.container_name).await?;
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Running)
                .await
        }
        .await;
        self.ledger
            .record(&instance, LogAction::Restart, "restarted", result)
            .await
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            if !self.engine.remove(&instance.container_name).await? {
                tracing::info!(instance_id = %instance.id, "no container left to remove");
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
            let current = self
                .engine
                .inspect(&instance.container_name)
                .await?
                .ok_or_else(|| DeployError::ResourceNotFound {
                    name: instance.container_name.clone(),
                })?;

            // Same environment and host files, fresh container from the
            // current image.
            self.engine.ensure_image(&self.settings.image).await?;
            let dirs = self.dirs(&instance);
            let workspace = workspace_from_env(&current.env);
            let mut spec = self.container_spec(&instance, &dirs, &workspace, current.env);
            // Inspected env includes image defaults, so the digest of what
            // we originally passed is carried over instead of recomputed.
            if let Some(digest) = current.labels.get(ENV_DIGEST_LABEL) {
                spec.labels.insert(ENV_DIGEST_LABEL.to_string(), digest.clone());
            }
            let container_id = self.replace_container(&spec).await?;
            self.ledger
                .instances
                .set_container_id(&instance.id, &container_id)
                .await?;
            self.ledger
                .instances
                .set_status(&instance.id, InstanceStatus::Deploying)
                .await
        }
        .await;
        self.ledger
            .record(&instance, LogAction::Redeploy, "container recreated", result)
            .await
    }

    async fn check_health(&self, instance_id: &str) -> Result<bool> {
        let instance = self.ledger.instances.require(instance_id).await?;

        let status = match self.engine.inspect(&instance.container_name).await {
            Ok(Some(state)) => Self::reconcile(instance.status, &state),
            Ok(None) => {
                tracing::warn!(instance_id = %instance.id, "container is missing");
                InstanceStatus::Error
            }
            Err(error) => {
                tracing::warn!(instance_id = %instance.id, %error, "container inspect failed");
                return Ok(false);
            }
        };

        if let Err(error) = self.ledger.instances.record_health(&instance.id, status).await {
            tracing::warn!(instance_id = %instance.id, %error, "failed to record health");
        }
        Ok(status == InstanceStatus::Running)
    }

    async fn get_logs(&self, instance_id: &str, tail: usize) -> Result<String> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let lines = self.engine.logs(&instance.container_name, tail).await?;
        Ok(lines.join("\n"))
    }

    async fn update_config(&self, instance_id: &str, desired: &DesiredConfiguration) -> Result<()> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let result: Result<()> = async {
            validate_desired(desired)?;
            let dirs = self.dirs(&instance);
            let env = self.write_host_files(&dirs, desired).await?;

            // Container env is fixed at creation, so a changed secret set
            // needs a new container. Otherwise a restart re-reads the file.
            let digest = env_digest(&env);
            let current = self.engine.inspect(&instance.container_name).await?;
            let env_changed = current
                .as_ref()
                .is_none_or(|state| state.labels.get(ENV_DIGEST_LABEL) != Some(&digest));
            if env_changed {
                let spec = self.container_spec(&instance, &dirs, &desired.workspace, env);
                let container_id = self.replace_container(&spec).await?;
                self.ledger
                    .instances
                    .set_container_id(&instance.id, &container_id)
                    .await?;
            } else {
                self.engine.restart(&instance.container_name).await?;
            }
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
        Ok(self.ledger.instances.require(instance_id).await?.service_url)
    }

    async fn get_access_url(&self, instance_id: &str) -> Result<Option<String>> {
        Ok(self.ledger.instances.require(instance_id).await?.access_url)
    }

    async fn wait_until_ready(&self, instance_id: &str) -> Result<Option<String>> {
        let instance = self.ledger.instances.require(instance_id).await?;
        let started = Instant::now();
        let mut slept = Duration::ZERO;

        loop {
            match self.engine.inspect(&instance.container_name).await? {
                Some(state) if state.running => {
                    self.ledger
                        .instances
                        .record_health(&instance.id, InstanceStatus::Running)
                        .await?;
                    return Ok(instance.access_url.clone());
                }
                Some(state) if matches!(state.status.as_str(), "exited" | "dead") => {
                    let logs = self
                        .engine
                        .logs(&instance.container_name, self.settings.failure_log_lines)
                        .await
                        .unwrap_or_else(|error| vec![format!("failed to fetch logs: {error}")]);
                    self.ledger
                        .instances
                        .record_health(&instance.id, InstanceStatus::Error)
                        .await?;
                    return Err(DeployError::DeploymentFailed {
                        status: state.status,
                        logs,
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    return Err(DeployError::ResourceNotFound {
                        name: instance.container_name.clone(),
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

/// Order-insensitive digest of the env we pass at creation. The engine
/// merges image defaults into what inspect reports, so comparing the raw
/// lists cannot tell a removed key from an image-provided one.
fn env_digest(env: &[String]) -> String {
    let mut sorted: Vec<&str> = env.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    hex::encode(Sha256::digest(sorted.join("\n").as_bytes()))
}

/// Workspace path recovered from a container's runtime config env, falling
/// back to the default.
fn workspace_from_env(env: &[String]) -> String {
    env.iter()
        .find_map(|entry| entry.strip_prefix(WORKSPACE_VAR)?.strip_prefix('='))
        .map(str::to_string)
        .unwrap_or_else(crate::desired::default_workspace)
}
