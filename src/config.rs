//! Configuration loading and validation.
//!
//! Settings come from an optional TOML file; a handful of secrets and
//! deployment switches can be overridden from the environment (`BERTH_*`).

use crate::deploy::local::LocalSettings;
use crate::deploy::remote::RemoteSettings;
use crate::deploy::retry::RetryPolicy;
use crate::error::{ConfigError, Result};
use crate::instances::PortAllocator;
use crate::instances::ports::{DEFAULT_PORT_BASE, DEFAULT_PORT_LIMIT};

use anyhow::Context as _;
use base64::Engine as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Which backend runs instances. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Remote,
    Local,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "railway" => Some(BackendKind::Remote),
            "local" | "docker" => Some(BackendKind::Local),
            _ => None,
        }
    }
}

/// Berth configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path. Holds the SQLite database.
    pub data_dir: PathBuf,

    pub backend: BackendKind,

    /// Master secret for the storage cipher (usually from `BERTH_MASTER_KEY`).
    pub master_key: Option<String>,

    pub remote: RemoteConfig,

    pub local: LocalSettings,

    pub ports: PortAllocator,

    pub sync: SyncConfig,
}

/// Remote control-plane connection plus backend tuning.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub project_id: Option<String>,
    pub environment_id: Option<String>,
    /// File whose bytes are shipped base64-encoded as the bridge variable.
    pub bridge_file: Option<PathBuf>,
    pub settings: RemoteSettings,
}

/// Collaborators used while rebuilding configurations.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub memory_url: Option<String>,
    pub memory_token: Option<String>,
    /// Base URL instances call for named variable lookups.
    pub callback_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    backend: Option<String>,
    data_dir: Option<PathBuf>,
    master_key: Option<String>,
    #[serde(default)]
    remote: TomlRemote,
    #[serde(default)]
    local: TomlLocal,
    #[serde(default)]
    ports: TomlPorts,
    #[serde(default)]
    sync: TomlSync,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlRemote {
    endpoint: Option<String>,
    token: Option<String>,
    project_id: Option<String>,
    environment_id: Option<String>,
    image: Option<String>,
    entrypoint: Option<String>,
    internal_domain: Option<String>,
    bridge_file: Option<PathBuf>,
    max_restarts: Option<u32>,
    poll_interval_secs: Option<u64>,
    poll_timeout_secs: Option<u64>,
    failure_log_lines: Option<usize>,
    cooldown_step_secs: Option<u64>,
    cooldown_cap_secs: Option<u64>,
    cooldown_budget_secs: Option<u64>,
    transient_attempts: Option<usize>,
    transient_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlLocal {
    image: Option<String>,
    network: Option<String>,
    root: Option<PathBuf>,
    cpus: Option<f64>,
    memory_mb: Option<i64>,
    bridge_path: Option<PathBuf>,
    bridge_mount: Option<String>,
    host_ip: Option<String>,
    poll_interval_secs: Option<u64>,
    poll_timeout_secs: Option<u64>,
    failure_log_lines: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlPorts {
    base: Option<u16>,
    limit: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlSync {
    memory_url: Option<String>,
    memory_token: Option<String>,
    callback_base_url: Option<String>,
}

impl Config {
    /// Load from the default config file if it exists, else from defaults and
    /// the environment alone.
    pub fn load() -> Result<Self> {
        match Self::default_config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => Self::from_toml("", |key| std::env::var(key).ok()),
        }
    }

    /// Load from a specific config file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(source),
        })?;
        Self::from_toml(&content, |key| std::env::var(key).ok())
    }

    /// `~/.config/berth/config.toml` (platform equivalent).
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("berth").join("config.toml"))
    }

    /// Parse TOML and apply environment overrides from `env`.
    pub fn from_toml(content: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let toml: TomlConfig =
            toml::from_str(content).map_err(|error| ConfigError::Parse(error.to_string()))?;
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let backend_value = env("BERTH_BACKEND")
            .or(toml.backend)
            .unwrap_or_else(|| "local".into());
        let backend = BackendKind::parse(&backend_value).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "unknown backend '{backend_value}', expected 'remote' or 'local'"
            ))
        })?;

        let data_dir = env("BERTH_DATA_DIR")
            .map(PathBuf::from)
            .or(toml.data_dir)
            .or_else(|| dirs::data_dir().map(|dir| dir.join("berth")))
            .unwrap_or_else(|| PathBuf::from("./data"));

        let ports = resolve_ports(&toml.ports)?;
        let remote = resolve_remote(toml.remote, env("BERTH_CONTROL_PLANE_TOKEN"));
        let local = resolve_local(toml.local, &data_dir)?;

        Ok(Self {
            data_dir,
            backend,
            master_key: env("BERTH_MASTER_KEY").or(toml.master_key),
            remote,
            local,
            ports,
            sync: SyncConfig {
                memory_url: toml.sync.memory_url,
                memory_token: toml.sync.memory_token,
                callback_base_url: toml.sync.callback_base_url,
            },
        })
    }

    pub fn master_key(&self) -> Result<&str> {
        self.master_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey("BERTH_MASTER_KEY".into()).into())
    }

    /// Ensure the data directory exists.
    pub fn prepare_data_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("failed to create data directory: {}", self.data_dir.display())
        })?;
        Ok(())
    }
}

impl RemoteConfig {
    /// Token, project and environment; all three are needed to talk to the
    /// control plane.
    pub fn credentials(&self) -> Result<(&str, &str, &str)> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey("remote.token (or BERTH_CONTROL_PLANE_TOKEN)".into()))?;
        let project_id = self
            .project_id
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey("remote.project_id".into()))?;
        let environment_id = self
            .environment_id
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey("remote.environment_id".into()))?;
        Ok((token, project_id, environment_id))
    }

    /// Backend settings with the bridge artifact read and encoded.
    pub fn backend_settings(&self) -> Result<RemoteSettings> {
        let mut settings = self.settings.clone();
        if let Some(path) = &self.bridge_file {
            let bytes = std::fs::read(path).map_err(|source| ConfigError::Load {
                path: path.display().to_string(),
                source: Arc::new(source),
            })?;
            settings.bridge_b64 = Some(base64::engine::general_purpose::STANDARD.encode(bytes));
        }
        Ok(settings)
    }
}

fn resolve_ports(ports: &TomlPorts) -> Result<PortAllocator> {
    let base = ports.base.unwrap_or(DEFAULT_PORT_BASE);
    let limit = ports.limit.unwrap_or(DEFAULT_PORT_LIMIT);
    if base > limit {
        return Err(ConfigError::Invalid(format!(
            "ports.base ({base}) must not exceed ports.limit ({limit})"
        ))
        .into());
    }
    Ok(PortAllocator::new(base, limit))
}

fn resolve_remote(toml: TomlRemote, token_override: Option<String>) -> RemoteConfig {
    let defaults = RemoteSettings::default();
    let retry_defaults = RetryPolicy::default();
    let secs = Duration::from_secs;

    RemoteConfig {
        endpoint: toml
            .endpoint
            .unwrap_or_else(|| crate::control_plane::client::DEFAULT_ENDPOINT.to_string()),
        token: token_override.or(toml.token),
        project_id: toml.project_id,
        environment_id: toml.environment_id,
        bridge_file: toml.bridge_file,
        settings: RemoteSettings {
            image: toml.image.unwrap_or(defaults.image),
            entrypoint: toml.entrypoint.unwrap_or(defaults.entrypoint),
            internal_domain: toml.internal_domain.or(defaults.internal_domain),
            bridge_b64: None,
            max_restarts: toml.max_restarts.unwrap_or(defaults.max_restarts),
            poll_interval: toml.poll_interval_secs.map(secs).unwrap_or(defaults.poll_interval),
            poll_timeout: toml.poll_timeout_secs.map(secs).unwrap_or(defaults.poll_timeout),
            failure_log_lines: toml.failure_log_lines.unwrap_or(defaults.failure_log_lines),
            retry: RetryPolicy {
                cooldown_step: toml
                    .cooldown_step_secs
                    .map(secs)
                    .unwrap_or(retry_defaults.cooldown_step),
                cooldown_cap: toml
                    .cooldown_cap_secs
                    .map(secs)
                    .unwrap_or(retry_defaults.cooldown_cap),
                cooldown_budget: toml
                    .cooldown_budget_secs
                    .map(secs)
                    .unwrap_or(retry_defaults.cooldown_budget),
                transient_attempts: toml
                    .transient_attempts
                    .unwrap_or(retry_defaults.transient_attempts)
                    .max(1),
                transient_delay: toml
                    .transient_delay_secs
                    .map(secs)
                    .unwrap_or(retry_defaults.transient_delay),
            },
        },
    }
}

fn resolve_local(toml: TomlLocal, data_dir: &Path) -> Result<LocalSettings> {
    let defaults = LocalSettings::default();
    let cpus = toml.cpus.unwrap_or(defaults.cpus);
    if cpus.is_nan() || cpus <= 0.0 {
        return Err(ConfigError::Invalid(format!("local.cpus must be positive, got {cpus}")).into());
    }
    let memory_mb = toml.memory_mb.unwrap_or(defaults.memory_mb);
    if memory_mb <= 0 {
        return Err(ConfigError::Invalid(format!(
            "local.memory_mb must be positive, got {memory_mb}"
        ))
        .into());
    }

    Ok(LocalSettings {
        image: toml.image.unwrap_or(defaults.image),
        network: toml.network.unwrap_or(defaults.network),
        root: toml.root.unwrap_or_else(|| data_dir.join("instances")),
        cpus,
        memory_mb,
        bridge_path: toml.bridge_path,
        bridge_mount: toml.bridge_mount.unwrap_or(defaults.bridge_mount),
        host_ip: toml.host_ip.unwrap_or(defaults.host_ip),
        poll_interval: toml
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval),
        poll_timeout: toml
            .poll_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_timeout),
        failure_log_lines: toml.failure_log_lines.unwrap_or(defaults.failure_log_lines),
        ..defaults
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("", env(&[("BERTH_DATA_DIR", "/srv/berth")])).unwrap();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.data_dir, PathBuf::from("/srv/berth"));
        assert_eq!(config.local.root, PathBuf::from("/srv/berth/instances"));
        assert_eq!(config.ports, PortAllocator::default());
        assert_eq!(config.remote.settings.retry, RetryPolicy::default());
        assert!(config.master_key().is_err());
    }

    #[test]
    fn file_values_and_env_overrides() {
        let content = indoc! {r#"
            backend = "local"
            data_dir = "/var/lib/berth"
            master_key = "from-file"

            [remote]
            token = "file-token"
            project_id = "proj"
            environment_id = "env"
            poll_timeout_secs = 60
            cooldown_budget_secs = 90

            [local]
            network = "agents"
            cpus = 2.0
            memory_mb = 2048

            [ports]
            base = 21000
            limit = 21099

            [sync]
            memory_url = "http://memory.internal"
            callback_base_url = "https://berth.example/api"
        "#};

        let config = Config::from_toml(
            content,
            env(&[
                ("BERTH_BACKEND", "remote"),
                ("BERTH_CONTROL_PLANE_TOKEN", "env-token"),
                ("BERTH_MASTER_KEY", "from-env"),
            ]),
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Remote);
        assert_eq!(config.master_key().unwrap(), "from-env");
        assert_eq!(
            config.remote.credentials().unwrap(),
            ("env-token", "proj", "env")
        );
        assert_eq!(config.remote.settings.poll_timeout, Duration::from_secs(60));
        assert_eq!(
            config.remote.settings.retry.cooldown_budget,
            Duration::from_secs(90)
        );
        assert_eq!(config.local.network, "agents");
        assert_eq!(config.local.memory_mb, 2048);
        assert_eq!(config.local.root, PathBuf::from("/var/lib/berth/instances"));
        assert_eq!(config.ports, PortAllocator::new(21000, 21099));
        assert_eq!(config.sync.memory_url.as_deref(), Some("http://memory.internal"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let unknown_backend = Config::from_toml("backend = \"k8s\"", env(&[])).unwrap_err();
        assert!(unknown_backend.to_string().contains("unknown backend"));

        let inverted = Config::from_toml(
            indoc! {"
                [ports]
                base = 30000
                limit = 20000
            "},
            env(&[]),
        )
        .unwrap_err();
        assert!(inverted.to_string().contains("ports.base"));

        let typo = Config::from_toml("[remote]\nimgae = \"x\"\n", env(&[])).unwrap_err();
        assert!(matches!(typo, crate::Error::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_remote_credentials_name_the_key() {
        let config = Config::from_toml("", env(&[])).unwrap();
        let error = config.remote.credentials().unwrap_err();
        assert!(error.to_string().contains("BERTH_CONTROL_PLANE_TOKEN"));
    }

    #[test]
    fn bridge_file_is_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = dir.path().join("bridge.js");
        std::fs::write(&bridge, "hi").unwrap();

        let content = format!("[remote]\nbridge_file = {:?}\n", bridge.display().to_string());
        let config = Config::from_toml(&content, env(&[])).unwrap();
        let settings = config.remote.backend_settings().unwrap();
        assert_eq!(settings.bridge_b64.as_deref(), Some("aGk="));
    }
}
