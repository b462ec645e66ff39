//! Docker engine access through bollard.

use super::{ContainerEngine, ContainerSpec, ContainerState};
use crate::error::{DeployError, Result};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use futures::StreamExt as _;
use std::collections::HashMap;

/// Seconds Docker waits for a graceful shutdown before killing.
const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect through the platform default socket (or `DOCKER_HOST`).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(container_error)?;
        Ok(Self { docker })
    }
}

fn container_error(error: bollard::errors::Error) -> crate::Error {
    DeployError::Container(error.to_string()).into()
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Translate a spec into the engine's create payload.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let port_key = format!("{}/tcp", spec.container_port);

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some(spec.host_ip.clone()),
            host_port: Some(spec.host_port.to_string()),
        }]),
    );

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    let host_config = HostConfig {
        binds: Some(spec.binds.clone()),
        nano_cpus: Some(spec.nano_cpus),
        memory: Some(spec.memory_bytes),
        network_mode: Some(spec.network.clone()),
        port_bindings: Some(port_bindings),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        exposed_ports: Some(exposed_ports),
        labels: Some(
            spec.labels
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(error) if is_not_found(&error) => {}
            Err(error) => return Err(container_error(error)),
        }

        tracing::info!(network = name, "creating container network");
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(container_error)?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(error) if is_not_found(&error) => {}
            Err(error) => return Err(container_error(error)),
        }

        tracing::info!(image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(container_error)?;
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(container_error)?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, %warning, "container create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(container_error)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .map_err(container_error)
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.docker
            .restart_container(
                name,
                Some(RestartContainerOptions {
                    t: STOP_TIMEOUT_SECS as isize,
                }),
            )
            .await
            .map_err(container_error)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(error) if is_not_found(&error) => Ok(false),
            Err(error) => Err(container_error(error)),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>> {
        let response = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(error) if is_not_found(&error) => return Ok(None),
            Err(error) => return Err(container_error(error)),
        };

        let state = response.state.unwrap_or_default();
        let config = response.config.unwrap_or_default();
        Ok(Some(ContainerState {
            id: response.id.unwrap_or_default(),
            status: state
                .status
                .map(|status| status.to_string())
                .unwrap_or_default(),
            running: state.running.unwrap_or(false),
            env: config.env.unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
        }))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(container_error)?;
            lines.extend(chunk.to_string().lines().map(str::to_string));
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn config_publishes_gateway_on_host_port() {
        let spec = ContainerSpec {
            name: "berth-alice".into(),
            image: "agent:latest".into(),
            env: vec!["GATEWAY_TOKEN=t".into()],
            binds: vec!["/srv/users/alice/config/runtime.json:/config/runtime.json:ro".into()],
            network: "berth".into(),
            nano_cpus: 1_000_000_000,
            memory_bytes: 512 * 1024 * 1024,
            host_ip: "127.0.0.1".into(),
            host_port: 19000,
            container_port: 18789,
            labels: BTreeMap::from([("berth.user".to_string(), "alice".to_string())]),
        };

        let config = container_config(&spec);
        let host = config.host_config.expect("host config");
        let bindings = host.port_bindings.expect("port bindings");
        let binding = bindings["18789/tcp"].as_ref().expect("binding")[0].clone();
        assert_eq!(binding.host_port.as_deref(), Some("19000"));
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.network_mode.as_deref(), Some("berth"));
        assert_eq!(
            host.restart_policy.and_then(|policy| policy.name),
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(config.labels.unwrap()["berth.user"], "alice");
    }
}
