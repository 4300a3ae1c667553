//! Docker engine client
//!
//! Talks to the local engine through bollard. Image builds go through the engine
//! CLI so the full build log can be captured and surfaced verbatim on failure.
//!
//! Engine errors are classified by HTTP status code, falling back to the message
//! text for the statuses that carry several meanings (409).

use super::{
    BuildRequest, ContainerFilter, ContainerRequest, ContainerState, ContainerSummary,
    ExecAttachment, ExecOutput, ExecRequest, ResourceClient,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::DateTime;
use futures::StreamExt;
use iso_foundation::{EngineErrorKind, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Container runtime CLI used for image builds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Get the CLI command for this runtime
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

fn engine_error(op: &str, err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => Error::engine(op, EngineErrorKind::classify(Some(status_code), &message), message),
        other => {
            let message = other.to_string();
            Error::engine(op, EngineErrorKind::classify(None, &message), message)
        }
    }
}

fn name_filter(key: &str, values: Vec<String>) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    if !values.is_empty() {
        filters.insert(key.to_string(), values);
    }
    filters
}

/// Split `repo[:tag]` for pulling; digests are passed through whole
fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.rfind(':') {
        Some(pos) => {
            let split = image.len() - last_segment.len() + pos;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

/// Resource client backed by the local Docker (or Docker-compatible) engine
#[derive(Debug, Clone)]
pub struct DockerClient {
    docker: Docker,
    runtime: ContainerRuntime,
}

impl DockerClient {
    /// Connect using the engine's local defaults (`DOCKER_HOST` or the unix socket)
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| engine_error("connect to engine", e))?;
        Ok(Self {
            docker,
            runtime: ContainerRuntime::default(),
        })
    }

    pub fn with_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Check the engine responds
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| engine_error("ping engine", e))
    }
}

#[async_trait]
impl ResourceClient for DockerClient {
    // ========================================================================
    // Images
    // ========================================================================

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = engine_error("inspect image", e);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<String> {
        let dockerfile = request.context.join(&request.dockerfile);
        info!("Building image: {}", request.tag);

        let output = Command::new(self.runtime.command())
            .arg("build")
            .arg("-f")
            .arg(&dockerfile)
            .arg("-t")
            .arg(&request.tag)
            .arg(&request.context)
            .output()
            .await
            .map_err(|e| {
                Error::engine(
                    "build image",
                    EngineErrorKind::Other,
                    format!("failed to run {}: {}", self.runtime.command(), e),
                )
            })?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(Error::engine("build image", EngineErrorKind::Other, log));
        }

        for line in log.lines() {
            debug!("{}", line);
        }
        Ok(log)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);
        let (from_image, tag) = split_image_ref(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let progress = self.docker.create_image(Some(options), None, None);
        futures::pin_mut!(progress);
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| engine_error("pull image", e))?;
            if let Some(status) = info.status {
                debug!("{}: {}", image, status);
            }
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(image, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| engine_error("remove image", e))
    }

    // ========================================================================
    // Containers
    // ========================================================================

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: filter.all,
            filters: name_filter("label", filter.labels.clone()),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| engine_error("list containers", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: ContainerState::from_engine(c.state.as_deref().unwrap_or_default()),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
                created: c.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            })
            .collect())
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &request.ports {
            let key = format!("{}/tcp", port.container);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.host.to_string()),
                });
        }

        let host_config = HostConfig {
            binds: (!request.binds.is_empty()).then(|| request.binds.clone()),
            auto_remove: Some(request.auto_remove),
            privileged: Some(request.privileged),
            extra_hosts: (!request.extra_hosts.is_empty()).then(|| request.extra_hosts.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        let networking_config = request.network.as_ref().map(|network| {
            let endpoint = EndpointSettings {
                aliases: (!request.aliases.is_empty()).then(|| request.aliases.clone()),
                ..Default::default()
            };
            NetworkingConfig {
                endpoints_config: HashMap::from([(network.clone(), endpoint)]),
            }
        });

        let config = Config {
            image: Some(request.image.clone()),
            cmd: (!request.cmd.is_empty()).then(|| request.cmd.clone()),
            env: Some(request.env.clone()),
            working_dir: request.working_dir.clone(),
            hostname: request.hostname.clone(),
            labels: Some(request.labels.clone().into_iter().collect()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| engine_error("create container", e))?;

        debug!("Created container {} ({})", request.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| engine_error("start container", e))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| engine_error("stop container", e))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| engine_error("remove container", e))
    }

    // ========================================================================
    // Exec
    // ========================================================================

    async fn create_exec(&self, container: &str, request: &ExecRequest) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(request.cmd.clone()),
            env: Some(request.env.clone()),
            working_dir: request.working_dir.clone(),
            tty: Some(request.tty),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(|e| engine_error("create exec", e))?;
        Ok(exec.id)
    }

    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<ExecAttachment> {
        let options = StartExecOptions {
            detach: false,
            tty,
            output_capacity: None,
        };

        match self
            .docker
            .start_exec(exec_id, Some(options))
            .await
            .map_err(|e| engine_error("attach exec", e))?
        {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|item| {
                        item.map(|chunk| match chunk {
                            LogOutput::StdOut { message } => ExecOutput::StdOut(message),
                            LogOutput::StdErr { message } => ExecOutput::StdErr(message),
                            LogOutput::Console { message } | LogOutput::StdIn { message } => {
                                ExecOutput::Console(message)
                            }
                        })
                        .map_err(|e| engine_error("read exec output", e))
                    })
                    .boxed();
                Ok(ExecAttachment { output, input })
            }
            StartExecResults::Detached => Err(Error::engine(
                "attach exec",
                EngineErrorKind::Other,
                "exec started detached",
            )),
        }
    }

    async fn resize_exec(&self, exec_id: &str, width: u16, height: u16) -> Result<()> {
        self.docker
            .resize_exec(exec_id, ResizeExecOptions { height, width })
            .await
            .map_err(|e| engine_error("resize exec", e))
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| engine_error("inspect exec", e))?;
        if inspect.running == Some(true) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    // ========================================================================
    // Networks
    // ========================================================================

    async fn list_networks(&self, unused_only: bool) -> Result<Vec<String>> {
        let filters = if unused_only {
            name_filter("dangling", vec!["true".to_string()])
        } else {
            HashMap::new()
        };

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| engine_error("list networks", e))?;

        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: name_filter("name", vec![name.to_string()]),
            }))
            .await
            .map_err(|e| engine_error("list networks", e))?;

        // The engine's name filter matches substrings
        Ok(networks.iter().any(|n| n.name.as_deref() == Some(name)))
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map(|_| ())
            .map_err(|e| engine_error("create network", e))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| engine_error("remove network", e))
    }

    async fn connect_network(&self, network: &str, container: &str, aliases: &[String]) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings {
                aliases: (!aliases.is_empty()).then(|| aliases.to_vec()),
                ..Default::default()
            },
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(|e| engine_error("connect network", e))
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    async fn list_volumes(&self, dangling_only: bool) -> Result<Vec<String>> {
        let filters = if dangling_only {
            name_filter("dangling", vec!["true".to_string()])
        } else {
            HashMap::new()
        };

        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
            .map_err(|e| engine_error("list volumes", e))?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = engine_error("inspect volume", e);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(|e| engine_error("create volume", e))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| engine_error("remove volume", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_command() {
        assert_eq!(ContainerRuntime::Docker.command(), "docker");
        assert_eq!(ContainerRuntime::Podman.command(), "podman");
        assert_eq!(ContainerRuntime::default(), ContainerRuntime::Docker);
    }

    #[test]
    fn test_split_image_ref() {
        assert_eq!(
            split_image_ref("postgres:16"),
            ("postgres".to_string(), "16".to_string())
        );
        assert_eq!(
            split_image_ref("redis"),
            ("redis".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_ref("localhost:5000/team/app"),
            ("localhost:5000/team/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_ref("localhost:5000/team/app:v2"),
            ("localhost:5000/team/app".to_string(), "v2".to_string())
        );
        assert_eq!(
            split_image_ref("alpine@sha256:abc"),
            ("alpine@sha256:abc".to_string(), String::new())
        );
    }

    #[test]
    fn test_engine_error_mapping() {
        let err = engine_error(
            "remove container",
            BollardError::DockerResponseServerError {
                status_code: 409,
                message: "removal of container abc is already in progress".to_string(),
            },
        );
        assert!(err.is_race_absorbable());

        let err = engine_error(
            "start container",
            BollardError::DockerResponseServerError {
                status_code: 500,
                message: "driver failed".to_string(),
            },
        );
        assert_eq!(err.engine_kind(), Some(EngineErrorKind::Other));
    }
}
