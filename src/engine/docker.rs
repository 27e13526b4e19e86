//! # Docker Engine - bollard client
//!
//! Implements [`ContainerEngine`] over the Docker API using `bollard`.
//!
//! ## Endpoint Resolution
//!
//! | Hypervisor kind      | Endpoint                                       |
//! |----------------------|------------------------------------------------|
//! | Native / daemon      | local socket (`connect_with_local_defaults`)   |
//! | docker-machine VM    | `tcp://<vm-ip>:2376` with the machine's certs  |
//!
//! The client is connected lazily on first use. When the endpoint comes
//! from a hypervisor it is resolved only then, because a driver-backed VM
//! has no address until it runs. [`ContainerEngine::reconnect`] drops the
//! cached client, e.g. after the hypervisor regenerated its certificates.
//!
//! TLS endpoints need the `tls` crate feature.

use super::{
    ByteStream, ContainerConfig, ContainerEngine, ContainerInspection, EngineState,
    OutputStream, StatsSample, StatsStream, StdinSocket,
};
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, ContainerStatsResponse,
    HostConfig as DockerHostConfig, PortBinding, PortMap, VolumeCreateOptions,
};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectContainerOptions, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::constants::CONTAINER_STOP_GRACE_SECS;

/// Request timeout handed to bollard (seconds).
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Where the Docker API lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEndpoint {
    /// Local socket / named pipe.
    Local,
    /// Remote daemon, typically inside a docker-machine VM.
    Tcp {
        /// `tcp://host:port`.
        host: String,
        /// Directory holding `key.pem`, `cert.pem` and `ca.pem`.
        cert_path: Option<PathBuf>,
    },
}

enum EndpointSource {
    Fixed(EngineEndpoint),
    Hypervisor(Arc<dyn Hypervisor>),
}

/// Docker implementation of [`ContainerEngine`].
pub struct DockerEngine {
    source: EndpointSource,
    client: RwLock<Option<Docker>>,
}

impl DockerEngine {
    /// Creates an engine talking to a fixed endpoint.
    pub fn new(endpoint: EngineEndpoint) -> Self {
        Self {
            source: EndpointSource::Fixed(endpoint),
            client: RwLock::new(None),
        }
    }

    /// Creates an engine whose endpoint is resolved from `hypervisor` on
    /// first use.
    pub fn for_hypervisor(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            source: EndpointSource::Hypervisor(hypervisor),
            client: RwLock::new(None),
        }
    }

    async fn client(&self) -> Result<Docker> {
        if let Some(docker) = self.client.read().await.as_ref() {
            return Ok(docker.clone());
        }

        let endpoint = match &self.source {
            EndpointSource::Fixed(endpoint) => endpoint.clone(),
            EndpointSource::Hypervisor(hypervisor) => hypervisor.engine_endpoint().await?,
        };
        let docker = connect(&endpoint)?;
        info!(endpoint = ?endpoint, "connected to container engine");

        *self.client.write().await = Some(docker.clone());
        Ok(docker)
    }
}

fn connect(endpoint: &EngineEndpoint) -> Result<Docker> {
    match endpoint {
        EngineEndpoint::Local => {
            Docker::connect_with_local_defaults().map_err(|e| Error::engine("connect", e))
        }
        EngineEndpoint::Tcp {
            host,
            cert_path: None,
        } => Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| Error::engine("connect", e)),
        EngineEndpoint::Tcp {
            host,
            cert_path: Some(certs),
        } => connect_tls(host, certs),
    }
}

#[cfg(feature = "tls")]
fn connect_tls(host: &str, certs: &std::path::Path) -> Result<Docker> {
    Docker::connect_with_ssl(
        host,
        &certs.join("key.pem"),
        &certs.join("cert.pem"),
        &certs.join("ca.pem"),
        DOCKER_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
    )
    .map_err(|e| Error::engine("connect", e))
}

#[cfg(not(feature = "tls"))]
fn connect_tls(host: &str, _certs: &std::path::Path) -> Result<Docker> {
    Err(Error::HypervisorUnavailable(format!(
        "engine at {host} requires TLS; build with the `tls` feature"
    )))
}

fn is_status(error: &BollardError, code: u16) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

fn engine_state(status: Option<&ContainerStateStatusEnum>) -> EngineState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => EngineState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => EngineState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => EngineState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => EngineState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => EngineState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => EngineState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => EngineState::Dead,
        _ => EngineState::Unknown,
    }
}

fn published_ports(ports: Option<&PortMap>) -> HashMap<u16, u16> {
    let Some(ports) = ports else {
        return HashMap::new();
    };

    ports
        .iter()
        .filter_map(|(key, bindings)| {
            let guest = key.split('/').next()?.parse::<u16>().ok()?;
            let host = bindings
                .as_ref()?
                .iter()
                .find_map(|b| b.host_port.as_deref()?.parse::<u16>().ok())?;
            Some((guest, host))
        })
        .collect()
}

fn stats_sample(stats: ContainerStatsResponse) -> StatsSample {
    let usage = stats.cpu_stats.and_then(|cpu| cpu.cpu_usage);
    StatsSample {
        cpu_total_ns: usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0),
        cpu_kernel_ns: usage
            .as_ref()
            .and_then(|u| u.usage_in_kernelmode)
            .unwrap_or(0),
        cpu_user_ns: usage.as_ref().and_then(|u| u.usage_in_usermode).unwrap_or(0),
        memory_bytes: stats.memory_stats.and_then(|m| m.usage).unwrap_or(0),
    }
}

fn create_body(config: &ContainerConfig) -> ContainerCreateBody {
    let port_key = |port: &u16| format!("{port}/tcp");

    let port_bindings: PortMap = config
        .host
        .published_ports
        .iter()
        .map(|port| {
            (
                port_key(port),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(String::new()),
                }]),
            )
        })
        .collect();

    let exposed_ports = config
        .host
        .published_ports
        .iter()
        .map(|port| (port_key(port), HashMap::new()))
        .collect::<HashMap<_, _>>();

    let env: Vec<String> = config
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    ContainerCreateBody {
        image: Some(config.image.clone()),
        cmd: (!config.command.is_empty()).then(|| config.command.clone()),
        env: (!env.is_empty()).then_some(env),
        user: config.user.clone(),
        working_dir: config.working_dir.clone(),
        open_stdin: Some(true),
        attach_stdin: Some(true),
        stdin_once: Some(false),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(DockerHostConfig {
            cpuset_cpus: Some(config.host.cpuset_cpus.clone()),
            memory: Some(i64::try_from(config.host.memory_bytes).unwrap_or(i64::MAX)),
            binds: Some(
                config
                    .host
                    .binds
                    .iter()
                    .map(|bind| bind.as_bind_spec())
                    .collect(),
            ),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..DockerHostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let docker = self.client().await?;
        debug!(name = %config.name, image = %config.image, "creating container");

        let response = docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&config.name).build()),
                create_body(config),
            )
            .await
            .map_err(|e| Error::CreateFailed {
                image: config.image.clone(),
                reason: e.to_string(),
            })?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let docker = self.client().await?;
        docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| Error::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let docker = self.client().await?;
        match docker
            .stop_container(
                id,
                Some(
                    StopContainerOptionsBuilder::new()
                        .t(CONTAINER_STOP_GRACE_SECS)
                        .build(),
                ),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(Error::StopFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let docker = self.client().await?;
        match docker
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(Error::ContainerNotFound(id.to_string())),
            Err(e) => Err(Error::RemoveFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspection> {
        let docker = self.client().await?;
        let info = match docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(e) if is_status(&e, 404) => return Err(Error::ContainerNotFound(id.to_string())),
            Err(e) => return Err(Error::engine("inspect_container", e)),
        };

        let state = info.state.as_ref();
        Ok(ContainerInspection {
            state: engine_state(state.and_then(|s| s.status.as_ref())),
            exit_code: state.and_then(|s| s.exit_code),
            ports: published_ports(
                info.network_settings
                    .as_ref()
                    .and_then(|n| n.ports.as_ref()),
            ),
        })
    }

    async fn stats(&self, id: &str) -> Result<StatsStream> {
        let docker = self.client().await?;
        let stream = docker
            .stats(id, Some(StatsOptionsBuilder::new().stream(true).build()))
            .map(|item| item.map(stats_sample).map_err(|e| Error::engine("stats", e)));
        Ok(stream.boxed())
    }

    async fn attach_stdin(&self, id: &str) -> Result<StdinSocket> {
        let docker = self.client().await?;
        let attached = docker
            .attach_container(
                id,
                Some(
                    AttachContainerOptionsBuilder::new()
                        .stdin(true)
                        .stream(true)
                        .build(),
                ),
            )
            .await
            .map_err(|e| Error::engine("attach_container", e))?;
        Ok(attached.input)
    }

    async fn logs(&self, id: &str, stream: OutputStream, follow: bool) -> Result<ByteStream> {
        let docker = self.client().await?;
        let options = LogsOptionsBuilder::new()
            .stdout(stream == OutputStream::Stdout)
            .stderr(stream == OutputStream::Stderr)
            .follow(follow)
            .build();

        let output = docker
            .logs(id, Some(options))
            .map(|item| {
                item.map(LogOutput::into_bytes)
                    .map_err(|e| Error::engine("logs", e))
            });
        Ok(output.boxed())
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        let docker = self.client().await?;
        debug!(volume = %name, driver = %driver, "creating volume");

        docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                driver: Some(driver.to_string()),
                driver_opts: Some(options.clone()),
                ..VolumeCreateOptions::default()
            })
            .await
            .map_err(|e| Error::engine("create_volume", e))?;
        Ok(())
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        let docker = self.client().await?;
        match docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(Error::engine("inspect_image", e)),
        }
    }

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()> {
        let docker = self.client().await?;
        info!(image = %repository, tag = %tag, "pulling image");

        docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(repository)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| Error::engine("pull_image", e))?;
        Ok(())
    }

    async fn reconnect(&self) {
        debug!("dropping cached engine client");
        *self.client.write().await = None;
    }
}
