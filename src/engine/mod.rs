//! Container engine interface.
//!
//! This trait is the seam between the runtime layer and the container API
//! hosted by the hypervisor. It exposes exactly the calls a
//! [`Runtime`](crate::runtime::Runtime) and the hypervisors need:
//!
//! ```text
//! create(config) → start(id) → [inspect / stats / logs / attach] → stop(id) → remove(id)
//! ```
//!
//! plus volume creation (for network-shared binds) and image management.
//!
//! # Implementations
//!
//! - [`DockerEngine`]: the Docker API via `bollard`

pub mod docker;

pub use self::docker::{DockerEngine, EngineEndpoint};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncWrite;

// =============================================================================
// Container Configuration
// =============================================================================

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Read-write.
    #[default]
    Rw,
    /// Read-only.
    Ro,
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rw => write!(f, "rw"),
            Self::Ro => write!(f, "ro"),
        }
    }
}

/// A bind resolved for the engine.
///
/// `source` is whatever the engine understands for this backend: a host
/// path, a path inside the VM, or a named volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBind {
    /// Engine-side source (path or volume name).
    pub source: String,
    /// Mount point inside the container.
    pub target: String,
    /// Access mode.
    pub mode: BindMode,
}

impl VolumeBind {
    /// Returns the `source:target:mode` form used by the engine.
    pub fn as_bind_spec(&self) -> String {
        format!("{}:{}:{}", self.source, self.target, self.mode)
    }
}

/// Host-level limits and mounts of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// CPU set, e.g. `"0-3"`.
    pub cpuset_cpus: String,
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// Resolved binds.
    pub binds: Vec<VolumeBind>,
    /// Container ports to publish on an engine-chosen host port.
    pub published_ports: Vec<u16>,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name.
    pub name: String,
    /// Image reference (`repository:tag`).
    pub image: String,
    /// Command override (empty = image default).
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// User to run as.
    pub user: Option<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Host configuration.
    pub host: HostConfig,
}

// =============================================================================
// Inspection
// =============================================================================

/// Container status as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl EngineState {
    /// Returns true once the container's main process is gone.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspection {
    /// Engine status.
    pub state: EngineState,
    /// Exit code of the main process, once exited.
    pub exit_code: Option<i64>,
    /// Published ports: container port → host port.
    pub ports: HashMap<u16, u16>,
}

/// One resource usage sample.
///
/// CPU figures are cumulative nanoseconds since container start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSample {
    pub cpu_total_ns: u64,
    pub cpu_kernel_ns: u64,
    pub cpu_user_ns: u64,
    pub memory_bytes: u64,
}

/// Which output stream of a container to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Raw output bytes of a container.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Continuous stats samples of a container.
pub type StatsStream = BoxStream<'static, Result<StatsSample>>;

/// Writable end of a container's standard input.
pub type StdinSocket = Pin<Box<dyn AsyncWrite + Send>>;

// =============================================================================
// Container Engine Trait
// =============================================================================

/// Container API hosted by a hypervisor.
///
/// Implementations must be `Send + Sync`; one engine is shared by the
/// environment and every runtime it produces.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates a container and returns its id.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stops a running container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Removes a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Inspects a container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspection>;

    /// Opens a continuous stats stream.
    async fn stats(&self, id: &str) -> Result<StatsStream>;

    /// Attaches to the container's standard input.
    async fn attach_stdin(&self, id: &str) -> Result<StdinSocket>;

    /// Reads an output stream; `follow` keeps the stream open while the
    /// container runs.
    async fn logs(&self, id: &str, stream: OutputStream, follow: bool) -> Result<ByteStream>;

    /// Creates a named volume.
    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        options: &HashMap<String, String>,
    ) -> Result<()>;

    /// Returns true if `image` (`repository:tag`) is present locally.
    async fn has_image(&self, image: &str) -> Result<bool>;

    /// Pulls `repository:tag`.
    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()>;

    /// Drops any cached connection; the next call reconnects.
    async fn reconnect(&self) {}
}
