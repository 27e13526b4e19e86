//! # taskbox
//!
//! **Sandboxed Compute Runtime Layer**
//!
//! Runs one job per container under CPU and memory limits on hosts whose
//! kernel may or may not run containers natively. On Linux the container
//! engine runs on the host; on Windows and macOS a VM (docker-machine or
//! Docker Desktop) hosts it and is kept sized to the configuration.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             taskbox                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                       Environment                           │    │
//! │  │   prepare() → runtime(payload) → update_config() → cleanup()│    │
//! │  │   allow-list │ config validation │ constraint reconciling   │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                 │                               │                   │
//! │  ┌──────────────┴──────────────┐   ┌────────────┴──────────────┐    │
//! │  │           Runtime           │   │     Hypervisor trait      │    │
//! │  │ prepare → start → stop →    │   │ setup │ quit │ constrain  │    │
//! │  │ clean_up; stdio; usage      │   │ restart_ctx │ recover_ctx │    │
//! │  └──────────────┬──────────────┘   └────────────┬──────────────┘    │
//! │                 │                               │                   │
//! │  ┌──────────────┴──────────────┐   ┌────────────┴──────────────┐    │
//! │  │    ContainerEngine trait    │   │     Command Executor      │    │
//! │  │   DockerEngine (bollard)    │   │ docker-machine, VBoxManage│    │
//! │  └─────────────────────────────┘   └───────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Hypervisor Backends                          │
//! │  ┌──────────┐  ┌────────────┐  ┌────────────┐  ┌────────────────┐   │
//! │  │  Native  │  │  Hyper-V   │  │ VirtualBox │  │ Docker Desktop │   │
//! │  │ (Linux)  │  │ (Windows)  │  │ (Win, Mac) │  │ current/legacy │   │
//! │  └──────────┘  └────────────┘  └────────────┘  └────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! - **Image allow-list**: only repositories in [`ALLOWED_IMAGES`] run; other
//!   images are refused before any engine call.
//! - **Bind confinement**: a bind source must lie inside a configured work
//!   dir; work dirs may not nest.
//! - **Resource floors**: VMs never get less than [`MIN_MEMORY_MB`] MiB or
//!   [`MIN_CPU_COUNT`] CPUs.
//! - **Timeouts**: every control-binary call is bounded (see [`constants`]).
//!
//! # Feature Flags
//!
//! - `tls`: TLS connections to docker-machine engines (`bollard/ssl`).
//!
//! # Example
//!
//! ```rust,ignore
//! use taskbox::{Encoding, Environment, EnvironmentConfig, RuntimePayload};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> taskbox::Result<()> {
//!     let config = EnvironmentConfig::new(vec!["/tmp/work".into()], 2048, 2);
//!     let env = Environment::detect(config)?;
//!     env.prepare().await?;
//!
//!     let payload = RuntimePayload::new("taskbox/base", "latest")
//!         .with_command(["echo", "hello"]);
//!     let runtime = env.runtime(payload, None).await?;
//!     runtime.prepare().await?;
//!     runtime.start().await?;
//!     runtime.wait_until_terminated().await;
//!
//!     let mut out = runtime.stdout(Encoding::Utf8).await?;
//!     while let Some(line) = out.next().await {
//!         println!("{}", line?);
//!     }
//!
//!     runtime.stop().await?;
//!     runtime.clean_up().await?;
//!     env.cleanup().await
//! }
//! ```

pub mod command;
pub mod config;
pub mod constants;
pub mod constraints;
pub mod engine;
pub mod environment;
pub mod error;
pub mod hypervisor;
pub mod platform;
pub mod runtime;

// Re-exports
pub use command::{CommandExecutor, CommandOutput, CommandRunner, SystemRunner};
pub use config::EnvironmentConfig;
pub use constants::*;
pub use constraints::{ConstraintKey, Constraints};
pub use engine::{
    BindMode, ContainerConfig, ContainerEngine, ContainerInspection, DockerEngine,
    EngineEndpoint, EngineState, HostConfig, OutputStream, StatsSample, VolumeBind,
};
pub use environment::{
    Environment, EnvironmentEvent, EnvironmentMetadata, EnvironmentStatus, EnvironmentSupport,
};
pub use error::{Error, Result};
pub use hypervisor::{
    DockerDesktop, HyperVMachine, Hypervisor, MemoryCapPolicy, NativeHypervisor, RecoveryStep,
    VirtualBoxMachine, first_available, hypervisor_candidates, select_available_hypervisor,
    select_hypervisor,
};
pub use platform::{Capability, Os, Platform};
pub use runtime::{
    DockerBind, Encoding, Runtime, RuntimeEvent, RuntimePayload, RuntimeStatus, RuntimeTunables,
    StdinSink, UsageCounters,
};
