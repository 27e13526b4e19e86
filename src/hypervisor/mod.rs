//! # Hypervisor Abstraction
//!
//! A hypervisor hosts the container engine. On Linux the engine runs on the
//! host kernel and the hypervisor is a no-op; elsewhere a VM (or a desktop
//! daemon wrapping one) must be created, sized, and kept reachable.
//!
//! ## Backends
//!
//! | Backend                          | Kind           | Host OS        | Priority  |
//! |----------------------------------|----------------|----------------|-----------|
//! | [`NativeHypervisor`]             | no-op          | Linux          | only      |
//! | [`HyperVMachine`]                | docker-machine | Windows        | preferred |
//! | [`VirtualBoxMachine`]            | docker-machine | Windows, macOS | fallback  |
//! | [`DockerDesktop::current`]       | daemon         | macOS          | preferred |
//! | [`DockerDesktop::legacy`]        | daemon         | macOS          | fallback  |
//!
//! [`select_available_hypervisor`] walks the backends the platform advertises
//! in priority order and keeps the first whose [`Hypervisor::is_available`]
//! probe passes. Selection happens once; the result is shared as
//! `Arc<dyn Hypervisor>` for the process lifetime.
//!
//! ## Scoped Operations
//!
//! Reconfiguring a VM usually needs it stopped. [`Hypervisor::restart_ctx`]
//! takes the work as a lazy future and guarantees the VM is running again
//! afterwards:
//!
//! ```text
//! restart_ctx(body):   running? ──yes──► stop ──┐
//!                         │no                   │
//!                         └─────────────────────┴──► body.await ──► setup()
//!
//! recover_ctx(body):   restart_ctx(body) ──► reachable? ──yes──► done
//!                                                 │no
//!                                                 ▼
//!                        regenerate-certs ─► restart ─► recreate
//!                        (re-verified after each rung; RecoveryFailed if none helps)
//! ```
//!
//! ## Failure Semantics
//!
//! Read paths (`vm_running`, `constraints`) never fail: they degrade to
//! `false` / empty and log a warning. Mutating paths propagate errors.

pub mod desktop;
pub mod hyperv;
pub mod machine;
pub mod native;
pub mod virtualbox;

pub use self::desktop::{DesktopLayout, DockerDesktop};
pub use self::hyperv::{HyperVDriver, HyperVMachine, SmbCredentials};
pub use self::machine::{DockerMachine, MachineDriver};
pub use self::native::NativeHypervisor;
pub use self::virtualbox::{VirtualBoxDriver, VirtualBoxMachine};

use crate::command::CommandRunner;
use crate::constants::{CONTAINER_NAME_PREFIX, DEFAULT_VM_NAME, MIN_MEMORY_MB};
use crate::constraints::{ConstraintKey, Constraints};
use crate::engine::{ContainerEngine, EngineEndpoint, VolumeBind};
use crate::error::{Error, Result};
use crate::platform::{Capability, Os, Platform};
use crate::runtime::DockerBind;
use async_trait::async_trait;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Recovery
// =============================================================================

/// One rung of the recovery ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryStep {
    /// Regenerate the engine's TLS credentials.
    RegenerateCerts,
    /// Stop and start the VM.
    Restart,
    /// Remove and create the VM from scratch.
    Recreate,
}

impl RecoveryStep {
    /// Rungs in the order they are tried, least disruptive first.
    pub const LADDER: [RecoveryStep; 3] = [
        RecoveryStep::RegenerateCerts,
        RecoveryStep::Restart,
        RecoveryStep::Recreate,
    ];
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegenerateCerts => write!(f, "regenerate-certs"),
            Self::Restart => write!(f, "restart"),
            Self::Recreate => write!(f, "recreate"),
        }
    }
}

// =============================================================================
// Memory Cap Policy
// =============================================================================

/// Decides how much memory a VM may actually be given.
pub trait MemoryCapPolicy: Send + Sync {
    /// Returns the memory (MiB) to apply for a `requested_mb` request.
    fn cap(&self, requested_mb: u64) -> u64;
}

/// Default policy: only enforces the memory floor.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloorPolicy;

impl MemoryCapPolicy for FloorPolicy {
    fn cap(&self, requested_mb: u64) -> u64 {
        requested_mb.max(MIN_MEMORY_MB)
    }
}

/// Clamps memory into `[MIN_MEMORY_MB, ceiling_mb]`.
#[derive(Debug, Clone, Copy)]
pub struct CeilingPolicy {
    /// Upper bound in MiB, typically derived from host memory.
    pub ceiling_mb: u64,
}

impl MemoryCapPolicy for CeilingPolicy {
    fn cap(&self, requested_mb: u64) -> u64 {
        requested_mb.min(self.ceiling_mb).max(MIN_MEMORY_MB)
    }
}

/// Applies `policy` to the memory entry of `limits`.
pub fn apply_memory_cap(
    policy: &dyn MemoryCapPolicy,
    vm: &str,
    limits: &Constraints,
) -> Constraints {
    let Some(requested) = limits.memory_size() else {
        return limits.clone();
    };

    let capped = policy.cap(requested);
    if capped < requested {
        warn!(
            vm = %vm,
            requested_mb = requested,
            applied_mb = capped,
            "memory request exceeds the host cap, shrinking"
        );
    }
    limits.clone().with(ConstraintKey::MemorySize, capped)
}

// =============================================================================
// Hypervisor Trait
// =============================================================================

/// A host virtualization backend hosting the container engine.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. One instance exists per VM name
/// and is shared by the environment and every runtime.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Backend name, e.g. `"virtualbox"`.
    fn name(&self) -> &'static str;

    /// Name of the managed VM.
    fn vm_name(&self) -> &str;

    /// Side-effect-free availability probe.
    fn is_available(&self) -> bool;

    /// Ensures the VM exists and runs. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Stops the VM unconditionally (the caller checked it runs).
    async fn stop_vm(&self) -> Result<()>;

    /// Stops the VM if it is running; safe when already stopped.
    async fn quit(&self) -> Result<()> {
        if self.vm_running().await {
            self.stop_vm().await?;
        }
        Ok(())
    }

    /// Returns true if the VM runs. Degrades to `false` on error.
    async fn vm_running(&self) -> bool;

    /// Returns true if the container engine inside the VM answers.
    async fn reachable(&self) -> bool {
        self.vm_running().await
    }

    /// Queries the live constraints. Degrades to an empty set on error.
    async fn constraints(&self) -> Constraints;

    /// Applies a complete constraint set.
    async fn constrain(&self, limits: &Constraints) -> Result<()>;

    /// Replaces the set of host directories shared with the VM.
    async fn update_work_dirs(&self, dirs: &[PathBuf]) -> Result<()>;

    /// Resolves host binds into engine binds.
    ///
    /// Fails with [`Error::InvalidBind`] for a source outside every shared
    /// work dir.
    async fn create_volumes(
        &self,
        engine: &dyn ContainerEngine,
        binds: &[DockerBind],
    ) -> Result<Vec<VolumeBind>>;

    /// Returns the host address and port a published container port is
    /// reachable at.
    async fn get_port_mapping(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        guest_port: u16,
    ) -> Result<(String, u16)> {
        let port = published_port(engine, container_id, guest_port).await?;
        Ok(("127.0.0.1".to_string(), port))
    }

    /// Where the container engine API of this backend lives.
    async fn engine_endpoint(&self) -> Result<EngineEndpoint> {
        Ok(EngineEndpoint::Local)
    }

    /// Executes one recovery rung.
    ///
    /// The default only knows how to restart; backends with credentials
    /// or recreatable VMs override it.
    async fn recovery_step(&self, step: RecoveryStep) -> Result<()> {
        match step {
            RecoveryStep::Restart => {
                self.quit().await?;
                self.setup().await
            }
            RecoveryStep::RegenerateCerts | RecoveryStep::Recreate => Ok(()),
        }
    }

    /// Runs `body` with the VM stopped, then brings the VM up again.
    ///
    /// The VM is set up again even when `body` fails; the body's error is
    /// returned after that.
    async fn restart_ctx<'a>(
        &'a self,
        name: &'a str,
        body: BoxFuture<'a, Result<()>>,
    ) -> Result<()> {
        if self.vm_running().await {
            info!(vm = %name, "stopping VM for reconfiguration");
            self.stop_vm().await?;
        }

        let outcome = body.await;
        if let Err(e) = &outcome {
            warn!(vm = %name, error = %e, "reconfiguration failed, restarting VM anyway");
        }

        self.setup().await?;
        info!(vm = %name, "VM running after reconfiguration");
        outcome
    }

    /// Walks the recovery ladder until the engine is reachable.
    async fn recover(&self, name: &str) -> Result<()> {
        if self.reachable().await {
            return Ok(());
        }

        let mut reason = String::from("engine unreachable");
        for step in RecoveryStep::LADDER {
            warn!(vm = %name, step = %step, "engine unreachable, attempting recovery");
            match self.recovery_step(step).await {
                Ok(()) if self.reachable().await => {
                    info!(vm = %name, step = %step, "recovered");
                    return Ok(());
                }
                Ok(()) => reason = format!("still unreachable after {step}"),
                Err(e) => {
                    warn!(vm = %name, step = %step, error = %e, "recovery step failed");
                    reason = format!("{step}: {e}");
                }
            }
        }

        Err(Error::RecoveryFailed {
            vm: name.to_string(),
            reason,
        })
    }

    /// Like [`Hypervisor::restart_ctx`], then recovers if the engine does
    /// not answer afterwards.
    async fn recover_ctx<'a>(
        &'a self,
        name: &'a str,
        body: BoxFuture<'a, Result<()>>,
    ) -> Result<()> {
        let outcome = self.restart_ctx(name, body).await;
        self.recover(name).await?;
        outcome
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Backends `platform` advertises, in priority order.
///
/// | OS      | Order                                           |
/// |---------|-------------------------------------------------|
/// | Linux   | native                                          |
/// | Windows | Hyper-V, VirtualBox                             |
/// | macOS   | Docker Desktop, legacy Docker Desktop, VirtualBox |
///
/// Driver-backed VMs additionally need `docker-machine`.
pub fn hypervisor_candidates(
    platform: &Platform,
    runner: Arc<dyn CommandRunner>,
) -> Result<Vec<Arc<dyn Hypervisor>>> {
    let machine_ready = platform.has(Capability::DockerMachine);
    let mut candidates: Vec<Arc<dyn Hypervisor>> = Vec::new();

    match platform.os {
        Os::Linux => {
            if platform.has(Capability::NativeEngine) {
                candidates.push(Arc::new(NativeHypervisor::new()));
            }
        }
        Os::Windows => {
            if machine_ready && platform.has(Capability::HyperV) {
                candidates.push(Arc::new(HyperVMachine::hyperv(
                    DEFAULT_VM_NAME,
                    Arc::clone(&runner),
                )));
            }
            if machine_ready && platform.has(Capability::VirtualBox) {
                candidates.push(Arc::new(VirtualBoxMachine::virtualbox(DEFAULT_VM_NAME, runner)));
            }
        }
        Os::Darwin => {
            if platform.has(Capability::DockerDesktop) {
                candidates.push(Arc::new(DockerDesktop::current(Arc::clone(&runner))));
            }
            if platform.has(Capability::LegacyDockerDesktop) {
                candidates.push(Arc::new(DockerDesktop::legacy(Arc::clone(&runner))));
            }
            if machine_ready && platform.has(Capability::VirtualBox) {
                candidates.push(Arc::new(VirtualBoxMachine::virtualbox(DEFAULT_VM_NAME, runner)));
            }
        }
        Os::Unknown => {
            return Err(Error::UnsupportedPlatform(platform.os.to_string()));
        }
    }

    Ok(candidates)
}

/// Picks the highest-priority backend `platform` advertises.
///
/// Works from the capabilities alone, so an explicit [`Platform`] describes
/// any host. See [`select_available_hypervisor`] for the probed variant.
pub fn select_hypervisor(
    platform: &Platform,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn Hypervisor>> {
    let candidates = hypervisor_candidates(platform, runner)?;
    chosen(platform, candidates.into_iter().next())
}

/// Picks the highest-priority backend whose [`Hypervisor::is_available`]
/// probe passes on this host.
pub fn select_available_hypervisor(
    platform: &Platform,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn Hypervisor>> {
    let candidates = hypervisor_candidates(platform, runner)?;
    chosen(platform, first_available(candidates))
}

/// First candidate whose availability probe passes.
pub fn first_available(
    candidates: impl IntoIterator<Item = Arc<dyn Hypervisor>>,
) -> Option<Arc<dyn Hypervisor>> {
    candidates.into_iter().find(|candidate| {
        let available = candidate.is_available();
        if !available {
            debug!(backend = candidate.name(), "backend advertised but not available");
        }
        available
    })
}

fn chosen(platform: &Platform, hypervisor: Option<Arc<dyn Hypervisor>>) -> Result<Arc<dyn Hypervisor>> {
    match hypervisor {
        Some(hypervisor) => {
            info!(
                backend = hypervisor.name(),
                vm = %hypervisor.vm_name(),
                "selected hypervisor"
            );
            Ok(hypervisor)
        }
        None => Err(Error::HypervisorUnavailable(format!(
            "no usable backend on {platform}"
        ))),
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Stable share / volume name for a host path.
pub fn share_name(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    format!("{CONTAINER_NAME_PREFIX}{}", hex::encode(&digest[..8]))
}

fn normalized(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Finds the work dir containing `source`.
///
/// Returns the work dir and the path of `source` relative to it.
pub(crate) fn resolve_share(work_dirs: &[PathBuf], source: &Path) -> Result<(PathBuf, PathBuf)> {
    let source = normalized(source);
    work_dirs
        .iter()
        .map(|dir| normalized(dir))
        .find_map(|dir| {
            let relative = source.strip_prefix(&dir).ok()?.to_path_buf();
            Some((dir, relative))
        })
        .ok_or_else(|| Error::InvalidBind {
            path: source.clone(),
            reason: "not inside any shared work dir".to_string(),
        })
}

/// Resolves binds for backends that share the host filesystem as-is.
pub(crate) fn pass_through(work_dirs: &[PathBuf], binds: &[DockerBind]) -> Result<Vec<VolumeBind>> {
    binds
        .iter()
        .map(|bind| {
            resolve_share(work_dirs, &bind.source)?;
            let source = normalized(&bind.source).to_string_lossy().into_owned();
            Ok(volume_bind(source, bind))
        })
        .collect()
}

/// Joins a relative host path onto a POSIX base inside the VM.
pub(crate) fn guest_path(base: &str, relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .fold(base.trim_end_matches('/').to_string(), |acc, part| {
            format!("{acc}/{part}")
        })
}

/// Looks up the host port a container port is published on.
pub(crate) async fn published_port(
    engine: &dyn ContainerEngine,
    container_id: &str,
    guest_port: u16,
) -> Result<u16> {
    let inspection = engine.inspect_container(container_id).await?;
    inspection
        .ports
        .get(&guest_port)
        .copied()
        .ok_or_else(|| {
            Error::engine(
                "port_mapping",
                format!("port {guest_port} of container {container_id} is not published"),
            )
        })
}

/// Engine bind for `bind` with a backend-specific source.
pub(crate) fn volume_bind(source: String, bind: &DockerBind) -> VolumeBind {
    VolumeBind {
        source,
        target: bind.target.clone(),
        mode: bind.mode,
    }
}
