//! # docker-machine backed hypervisors
//!
//! [`DockerMachine`] drives one named VM through the `docker-machine` CLI.
//! Everything that depends on the VM driver (reading and writing CPU and
//! memory, sharing host directories, resolving binds) lives behind
//! [`MachineDriver`].
//!
//! ## Verbs and Timeouts
//!
//! | Verb                          | Timeout              |
//! |-------------------------------|----------------------|
//! | `status`, `ls`, `ip`, `env`, `inspect` | `POWER_TIMEOUT` |
//! | `start`, `stop`               | `POWER_TIMEOUT`      |
//! | `create`, `regenerate-certs`, `rm`, `ssh` | `COMMAND_TIMEOUT` |
//!
//! ## Pending Constraints
//!
//! Constraints applied before the VM exists are remembered and passed as
//! driver flags to `create`.

use super::{
    Hypervisor, MemoryCapPolicy, FloorPolicy, RecoveryStep, apply_memory_cap, published_port,
};
use crate::command::{CommandExecutor, CommandRunner};
use crate::constants::{COMMAND_TIMEOUT, POWER_TIMEOUT};
use crate::constraints::{Constraints, complete};
use crate::engine::{ContainerEngine, EngineEndpoint, VolumeBind};
use crate::error::{Error, Result};
use crate::platform::find_on_path;
use crate::runtime::DockerBind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[cfg(windows)]
const MACHINE_BINARY: &str = "docker-machine.exe";
#[cfg(not(windows))]
const MACHINE_BINARY: &str = "docker-machine";

// =============================================================================
// Machine State
// =============================================================================

/// VM state as printed by `docker-machine status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Paused,
    Saved,
    Stopped,
    Stopping,
    Starting,
    Error,
    Timeout,
    Unknown,
}

impl MachineState {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "Running" => Self::Running,
            "Paused" => Self::Paused,
            "Saved" => Self::Saved,
            "Stopped" => Self::Stopped,
            "Stopping" => Self::Stopping,
            "Starting" => Self::Starting,
            "Error" => Self::Error,
            "Timeout" => Self::Timeout,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// =============================================================================
// Machine Control
// =============================================================================

/// The `docker-machine` CLI bound to one VM.
#[derive(Debug, Clone)]
pub struct MachineControl {
    vm: String,
    exec: CommandExecutor,
}

impl MachineControl {
    /// Binds `docker-machine` to `vm`.
    pub fn new(vm: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            vm: vm.into(),
            exec: CommandExecutor::new(MACHINE_BINARY, runner),
        }
    }

    /// VM name.
    pub fn vm(&self) -> &str {
        &self.vm
    }

    /// Returns true if the VM is known to docker-machine.
    pub async fn exists(&self) -> Result<bool> {
        let names = self.exec.run(&["ls", "-q"], POWER_TIMEOUT).await?;
        Ok(names.lines().any(|line| line.trim() == self.vm))
    }

    /// Current VM state, `None` if it cannot be queried.
    pub async fn status(&self) -> Option<MachineState> {
        self.exec
            .query(&["status", &self.vm], POWER_TIMEOUT)
            .await
            .map(|out| MachineState::parse(&out))
    }

    /// Creates the VM with `driver` and driver-specific flags.
    pub async fn create(&self, driver: &str, driver_args: &[String]) -> Result<()> {
        let mut args = vec!["create".to_string(), "--driver".to_string(), driver.to_string()];
        args.extend(driver_args.iter().cloned());
        args.push(self.vm.clone());
        self.exec.run(&args, COMMAND_TIMEOUT).await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.exec.run(&["start", &self.vm], POWER_TIMEOUT).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.exec.run(&["stop", &self.vm], POWER_TIMEOUT).await?;
        Ok(())
    }

    /// Removes the VM and its disk.
    pub async fn rm(&self) -> Result<()> {
        self.exec
            .run(&["rm", "-f", "-y", &self.vm], COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn regenerate_certs(&self) -> Result<()> {
        self.exec
            .run(&["regenerate-certs", "--force", &self.vm], COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    /// IP address of the VM.
    pub async fn ip(&self) -> Result<String> {
        self.exec.run(&["ip", &self.vm], POWER_TIMEOUT).await
    }

    /// Name of the driver the VM was created with.
    pub async fn driver_name(&self) -> Option<String> {
        self.exec
            .query(
                &["inspect", "--format", "{{.DriverName}}", &self.vm],
                POWER_TIMEOUT,
            )
            .await
    }

    /// Engine connection variables printed by `docker-machine env`.
    pub async fn env(&self) -> Result<HashMap<String, String>> {
        let out = self
            .exec
            .run(&["env", "--shell", "bash", &self.vm], POWER_TIMEOUT)
            .await?;
        Ok(parse_env(&out))
    }

    /// Runs a shell command inside the VM.
    pub async fn ssh(&self, command: &str) -> Result<String> {
        self.exec
            .run(&["ssh", &self.vm, command], COMMAND_TIMEOUT)
            .await
    }
}

/// Parses `export KEY="VALUE"` lines.
fn parse_env(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().strip_prefix("export ")?;
            let (key, value) = line.split_once('=')?;
            Some((key.to_string(), value.trim_matches('"').to_string()))
        })
        .collect()
}

// =============================================================================
// Driver Trait
// =============================================================================

/// VM-driver specific parts of a docker-machine hypervisor.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    /// docker-machine driver name, e.g. `"virtualbox"`.
    fn driver_name(&self) -> &'static str;

    /// Returns true if the driver's host tooling is installed.
    fn is_available(&self) -> bool;

    /// Extra `docker-machine create` flags for `limits`.
    fn create_args(&self, limits: &Constraints) -> Vec<String>;

    /// Reads CPU count and memory of an existing VM.
    async fn read_constraints(&self, vm: &str) -> Result<Constraints>;

    /// Writes CPU count and memory. The VM is stopped.
    async fn write_constraints(&self, vm: &str, limits: &Constraints) -> Result<()>;

    /// Makes exactly `dirs` available to the VM.
    async fn sync_shares(
        &self,
        machine: &MachineControl,
        dirs: &[PathBuf],
        running: bool,
    ) -> Result<()>;

    /// Resolves host binds into engine binds.
    async fn create_volumes(
        &self,
        machine: &MachineControl,
        engine: &dyn ContainerEngine,
        work_dirs: &[PathBuf],
        binds: &[DockerBind],
    ) -> Result<Vec<VolumeBind>>;
}

// =============================================================================
// Docker Machine Hypervisor
// =============================================================================

/// Hypervisor backed by a docker-machine VM.
pub struct DockerMachine<D> {
    control: MachineControl,
    driver: D,
    work_dirs: Mutex<Vec<PathBuf>>,
    pending: Mutex<Constraints>,
    memory_cap: Arc<dyn MemoryCapPolicy>,
}

impl<D: MachineDriver> DockerMachine<D> {
    /// Creates a hypervisor for `vm` using `driver`.
    pub fn new(vm: impl Into<String>, driver: D, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            control: MachineControl::new(vm, runner),
            driver,
            work_dirs: Mutex::new(Vec::new()),
            pending: Mutex::new(Constraints::new()),
            memory_cap: Arc::new(FloorPolicy),
        }
    }

    /// Replaces the memory cap policy.
    #[must_use]
    pub fn with_memory_cap(mut self, policy: Arc<dyn MemoryCapPolicy>) -> Self {
        self.memory_cap = policy;
        self
    }

    /// The docker-machine CLI of this VM.
    pub fn control(&self) -> &MachineControl {
        &self.control
    }

    fn work_dirs(&self) -> Vec<PathBuf> {
        self.work_dirs
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn pending(&self) -> Constraints {
        self.pending.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn exists_quiet(&self) -> bool {
        match self.control.exists().await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(vm = %self.control.vm(), error = %e, "cannot list VMs");
                false
            }
        }
    }

    async fn create(&self) -> Result<()> {
        let limits = complete(&Constraints::new(), &self.pending());
        let limits = apply_memory_cap(self.memory_cap.as_ref(), self.control.vm(), &limits);

        info!(
            vm = %self.control.vm(),
            driver = self.driver.driver_name(),
            limits = %limits,
            "creating VM"
        );
        self.control
            .create(self.driver.driver_name(), &self.driver.create_args(&limits))
            .await
    }

    async fn sync_shares(&self, running: bool) -> Result<()> {
        let dirs = self.work_dirs();
        self.driver.sync_shares(&self.control, &dirs, running).await
    }
}

#[async_trait]
impl<D: MachineDriver> Hypervisor for DockerMachine<D> {
    fn name(&self) -> &'static str {
        self.driver.driver_name()
    }

    fn vm_name(&self) -> &str {
        self.control.vm()
    }

    fn is_available(&self) -> bool {
        find_on_path(MACHINE_BINARY).is_some() && self.driver.is_available()
    }

    async fn setup(&self) -> Result<()> {
        if self.control.exists().await? {
            if let Some(driver) = self.control.driver_name().await
                && driver != self.driver.driver_name()
            {
                warn!(
                    vm = %self.control.vm(),
                    expected = self.driver.driver_name(),
                    actual = %driver,
                    "VM was created with a different driver"
                );
            }
        } else {
            self.create().await?;
        }

        match self.control.status().await {
            Some(MachineState::Running) => {
                debug!(vm = %self.control.vm(), "VM already running");
            }
            state => {
                info!(vm = %self.control.vm(), state = ?state, "starting VM");
                self.control.start().await?;
            }
        }

        self.sync_shares(true).await
    }

    async fn stop_vm(&self) -> Result<()> {
        info!(vm = %self.control.vm(), "stopping VM");
        self.control.stop().await
    }

    async fn vm_running(&self) -> bool {
        self.control.status().await == Some(MachineState::Running)
    }

    async fn reachable(&self) -> bool {
        if !self.vm_running().await {
            return false;
        }
        match self.control.env().await {
            Ok(env) => env.contains_key("DOCKER_HOST"),
            Err(e) => {
                warn!(vm = %self.control.vm(), error = %e, "engine environment unavailable");
                false
            }
        }
    }

    async fn constraints(&self) -> Constraints {
        if !self.exists_quiet().await {
            return Constraints::new();
        }
        match self.driver.read_constraints(self.control.vm()).await {
            Ok(constraints) => constraints,
            Err(e) => {
                warn!(vm = %self.control.vm(), error = %e, "cannot read VM constraints");
                Constraints::new()
            }
        }
    }

    async fn constrain(&self, limits: &Constraints) -> Result<()> {
        let limits = apply_memory_cap(self.memory_cap.as_ref(), self.control.vm(), limits);
        if let Ok(mut pending) = self.pending.lock() {
            *pending = limits.clone();
        }

        if !self.control.exists().await? {
            debug!(vm = %self.control.vm(), limits = %limits, "VM absent, constraints deferred to create");
            return Ok(());
        }

        let running = self.vm_running().await;
        if running {
            self.control.stop().await?;
        }

        info!(vm = %self.control.vm(), limits = %limits, "applying constraints");
        let written = self.driver.write_constraints(self.control.vm(), &limits).await;

        if running {
            self.control.start().await?;
        }
        written
    }

    async fn update_work_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        if let Ok(mut current) = self.work_dirs.lock() {
            *current = dirs.to_vec();
        }

        if !self.control.exists().await? {
            return Ok(());
        }
        let running = self.vm_running().await;
        self.sync_shares(running).await
    }

    async fn create_volumes(
        &self,
        engine: &dyn ContainerEngine,
        binds: &[DockerBind],
    ) -> Result<Vec<VolumeBind>> {
        let work_dirs = self.work_dirs();
        self.driver
            .create_volumes(&self.control, engine, &work_dirs, binds)
            .await
    }

    async fn get_port_mapping(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        guest_port: u16,
    ) -> Result<(String, u16)> {
        let port = published_port(engine, container_id, guest_port).await?;
        let ip = self.control.ip().await?;
        Ok((ip, port))
    }

    async fn engine_endpoint(&self) -> Result<EngineEndpoint> {
        let env = self.control.env().await?;
        let host = env.get("DOCKER_HOST").cloned().ok_or_else(|| {
            Error::HypervisorUnavailable(format!(
                "docker-machine env {} printed no DOCKER_HOST",
                self.control.vm()
            ))
        })?;

        let verify = env.get("DOCKER_TLS_VERIFY").is_some_and(|v| v != "0");
        let cert_path = env
            .get("DOCKER_CERT_PATH")
            .filter(|_| verify)
            .map(|p| Path::new(p).to_path_buf());

        Ok(EngineEndpoint::Tcp { host, cert_path })
    }

    async fn recovery_step(&self, step: RecoveryStep) -> Result<()> {
        match step {
            RecoveryStep::RegenerateCerts => self.control.regenerate_certs().await,
            RecoveryStep::Restart => {
                if self.vm_running().await {
                    self.control.stop().await?;
                }
                self.setup().await
            }
            RecoveryStep::Recreate => {
                if self.exists_quiet().await {
                    self.control.rm().await?;
                }
                self.setup().await
            }
        }
    }
}
