//! Hyper-V driver for [`DockerMachine`].
//!
//! - Constraints: PowerShell `Get-VM` / `Set-VMProcessor` / `Set-VMMemory`.
//! - Work dirs: SMB shares on the host, named by [`share_name`].
//! - Binds: docker `local` volumes of `type=cifs` pointing back at the host
//!   share through the VM's default gateway.

use super::machine::{DockerMachine, MachineControl, MachineDriver};
use super::{normalized, resolve_share, share_name, volume_bind};
use crate::command::{CommandExecutor, CommandRunner};
use crate::constants::{COMMAND_TIMEOUT, CONTAINER_NAME_PREFIX, POWER_TIMEOUT};
use crate::constraints::{ConstraintKey, Constraints};
use crate::engine::{ContainerEngine, VolumeBind};
use crate::error::{Error, Result};
use crate::platform::find_on_path;
use crate::runtime::DockerBind;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const POWERSHELL: &str = "powershell.exe";

/// docker-machine hypervisor using the Hyper-V driver.
pub type HyperVMachine = DockerMachine<HyperVDriver>;

impl DockerMachine<HyperVDriver> {
    /// Creates a Hyper-V-backed hypervisor for `vm`.
    pub fn hyperv(vm: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(vm, HyperVDriver::new(runner.clone()), runner)
    }
}

/// Account the VM uses to mount host SMB shares.
#[derive(Clone)]
pub struct SmbCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SmbCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Hyper-V side of a docker-machine VM.
#[derive(Debug, Clone)]
pub struct HyperVDriver {
    powershell: CommandExecutor,
    virtual_switch: Option<String>,
    credentials: Option<SmbCredentials>,
}

/// Subset of `Get-VM` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VmInfo {
    processor_count: u64,
    memory_startup: u64,
}

impl HyperVDriver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            powershell: CommandExecutor::new(POWERSHELL, runner),
            virtual_switch: None,
            credentials: None,
        }
    }

    /// Attaches the VM to a named external switch.
    #[must_use]
    pub fn with_virtual_switch(mut self, switch: impl Into<String>) -> Self {
        self.virtual_switch = Some(switch.into());
        self
    }

    /// Sets the account used to mount shares from inside the VM.
    #[must_use]
    pub fn with_credentials(mut self, credentials: SmbCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    async fn ps(&self, script: &str) -> Result<String> {
        self.powershell
            .run(
                &["-NoProfile", "-NonInteractive", "-Command", script],
                COMMAND_TIMEOUT,
            )
            .await
    }

    async fn our_shares(&self) -> Result<Vec<String>> {
        let script = format!(
            "Get-SmbShare | Where-Object {{ $_.Name -like '{CONTAINER_NAME_PREFIX}*' }} | \
             Select-Object -ExpandProperty Name"
        );
        let out = self.ps(&script).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn mount_options(&self) -> String {
        match &self.credentials {
            Some(c) => format!("username={},password={},vers=3.0", c.username, c.password),
            None => "guest,vers=3.0".to_string(),
        }
    }
}

/// Quotes a value for a single-quoted PowerShell string.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Extracts the default gateway from `ip route` output.
fn default_gateway(routes: &str) -> Option<String> {
    routes.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        (parts.next()? == "default" && parts.next()? == "via").then_some(())?;
        parts.next().map(str::to_string)
    })
}

fn cifs_device(host: &str, share: &str, relative: &std::path::Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .fold(format!("//{host}/{share}"), |acc, part| format!("{acc}/{part}"))
}

#[async_trait]
impl MachineDriver for HyperVDriver {
    fn driver_name(&self) -> &'static str {
        "hyperv"
    }

    fn is_available(&self) -> bool {
        find_on_path(POWERSHELL).is_some()
    }

    fn create_args(&self, limits: &Constraints) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(switch) = &self.virtual_switch {
            args.extend(["--hyperv-virtual-switch".to_string(), switch.clone()]);
        }
        if let Some(cpus) = limits.cpu_count() {
            args.extend(["--hyperv-cpu-count".to_string(), cpus.to_string()]);
        }
        if let Some(memory) = limits.memory_size() {
            args.extend(["--hyperv-memory".to_string(), memory.to_string()]);
        }
        args
    }

    async fn read_constraints(&self, vm: &str) -> Result<Constraints> {
        let script = format!(
            "Get-VM -Name {} | Select-Object ProcessorCount, MemoryStartup | ConvertTo-Json",
            ps_quote(vm)
        );
        let out = self
            .powershell
            .run(
                &["-NoProfile", "-NonInteractive", "-Command", &script],
                POWER_TIMEOUT,
            )
            .await?;
        let info: VmInfo = serde_json::from_str(&out)?;

        Ok(Constraints::new()
            .with(ConstraintKey::CpuCount, info.processor_count)
            .with(ConstraintKey::MemorySize, info.memory_startup / (1024 * 1024)))
    }

    async fn write_constraints(&self, vm: &str, limits: &Constraints) -> Result<()> {
        let name = ps_quote(vm);
        let mut statements = Vec::new();
        if let Some(cpus) = limits.cpu_count() {
            statements.push(format!("Set-VMProcessor -VMName {name} -Count {cpus}"));
        }
        if let Some(memory) = limits.memory_size() {
            statements.push(format!("Set-VMMemory -VMName {name} -StartupBytes {memory}MB"));
        }
        if statements.is_empty() {
            return Ok(());
        }
        self.ps(&statements.join("; ")).await?;
        Ok(())
    }

    async fn sync_shares(
        &self,
        _machine: &MachineControl,
        dirs: &[PathBuf],
        _running: bool,
    ) -> Result<()> {
        let desired: BTreeMap<String, PathBuf> = dirs
            .iter()
            .map(|dir| {
                let dir = normalized(dir);
                (share_name(&dir), dir)
            })
            .collect();
        let existing = self.our_shares().await?;

        for name in existing.iter().filter(|n| !desired.contains_key(*n)) {
            debug!(share = %name, "removing SMB share");
            self.ps(&format!("Remove-SmbShare -Name {} -Force", ps_quote(name)))
                .await?;
        }

        for (name, dir) in &desired {
            if existing.contains(name) {
                continue;
            }
            let path = dir.to_string_lossy();
            info!(share = %name, path = %path, "creating SMB share");
            self.ps(&format!(
                "New-SmbShare -Name {} -Path {} -FullAccess $env:USERNAME",
                ps_quote(name),
                ps_quote(&path)
            ))
            .await?;
        }
        Ok(())
    }

    async fn create_volumes(
        &self,
        machine: &MachineControl,
        engine: &dyn ContainerEngine,
        work_dirs: &[PathBuf],
        binds: &[DockerBind],
    ) -> Result<Vec<VolumeBind>> {
        if binds.is_empty() {
            return Ok(Vec::new());
        }

        let routes = machine.ssh("ip route").await?;
        let host = default_gateway(&routes).ok_or_else(|| {
            Error::HypervisorUnavailable(format!(
                "no default route inside VM {}",
                machine.vm()
            ))
        })?;

        let mut volumes = Vec::with_capacity(binds.len());
        for bind in binds {
            let (dir, relative) = resolve_share(work_dirs, &bind.source)?;
            let volume = share_name(&normalized(&bind.source));
            let options = HashMap::from([
                ("type".to_string(), "cifs".to_string()),
                (
                    "device".to_string(),
                    cifs_device(&host, &share_name(&dir), &relative),
                ),
                ("o".to_string(), self.mount_options()),
            ]);

            engine.create_volume(&volume, "local", &options).await?;
            volumes.push(volume_bind(volume, bind));
        }
        Ok(volumes)
    }
}
