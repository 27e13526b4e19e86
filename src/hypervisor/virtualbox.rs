//! VirtualBox driver for [`DockerMachine`].
//!
//! - Constraints: `VBoxManage showvminfo --machinereadable` (`cpus=`,
//!   `memory=`) and `VBoxManage modifyvm --cpus --memory`.
//! - Work dirs: VirtualBox shared folders named by [`share_name`], mounted
//!   with `vboxsf` at `/mnt/<share>` inside the VM.
//! - Binds: rewritten to the mount path inside the VM.

use super::machine::{DockerMachine, MachineControl, MachineDriver};
use super::{guest_path, normalized, resolve_share, share_name, volume_bind};
use crate::command::{CommandExecutor, CommandRunner};
use crate::constants::{COMMAND_TIMEOUT, CONTAINER_NAME_PREFIX, POWER_TIMEOUT};
use crate::constraints::{ConstraintKey, Constraints};
use crate::engine::{ContainerEngine, VolumeBind};
use crate::error::Result;
use crate::platform::find_on_path;
use crate::runtime::DockerBind;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(windows)]
const VBOX_BINARY: &str = "VBoxManage.exe";
#[cfg(not(windows))]
const VBOX_BINARY: &str = "VBoxManage";

/// Mount root of shared folders inside the VM.
const GUEST_MOUNT_ROOT: &str = "/mnt";

/// docker-machine hypervisor using the VirtualBox driver.
pub type VirtualBoxMachine = DockerMachine<VirtualBoxDriver>;

impl DockerMachine<VirtualBoxDriver> {
    /// Creates a VirtualBox-backed hypervisor for `vm`.
    pub fn virtualbox(vm: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(vm, VirtualBoxDriver::new(runner.clone()), runner)
    }
}

/// A shared folder currently registered on the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SharedFolder {
    name: String,
    transient: bool,
}

/// VirtualBox side of a docker-machine VM.
#[derive(Debug, Clone)]
pub struct VirtualBoxDriver {
    vbox: CommandExecutor,
}

impl VirtualBoxDriver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            vbox: CommandExecutor::new(VBOX_BINARY, runner),
        }
    }

    async fn vm_info(&self, vm: &str) -> Result<HashMap<String, String>> {
        let out = self
            .vbox
            .run(&["showvminfo", vm, "--machinereadable"], POWER_TIMEOUT)
            .await?;
        Ok(parse_machine_readable(&out))
    }

    async fn shared_folder(
        &self,
        vm: &str,
        verb: &str,
        args: &[&str],
        transient: bool,
    ) -> Result<()> {
        let mut full = vec!["sharedfolder", verb, vm];
        full.extend_from_slice(args);
        if transient {
            full.push("--transient");
        }
        self.vbox.run(&full, COMMAND_TIMEOUT).await?;
        Ok(())
    }
}

/// Parses `key=value` / `"key"="value"` lines of `--machinereadable` output.
fn parse_machine_readable(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((
                key.trim().trim_matches('"').to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

/// Extracts shared folders created by this crate from `showvminfo` output.
fn our_shared_folders(info: &HashMap<String, String>) -> Vec<SharedFolder> {
    let mut folders: Vec<SharedFolder> = info
        .iter()
        .filter_map(|(key, value)| {
            let transient = if key.starts_with("SharedFolderNameTransientMapping") {
                true
            } else if key.starts_with("SharedFolderNameMachineMapping") {
                false
            } else {
                return None;
            };
            value.starts_with(CONTAINER_NAME_PREFIX).then(|| SharedFolder {
                name: value.clone(),
                transient,
            })
        })
        .collect();
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    folders
}

fn mount_command(share: &str) -> String {
    let target = format!("{GUEST_MOUNT_ROOT}/{share}");
    format!(
        "sudo mkdir -p {target} && (mountpoint -q {target} || sudo mount -t vboxsf {share} {target})"
    )
}

#[async_trait]
impl MachineDriver for VirtualBoxDriver {
    fn driver_name(&self) -> &'static str {
        "virtualbox"
    }

    fn is_available(&self) -> bool {
        find_on_path(VBOX_BINARY).is_some()
    }

    fn create_args(&self, limits: &Constraints) -> Vec<String> {
        let mut args = vec!["--virtualbox-no-share".to_string()];
        if let Some(cpus) = limits.cpu_count() {
            args.extend(["--virtualbox-cpu-count".to_string(), cpus.to_string()]);
        }
        if let Some(memory) = limits.memory_size() {
            args.extend(["--virtualbox-memory".to_string(), memory.to_string()]);
        }
        args
    }

    async fn read_constraints(&self, vm: &str) -> Result<Constraints> {
        let info = self.vm_info(vm).await?;
        let mut constraints = Constraints::new();
        if let Some(cpus) = info.get("cpus").and_then(|v| v.parse().ok()) {
            constraints.set(ConstraintKey::CpuCount, cpus);
        }
        if let Some(memory) = info.get("memory").and_then(|v| v.parse().ok()) {
            constraints.set(ConstraintKey::MemorySize, memory);
        }
        Ok(constraints)
    }

    async fn write_constraints(&self, vm: &str, limits: &Constraints) -> Result<()> {
        let mut args = vec!["modifyvm".to_string(), vm.to_string()];
        for (key, value) in limits.iter() {
            let flag = match key {
                ConstraintKey::CpuCount => "--cpus",
                ConstraintKey::MemorySize => "--memory",
            };
            args.extend([flag.to_string(), value.to_string()]);
        }
        self.vbox.run(&args, COMMAND_TIMEOUT).await?;
        Ok(())
    }

    async fn sync_shares(
        &self,
        machine: &MachineControl,
        dirs: &[PathBuf],
        running: bool,
    ) -> Result<()> {
        let vm = machine.vm();
        let desired: BTreeMap<String, PathBuf> = dirs
            .iter()
            .map(|dir| {
                let dir = normalized(dir);
                (share_name(&dir), dir)
            })
            .collect();

        let existing = our_shared_folders(&self.vm_info(vm).await?);

        for folder in existing.iter().filter(|f| !desired.contains_key(&f.name)) {
            debug!(vm = %vm, share = %folder.name, "removing shared folder");
            self.shared_folder(vm, "remove", &["--name", folder.name.as_str()], folder.transient)
                .await?;
        }

        for (name, dir) in &desired {
            if existing.iter().any(|f| &f.name == name) {
                continue;
            }
            let host_path = dir.to_string_lossy();
            info!(vm = %vm, share = %name, path = %host_path, "adding shared folder");
            self.shared_folder(
                vm,
                "add",
                &["--name", name.as_str(), "--hostpath", host_path.as_ref()],
                running,
            )
            .await?;
        }

        if running {
            for name in desired.keys() {
                machine.ssh(&mount_command(name)).await?;
            }
        }
        Ok(())
    }

    async fn create_volumes(
        &self,
        _machine: &MachineControl,
        _engine: &dyn ContainerEngine,
        work_dirs: &[PathBuf],
        binds: &[DockerBind],
    ) -> Result<Vec<VolumeBind>> {
        binds
            .iter()
            .map(|bind| {
                let (dir, relative) = resolve_share(work_dirs, &bind.source)?;
                let base = format!("{GUEST_MOUNT_ROOT}/{}", share_name(&dir));
                Ok(volume_bind(guest_path(&base, &relative), bind))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOWVMINFO: &str = r#"name="taskbox"
ostype="Linux 2.6 / 3.x / 4.x (64-bit)"
memory=2048
cpus=2
SharedFolderNameMachineMapping1="taskbox-0011223344556677"
SharedFolderPathMachineMapping1="/home/user/work"
SharedFolderNameMachineMapping2="Users"
SharedFolderPathMachineMapping2="/Users"
SharedFolderNameTransientMapping1="taskbox-8899aabbccddeeff"
"#;

    #[test]
    fn test_parse_machine_readable() {
        let info = parse_machine_readable(SHOWVMINFO);
        assert_eq!(info.get("cpus").map(String::as_str), Some("2"));
        assert_eq!(info.get("memory").map(String::as_str), Some("2048"));
        assert_eq!(info.get("name").map(String::as_str), Some("taskbox"));
    }

    #[test]
    fn test_only_own_shared_folders() {
        let folders = our_shared_folders(&parse_machine_readable(SHOWVMINFO));
        assert_eq!(
            folders,
            vec![
                SharedFolder {
                    name: "taskbox-0011223344556677".to_string(),
                    transient: false
                },
                SharedFolder {
                    name: "taskbox-8899aabbccddeeff".to_string(),
                    transient: true
                },
            ]
        );
    }

    #[test]
    fn test_create_args() {
        let driver = VirtualBoxDriver::new(Arc::new(crate::command::SystemRunner::new()));
        let args = driver.create_args(&Constraints::of(2, 4096));
        assert_eq!(
            args,
            vec![
                "--virtualbox-no-share",
                "--virtualbox-cpu-count",
                "2",
                "--virtualbox-memory",
                "4096"
            ]
        );
    }
}
