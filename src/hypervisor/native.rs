//! Native hypervisor for hosts whose kernel runs containers directly.
//!
//! There is no VM: lifecycle calls succeed immediately, binds are host
//! paths, and published ports live on the loopback interface. Constraints
//! and work dirs are only remembered so that they round-trip through
//! [`Hypervisor::constraints`].

use super::{Hypervisor, pass_through};
use crate::constraints::Constraints;
use crate::engine::{ContainerEngine, VolumeBind};
use crate::error::Result;
use crate::runtime::DockerBind;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const VM_NAME: &str = "native";

/// No-op hypervisor.
#[derive(Debug, Default)]
pub struct NativeHypervisor {
    constraints: Mutex<Constraints>,
    work_dirs: Mutex<Vec<PathBuf>>,
}

impl NativeHypervisor {
    /// Creates the hypervisor.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Hypervisor for NativeHypervisor {
    fn name(&self) -> &'static str {
        "native"
    }

    fn vm_name(&self) -> &str {
        VM_NAME
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "linux") && Path::new("/var/run/docker.sock").exists()
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_vm(&self) -> Result<()> {
        Ok(())
    }

    async fn vm_running(&self) -> bool {
        true
    }

    async fn constraints(&self) -> Constraints {
        self.constraints
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    async fn constrain(&self, limits: &Constraints) -> Result<()> {
        debug!(limits = %limits, "native hypervisor records constraints");
        if let Ok(mut current) = self.constraints.lock() {
            *current = limits.clone();
        }
        Ok(())
    }

    async fn update_work_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        if let Ok(mut current) = self.work_dirs.lock() {
            *current = dirs.to_vec();
        }
        Ok(())
    }

    async fn create_volumes(
        &self,
        _engine: &dyn ContainerEngine,
        binds: &[DockerBind],
    ) -> Result<Vec<VolumeBind>> {
        let work_dirs = self
            .work_dirs
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default();
        pass_through(&work_dirs, binds)
    }
}
