//! Docker Desktop daemon backends (macOS).
//!
//! Docker Desktop manages its own VM; this crate only talks to it through
//! its settings file and by quitting / launching the application.
//!
//! | Layout   | Settings file                                          | Keys                                   |
//! |----------|--------------------------------------------------------|----------------------------------------|
//! | Current  | `~/Library/Group Containers/group.com.docker/settings-store.json` | `Cpus`, `MemoryMiB`, `FilesharingDirectories` |
//! | Legacy   | `~/Library/Group Containers/group.com.docker/settings.json`       | `cpus`, `memoryMiB`, `filesharingDirectories` |
//!
//! Constraint changes patch the file and restart the daemon if it runs.
//! File sharing entries are only ever added: entries the user configured
//! by hand are left alone.

use super::{FloorPolicy, Hypervisor, MemoryCapPolicy, apply_memory_cap, pass_through};
use crate::command::{CommandExecutor, CommandRunner};
use crate::constants::{POWER_TIMEOUT, SAVE_STATE_TIMEOUT};
use crate::constraints::{ConstraintKey, Constraints};
use crate::engine::{ContainerEngine, VolumeBind};
use crate::error::{Error, Result};
use crate::runtime::DockerBind;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SETTINGS_DIR: &str = "Library/Group Containers/group.com.docker";
const APP_NAME: &str = "Docker";
const DAEMON_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Which generation of Docker Desktop settings is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesktopLayout {
    Current,
    Legacy,
}

struct SettingsKeys {
    cpus: &'static str,
    memory: &'static str,
    sharing: &'static str,
}

impl DesktopLayout {
    /// Settings file of this layout under the user's home directory.
    pub fn settings_path(self) -> Option<PathBuf> {
        let file = match self {
            Self::Current => "settings-store.json",
            Self::Legacy => "settings.json",
        };
        dirs::home_dir().map(|home| home.join(SETTINGS_DIR).join(file))
    }

    fn keys(self) -> SettingsKeys {
        match self {
            Self::Current => SettingsKeys {
                cpus: "Cpus",
                memory: "MemoryMiB",
                sharing: "FilesharingDirectories",
            },
            Self::Legacy => SettingsKeys {
                cpus: "cpus",
                memory: "memoryMiB",
                sharing: "filesharingDirectories",
            },
        }
    }
}

/// Hypervisor backed by the Docker Desktop application.
pub struct DockerDesktop {
    layout: DesktopLayout,
    settings_path: PathBuf,
    docker: CommandExecutor,
    open: CommandExecutor,
    osascript: CommandExecutor,
    work_dirs: Mutex<Vec<PathBuf>>,
    memory_cap: Arc<dyn MemoryCapPolicy>,
}

impl DockerDesktop {
    /// Current Docker Desktop.
    pub fn current(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(DesktopLayout::Current, runner)
    }

    /// Docker Desktop releases predating the settings store.
    pub fn legacy(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(DesktopLayout::Legacy, runner)
    }

    fn new(layout: DesktopLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            layout,
            settings_path: layout.settings_path().unwrap_or_default(),
            docker: CommandExecutor::new("docker", runner.clone()),
            open: CommandExecutor::new("open", runner.clone()),
            osascript: CommandExecutor::new("osascript", runner),
            work_dirs: Mutex::new(Vec::new()),
            memory_cap: Arc::new(FloorPolicy),
        }
    }

    /// Uses a settings file at a custom location.
    #[must_use]
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = path.into();
        self
    }

    /// Replaces the memory cap policy.
    #[must_use]
    pub fn with_memory_cap(mut self, policy: Arc<dyn MemoryCapPolicy>) -> Self {
        self.memory_cap = policy;
        self
    }

    /// Settings layout in use.
    pub fn layout(&self) -> DesktopLayout {
        self.layout
    }

    async fn read_settings(&self) -> Result<Map<String, Value>> {
        read_settings(&self.settings_path).await
    }

    async fn write_settings(&self, settings: &Map<String, Value>) -> Result<()> {
        let text = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_path, text).await?;
        Ok(())
    }

    async fn wait_for(&self, running: bool, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            if self.vm_running().await == running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!(
                        "waiting for {APP_NAME} to {}",
                        if running { "start" } else { "quit" }
                    ),
                    duration: limit,
                });
            }
            tokio::time::sleep(DAEMON_POLL_INTERVAL).await;
        }
    }

    async fn restart_daemon(&self) -> Result<()> {
        self.stop_vm().await?;
        self.setup().await
    }
}

async fn read_settings(path: &Path) -> Result<Map<String, Value>> {
    let text = fs::read_to_string(path).await?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::InvalidConfig(format!(
            "{} is not a JSON object",
            path.display()
        ))),
    }
}

#[async_trait]
impl Hypervisor for DockerDesktop {
    fn name(&self) -> &'static str {
        match self.layout {
            DesktopLayout::Current => "docker_desktop",
            DesktopLayout::Legacy => "legacy_docker_desktop",
        }
    }

    fn vm_name(&self) -> &str {
        APP_NAME
    }

    fn is_available(&self) -> bool {
        self.settings_path.is_file()
    }

    async fn setup(&self) -> Result<()> {
        if self.vm_running().await {
            debug!(app = APP_NAME, "daemon already running");
            return Ok(());
        }

        info!(app = APP_NAME, "launching daemon");
        self.open.run(&["-g", "-a", APP_NAME], POWER_TIMEOUT).await?;
        self.wait_for(true, SAVE_STATE_TIMEOUT).await
    }

    async fn stop_vm(&self) -> Result<()> {
        info!(app = APP_NAME, "quitting daemon");
        let script = format!("quit app \"{APP_NAME}\"");
        self.osascript.run(&["-e", &script], POWER_TIMEOUT).await?;
        self.wait_for(false, SAVE_STATE_TIMEOUT).await
    }

    async fn vm_running(&self) -> bool {
        self.docker
            .query(&["info", "--format", "{{.ServerVersion}}"], POWER_TIMEOUT)
            .await
            .is_some()
    }

    async fn constraints(&self) -> Constraints {
        let settings = match self.read_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    path = %self.settings_path.display(),
                    error = %e,
                    "cannot read daemon settings"
                );
                return Constraints::new();
            }
        };

        let keys = self.layout.keys();
        let mut constraints = Constraints::new();
        if let Some(cpus) = settings.get(keys.cpus).and_then(Value::as_u64) {
            constraints.set(ConstraintKey::CpuCount, cpus);
        }
        if let Some(memory) = settings.get(keys.memory).and_then(Value::as_u64) {
            constraints.set(ConstraintKey::MemorySize, memory);
        }
        constraints
    }

    async fn constrain(&self, limits: &Constraints) -> Result<()> {
        let limits = apply_memory_cap(self.memory_cap.as_ref(), APP_NAME, limits);
        let keys = self.layout.keys();

        let mut settings = self.read_settings().await?;
        if let Some(cpus) = limits.cpu_count() {
            settings.insert(keys.cpus.to_string(), Value::from(cpus));
        }
        if let Some(memory) = limits.memory_size() {
            settings.insert(keys.memory.to_string(), Value::from(memory));
        }
        self.write_settings(&settings).await?;
        info!(app = APP_NAME, limits = %limits, "daemon settings updated");

        if self.vm_running().await {
            self.restart_daemon().await?;
        }
        Ok(())
    }

    async fn update_work_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        if let Ok(mut current) = self.work_dirs.lock() {
            *current = dirs.to_vec();
        }

        let keys = self.layout.keys();
        let mut settings = self.read_settings().await?;
        let mut shared: Vec<Value> = settings
            .get(keys.sharing)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut changed = false;
        for dir in dirs {
            let entry = Value::from(dir.to_string_lossy().into_owned());
            if !shared.contains(&entry) {
                shared.push(entry);
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        settings.insert(keys.sharing.to_string(), Value::Array(shared));
        self.write_settings(&settings).await?;
        info!(app = APP_NAME, "file sharing directories updated");

        if self.vm_running().await {
            self.restart_daemon().await?;
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
