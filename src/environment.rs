//! # Environment - hypervisor façade and runtime factory
//!
//! One [`Environment`] exists per process. It owns the selected hypervisor,
//! the container engine, and the validated [`EnvironmentConfig`], and it
//! manufactures [`Runtime`]s.
//!
//! ## State Machine
//!
//! ```text
//!            prepare()              cleanup()
//! DISABLED ──────────► PREPARING ──► ENABLED ──────► CLEANING_UP ──► DISABLED
//!    ▲                     │                              │
//!    │                     ▼                              ▼
//!    └──── cleanup() ──── ERROR ◄─────────────────────────┘
//! ```
//!
//! Lifecycle calls are serialized by an async mutex; reconfiguration is
//! only legal while DISABLED so it never races a running job.
//!
//! ## Reconfiguration
//!
//! `update_config` queries the live constraints and hands them to
//! [`constraints::reconcile`]. Only a non-empty plan (or a change of work
//! dirs) enters the hypervisor's recover scope; equal values leave the VM
//! untouched.

use crate::command::SystemRunner;
use crate::config::EnvironmentConfig;
use crate::constants::{ENVIRONMENT_DESCRIPTION, ENVIRONMENT_ID, is_image_allowed};
use crate::constraints;
use crate::engine::{ContainerEngine, DockerEngine, HostConfig};
use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, select_available_hypervisor, select_hypervisor};
use crate::platform::Platform;
use crate::runtime::{Runtime, RuntimePayload, RuntimeTunables};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, error, info};

const EVENT_CAPACITY: usize = 16;

/// Lifecycle status of an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentStatus {
    Disabled,
    Preparing,
    Enabled,
    CleaningUp,
    Error,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "DISABLED",
            Self::Preparing => "PREPARING",
            Self::Enabled => "ENABLED",
            Self::CleaningUp => "CLEANING_UP",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Notifications emitted by an [`Environment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentEvent {
    Enabled,
    Disabled,
    ErrorOccurred(String),
}

/// Static description of the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentMetadata {
    pub id: String,
    pub description: String,
}

/// Outcome of probing whether this host can run an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSupport {
    pub supported: bool,
    /// Backend that would be selected.
    pub backend: Option<&'static str>,
    /// Why the host is unsupported.
    pub reason: Option<String>,
}

/// Long-lived façade owning one hypervisor.
pub struct Environment {
    status: Mutex<EnvironmentStatus>,
    lifecycle: AsyncMutex<()>,
    config: RwLock<EnvironmentConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    engine: Arc<dyn ContainerEngine>,
    tunables: RuntimeTunables,
    events: broadcast::Sender<EnvironmentEvent>,
}

impl Environment {
    /// Creates a disabled environment after validating `config`.
    pub fn new(
        config: EnvironmentConfig,
        hypervisor: Arc<dyn Hypervisor>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            status: Mutex::new(EnvironmentStatus::Disabled),
            lifecycle: AsyncMutex::new(()),
            config: RwLock::new(config),
            hypervisor,
            engine,
            tunables: RuntimeTunables::default(),
            events,
        })
    }

    /// Detects the host platform, selects the first available hypervisor and
    /// connects the Docker engine through it.
    pub fn detect(config: EnvironmentConfig) -> Result<Self> {
        let platform = Platform::detect();
        let hypervisor = select_available_hypervisor(&platform, Arc::new(SystemRunner::new()))?;
        let engine = Arc::new(DockerEngine::for_hypervisor(Arc::clone(&hypervisor)));
        Self::new(config, hypervisor, engine)
    }

    /// Overrides the timing of runtimes created from now on.
    #[must_use]
    pub fn with_runtime_tunables(mut self, tunables: RuntimeTunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Probes the current host without constructing an environment.
    pub fn supported() -> EnvironmentSupport {
        Self::support_from(select_available_hypervisor(
            &Platform::detect(),
            Arc::new(SystemRunner::new()),
        ))
    }

    /// Reports what `platform` would select from its capabilities.
    pub fn supported_on(platform: &Platform) -> EnvironmentSupport {
        Self::support_from(select_hypervisor(platform, Arc::new(SystemRunner::new())))
    }

    fn support_from(selected: Result<Arc<dyn Hypervisor>>) -> EnvironmentSupport {
        match selected {
            Ok(hypervisor) => EnvironmentSupport {
                supported: true,
                backend: Some(hypervisor.name()),
                reason: None,
            },
            Err(e) => EnvironmentSupport {
                supported: false,
                backend: None,
                reason: Some(e.to_string()),
            },
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn metadata(&self) -> EnvironmentMetadata {
        EnvironmentMetadata {
            id: ENVIRONMENT_ID.to_string(),
            description: ENVIRONMENT_DESCRIPTION.to_string(),
        }
    }

    pub fn status(&self) -> EnvironmentStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(EnvironmentStatus::Error)
    }

    /// Current configuration.
    pub fn config(&self) -> EnvironmentConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.events.subscribe()
    }

    fn set_status(&self, status: EnvironmentStatus) {
        if let Ok(mut current) = self.status.lock() {
            debug!(from = %*current, to = %status, "environment transition");
            *current = status;
        }
    }

    fn require(&self, allowed: &[EnvironmentStatus]) -> Result<()> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(Error::invalid_state("environment", status, allowed))
        }
    }

    fn emit(&self, event: EnvironmentEvent) {
        let _ = self.events.send(event);
    }

    fn errored(&self, operation: &str, e: &Error) {
        error!(operation, vm = %self.hypervisor.vm_name(), error = %e, "environment failed");
        self.set_status(EnvironmentStatus::Error);
        self.emit(EnvironmentEvent::ErrorOccurred(format!("{operation}: {e}")));
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Brings up the hypervisor.
    pub async fn prepare(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.require(&[EnvironmentStatus::Disabled])?;
        self.set_status(EnvironmentStatus::Preparing);

        let config = self.config();
        match self.bring_up(&config).await {
            Ok(()) => {
                self.set_status(EnvironmentStatus::Enabled);
                info!(backend = self.hypervisor.name(), "environment enabled");
                self.emit(EnvironmentEvent::Enabled);
                Ok(())
            }
            Err(e) => {
                self.errored("prepare", &e);
                Err(e)
            }
        }
    }

    async fn bring_up(&self, config: &EnvironmentConfig) -> Result<()> {
        self.hypervisor.update_work_dirs(&config.work_dirs).await?;
        self.hypervisor.setup().await?;

        if !self.hypervisor.reachable().await {
            self.hypervisor.recover(self.hypervisor.vm_name()).await?;
            self.engine.reconnect().await;
        }
        Ok(())
    }

    /// Stops the hypervisor.
    pub async fn cleanup(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.require(&[EnvironmentStatus::Enabled, EnvironmentStatus::Error])?;
        self.set_status(EnvironmentStatus::CleaningUp);

        match self.hypervisor.quit().await {
            Ok(()) => {
                self.set_status(EnvironmentStatus::Disabled);
                info!(backend = self.hypervisor.name(), "environment disabled");
                self.emit(EnvironmentEvent::Disabled);
                Ok(())
            }
            Err(e) => {
                self.errored("cleanup", &e);
                Err(e)
            }
        }
    }

    /// Validates and applies a new configuration.
    pub async fn update_config(&self, config: EnvironmentConfig) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.require(&[EnvironmentStatus::Disabled])?;
        config.validate()?;

        let previous = self.config();
        let dirs_changed = config.work_dirs_differ(&previous);
        let current = self.hypervisor.constraints().await;
        let plan = constraints::reconcile(&current, &config.constraints());

        if dirs_changed || plan.is_some() {
            let vm = self.hypervisor.vm_name().to_string();
            info!(
                vm = %vm,
                current = %current,
                planned = ?plan.as_ref().map(ToString::to_string),
                dirs_changed,
                "reconfiguring hypervisor"
            );

            let hypervisor = &self.hypervisor;
            let body = async {
                if dirs_changed {
                    hypervisor.update_work_dirs(&config.work_dirs).await?;
                }
                if let Some(limits) = &plan {
                    hypervisor.constrain(limits).await?;
                }
                Ok::<(), Error>(())
            }
            .boxed();

            hypervisor.recover_ctx(&vm, body).await?;
            self.engine.reconnect().await;
        } else {
            debug!(constraints = %current, "hypervisor already matches config");
        }

        match self.config.write() {
            Ok(mut slot) => *slot = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        Ok(())
    }

    // =========================================================================
    // Runtimes
    // =========================================================================

    /// Builds an unprepared runtime for `payload`.
    ///
    /// `config` overrides the environment's configuration for this runtime
    /// only.
    pub async fn runtime(
        &self,
        payload: RuntimePayload,
        config: Option<&EnvironmentConfig>,
    ) -> Result<Runtime> {
        if !is_image_allowed(&payload.image) {
            return Err(Error::ImageNotAllowed {
                image: payload.image_ref(),
            });
        }
        self.require(&[EnvironmentStatus::Enabled])?;

        let config = match config {
            Some(config) => {
                config.validate()?;
                config.clone()
            }
            None => self.config(),
        };

        let binds = self
            .hypervisor
            .create_volumes(self.engine.as_ref(), &payload.binds)
            .await?;

        let host = HostConfig {
            cpuset_cpus: cpuset(config.cpu_count),
            memory_bytes: config.memory_bytes(),
            binds,
            published_ports: payload.ports.clone(),
        };
        debug!(image = %payload.image_ref(), cpuset = %host.cpuset_cpus, "building runtime");

        Ok(Runtime::new(
            payload,
            host,
            Arc::clone(&self.engine),
            Arc::clone(&self.hypervisor),
            self.tunables,
        ))
    }

    /// Makes an allow-listed image available locally.
    ///
    /// Returns `false` for an image outside the allow-list.
    pub async fn install_prerequisites(&self, repository: &str, tag: &str) -> Result<bool> {
        if !is_image_allowed(repository) {
            info!(image = %repository, "refusing to install image outside the allow-list");
            return Ok(false);
        }

        let image = format!("{repository}:{tag}");
        if self.engine.has_image(&image).await? {
            debug!(image = %image, "image already present");
            return Ok(true);
        }

        self.engine.pull_image(repository, tag).await?;
        info!(image = %image, "image installed");
        Ok(true)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("status", &self.status())
            .field("backend", &self.hypervisor.name())
            .finish()
    }
}

/// CPU set covering the first `cpu_count` CPUs.
fn cpuset(cpu_count: u32) -> String {
    match cpu_count {
        0 | 1 => "0".to_string(),
        n => format!("0-{}", n - 1),
    }
}
