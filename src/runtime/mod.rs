//! # Runtime - one container, one job attempt
//!
//! A [`Runtime`] owns the full lifecycle of a single container.
//!
//! ## State Machine
//!
//! ```text
//! CREATED → PREPARING → PREPARED → STARTING → RUNNING → STOPPED → CLEANING_UP
//!               │                      │          │                   ▲  │
//!               └──────────────────────┴──────────┴──▶ FAILURE ───────┘  │
//!                                                         ▲──────────────┘
//! ```
//!
//! Every transition is a compare-and-set on a `watch` channel: a call from
//! a status outside its source set fails with [`Error::InvalidState`] and
//! leaves the status untouched.
//!
//! ## Background Tasks
//!
//! `start()` spawns two tasks that live while the runtime is RUNNING:
//!
//! | Task             | Work                                                  |
//! |------------------|-------------------------------------------------------|
//! | `status-poll`    | inspects the container; exit 0 → STOPPED, else FAILURE |
//! | `usage-sampling` | folds engine stats into [`UsageCounters`]             |
//!
//! Both end as soon as the status leaves RUNNING. `stop()` joins them with
//! a bounded wait and logs (not fails) on overrun.
//!
//! ## Races with the Poll Loop
//!
//! The container may exit on its own while `stop()` or `clean_up()` is in
//! flight. Whichever side wins the RUNNING → STOPPED transition emits the
//! event; the other side proceeds without error. The input socket is an
//! `Option` that is taken on close, and removal is guarded by the
//! CLEANING_UP transition, so both happen at most once.

mod io;
mod payload;
mod usage;

pub use self::io::{Encoding, LineStream, StdinSink};
pub use self::payload::{DockerBind, RuntimePayload};
pub use self::usage::UsageCounters;

use self::io::{buffered_lines, close_socket, stream_lines};
use self::usage::UsageTracker;
use crate::constants::{LOOP_JOIN_TIMEOUT, STATUS_POLL_INTERVAL};
use crate::engine::{ContainerConfig, ContainerEngine, HostConfig, OutputStream, StdinSocket};
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 16;

// =============================================================================
// Status and Events
// =============================================================================

/// Lifecycle status of a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeStatus {
    Created,
    Preparing,
    Prepared,
    Starting,
    Running,
    Stopped,
    Failure,
    CleaningUp,
}

impl RuntimeStatus {
    /// Statuses in which standard input may be written.
    pub const INPUT: [RuntimeStatus; 3] = [Self::Prepared, Self::Starting, Self::Running];

    /// Returns true once the container no longer runs.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failure | Self::CleaningUp)
    }

    pub fn accepts_input(self) -> bool {
        Self::INPUT.contains(&self)
    }

    fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Failure => "FAILURE",
            Self::CleaningUp => "CLEANING_UP",
        };
        write!(f, "{s}")
    }
}

/// Notifications emitted by a [`Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Prepared,
    Started,
    Stopped,
    TornDown,
    ErrorOccurred(String),
}

/// Timing knobs of the background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeTunables {
    /// Delay between two container inspections.
    pub poll_interval: Duration,
    /// Bound on joining each background task in `stop()`.
    pub join_timeout: Duration,
}

impl Default for RuntimeTunables {
    fn default() -> Self {
        Self {
            poll_interval: STATUS_POLL_INTERVAL,
            join_timeout: LOOP_JOIN_TIMEOUT,
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

struct RuntimeInner {
    engine: Arc<dyn ContainerEngine>,
    hypervisor: Arc<dyn Hypervisor>,
    payload: RuntimePayload,
    config: ContainerConfig,
    tunables: RuntimeTunables,
    id: OnceLock<String>,
    status: watch::Sender<RuntimeStatus>,
    stopping: AtomicBool,
    usage: Mutex<UsageTracker>,
    stdin: Arc<AsyncMutex<Option<StdinSocket>>>,
    tasks: AsyncMutex<Vec<(&'static str, JoinHandle<()>)>>,
    events: broadcast::Sender<RuntimeEvent>,
}

/// Lifecycle handle for one container.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Creates an unprepared runtime.
    ///
    /// `host` must already hold engine-resolved binds.
    pub fn new(
        payload: RuntimePayload,
        host: HostConfig,
        engine: Arc<dyn ContainerEngine>,
        hypervisor: Arc<dyn Hypervisor>,
        tunables: RuntimeTunables,
    ) -> Self {
        let config = ContainerConfig {
            name: format!(
                "{}{}",
                crate::constants::CONTAINER_NAME_PREFIX,
                uuid::Uuid::new_v4().simple()
            ),
            image: payload.image_ref(),
            command: payload.command.clone(),
            env: payload.env.clone(),
            user: payload.user.clone(),
            working_dir: payload.work_dir.clone(),
            host,
        };
        let (status, _) = watch::channel(RuntimeStatus::Created);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(RuntimeInner {
                engine,
                hypervisor,
                payload,
                config,
                tunables,
                id: OnceLock::new(),
                status,
                stopping: AtomicBool::new(false),
                usage: Mutex::new(UsageTracker::default()),
                stdin: Arc::new(AsyncMutex::new(None)),
                tasks: AsyncMutex::new(Vec::new()),
                events,
            }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Container id; `None` until `prepare()` succeeded.
    pub fn id(&self) -> Option<&str> {
        self.inner.id.get().map(String::as_str)
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.inner.status.borrow()
    }

    pub fn payload(&self) -> &RuntimePayload {
        &self.inner.payload
    }

    /// Host configuration the container is created with.
    pub fn host_config(&self) -> &HostConfig {
        &self.inner.config.host
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Point-in-time copy of the usage counters.
    pub fn usage_counter_values(&self) -> UsageCounters {
        self.inner
            .usage
            .lock()
            .map(|mut tracker| tracker.snapshot())
            .unwrap_or_default()
    }

    /// Resolves once the runtime is STOPPED, FAILURE or CLEANING_UP.
    pub async fn wait_until_terminated(&self) -> RuntimeStatus {
        let mut rx = self.inner.status.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates the container and opens its standard input.
    pub async fn prepare(&self) -> Result<()> {
        let inner = &self.inner;
        inner.transition(&[RuntimeStatus::Created], RuntimeStatus::Preparing)?;

        match inner.create().await {
            Ok(id) => {
                inner.transition(&[RuntimeStatus::Preparing], RuntimeStatus::Prepared)?;
                info!(container = %id, image = %inner.config.image, "runtime prepared");
                inner.emit(RuntimeEvent::Prepared);
                Ok(())
            }
            Err(e) => {
                inner.fail("prepare", &e);
                Err(e)
            }
        }
    }

    /// Starts the container and its background tasks.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.transition(&[RuntimeStatus::Prepared], RuntimeStatus::Starting)?;
        let id = inner.require_id()?;

        if let Err(e) = inner.engine.start_container(&id).await {
            inner.fail("start", &e);
            return Err(e);
        }

        if let Ok(mut usage) = inner.usage.lock() {
            usage.start();
        }
        inner.transition(&[RuntimeStatus::Starting], RuntimeStatus::Running)?;

        let poll = tokio::spawn(poll_status(Arc::clone(inner), id.clone()));
        let sample = tokio::spawn(sample_usage(Arc::clone(inner), id.clone()));
        inner
            .tasks
            .lock()
            .await
            .extend([("status-poll", poll), ("usage-sampling", sample)]);

        info!(container = %id, "runtime started");
        inner.emit(RuntimeEvent::Started);
        Ok(())
    }

    /// Stops the container, joins the background tasks and closes stdin.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let id = inner.require_id()?;

        match self.status() {
            RuntimeStatus::Running => {
                inner.stopping.store(true, Ordering::SeqCst);
                if let Err(e) = inner.engine.stop_container(&id).await {
                    inner.fail("stop", &e);
                    inner.join_tasks().await;
                    inner.close_stdin().await;
                    return Err(e);
                }
                inner.finish(RuntimeStatus::Stopped);
            }
            RuntimeStatus::Stopped | RuntimeStatus::Failure => {
                debug!(container = %id, status = %self.status(), "container already terminated");
            }
            other => {
                return Err(Error::invalid_state(
                    inner.label(),
                    other,
                    &[
                        RuntimeStatus::Running,
                        RuntimeStatus::Stopped,
                        RuntimeStatus::Failure,
                    ],
                ));
            }
        }

        inner.join_tasks().await;
        inner.close_stdin().await;
        Ok(())
    }

    /// Removes the container.
    pub async fn clean_up(&self) -> Result<()> {
        let inner = &self.inner;
        inner.transition(
            &[RuntimeStatus::Stopped, RuntimeStatus::Failure],
            RuntimeStatus::CleaningUp,
        )?;

        inner.join_tasks().await;
        inner.close_stdin().await;

        if let Some(id) = inner.id.get() {
            match inner.engine.remove_container(id).await {
                Ok(()) | Err(Error::ContainerNotFound(_)) => {}
                Err(e) => {
                    inner.fail("clean_up", &e);
                    return Err(e);
                }
            }
            info!(container = %id, "runtime cleaned up");
        }

        inner.emit(RuntimeEvent::TornDown);
        Ok(())
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Write handle for the container's standard input.
    pub fn stdin(&self, encoding: Encoding) -> Result<StdinSink> {
        let status = self.status();
        if !status.accepts_input() {
            return Err(Error::invalid_state(
                format!("stdin of {}", self.inner.label()),
                status,
                &RuntimeStatus::INPUT,
            ));
        }
        Ok(StdinSink::new(
            self.inner.config.name.clone(),
            Arc::clone(&self.inner.stdin),
            self.inner.status.subscribe(),
            encoding,
        ))
    }

    /// Standard output, one decoded line per item.
    pub async fn stdout(&self, encoding: Encoding) -> Result<LineStream> {
        self.output(OutputStream::Stdout, encoding).await
    }

    /// Standard error, one decoded line per item.
    pub async fn stderr(&self, encoding: Encoding) -> Result<LineStream> {
        self.output(OutputStream::Stderr, encoding).await
    }

    async fn output(&self, stream: OutputStream, encoding: Encoding) -> Result<LineStream> {
        let id = self.inner.require_id()?;

        if self.status().is_live() {
            debug!(container = %id, stream = %stream, "streaming output");
            let bytes = self.inner.engine.logs(&id, stream, true).await?;
            Ok(stream_lines(bytes, encoding))
        } else {
            let bytes = self.inner.engine.logs(&id, stream, false).await?;
            buffered_lines(bytes, encoding).await
        }
    }

    /// Host address and port a published container port is reachable at.
    pub async fn get_port_mapping(&self, port: u16) -> Result<(String, u16)> {
        let id = self.inner.require_id()?;
        self.inner
            .hypervisor
            .get_port_mapping(self.inner.engine.as_ref(), &id, port)
            .await
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.config.name)
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl RuntimeInner {
    fn label(&self) -> String {
        format!("runtime {}", self.config.name)
    }

    fn require_id(&self) -> Result<String> {
        self.id.get().cloned().ok_or_else(|| {
            Error::invalid_state(
                self.label(),
                *self.status.borrow(),
                &[RuntimeStatus::Prepared],
            )
        })
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    /// Compare-and-set from any of `from` to `to`.
    fn transition(&self, from: &[RuntimeStatus], to: RuntimeStatus) -> Result<()> {
        let mut rejected = None;
        self.status.send_if_modified(|current| {
            if from.contains(current) {
                debug!(runtime = %self.config.name, from = %current, to = %to, "transition");
                *current = to;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        match rejected {
            None => Ok(()),
            Some(current) => Err(Error::invalid_state(self.label(), current, from)),
        }
    }

    /// RUNNING → `to`; emits when this call won the transition.
    fn finish(&self, to: RuntimeStatus) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.finish();
        }
        if self.transition(&[RuntimeStatus::Running], to).is_ok() && to == RuntimeStatus::Stopped {
            info!(runtime = %self.config.name, "runtime stopped");
            self.emit(RuntimeEvent::Stopped);
        }
    }

    /// Drives FAILURE from any status that may fail.
    fn fail(&self, operation: &str, cause: &dyn fmt::Display) {
        let failed = self.transition(
            &[
                RuntimeStatus::Preparing,
                RuntimeStatus::Starting,
                RuntimeStatus::Running,
                RuntimeStatus::CleaningUp,
            ],
            RuntimeStatus::Failure,
        );
        if let Ok(mut usage) = self.usage.lock() {
            usage.finish();
        }

        error!(runtime = %self.config.name, operation, error = %cause, "runtime failed");
        if failed.is_ok() {
            self.emit(RuntimeEvent::ErrorOccurred(format!("{operation}: {cause}")));
        }
    }

    async fn create(&self) -> Result<String> {
        let id = self.engine.create_container(&self.config).await?;

        match self.engine.attach_stdin(&id).await {
            Ok(socket) => *self.stdin.lock().await = Some(socket),
            Err(e) => {
                if let Err(remove) = self.engine.remove_container(&id).await {
                    warn!(container = %id, error = %remove, "cannot remove half-prepared container");
                }
                return Err(e);
            }
        }

        self.id
            .set(id.clone())
            .map_err(|_| Error::Internal(format!("{} already has an id", self.label())))?;
        Ok(id)
    }

    async fn close_stdin(&self) {
        if let Err(e) = close_socket(&self.stdin, &self.config.name).await {
            warn!(runtime = %self.config.name, error = %e, "error closing stdin");
        }
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (name, mut handle) in tasks {
            match tokio::time::timeout(self.tunables.join_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(runtime = %self.config.name, task = name, "task joined"),
                Ok(Err(e)) => {
                    warn!(runtime = %self.config.name, task = name, error = %e, "task panicked");
                }
                Err(_) => {
                    warn!(
                        runtime = %self.config.name,
                        task = name,
                        timeout = ?self.tunables.join_timeout,
                        "task did not finish in time, aborting"
                    );
                    handle.abort();
                }
            }
        }
    }

    fn running(&self) -> bool {
        *self.status.borrow() == RuntimeStatus::Running
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

async fn poll_status(inner: Arc<RuntimeInner>, id: String) {
    let mut status_rx = inner.status.subscribe();

    while inner.running() {
        match inner.engine.inspect_container(&id).await {
            Ok(inspection) if inspection.state.is_terminal() => {
                let code = inspection.exit_code.unwrap_or(-1);
                if code == 0 || inner.stopping.load(Ordering::SeqCst) {
                    debug!(container = %id, code, "container exited");
                    inner.finish(RuntimeStatus::Stopped);
                } else {
                    inner.fail("status-poll", &format!("container exited with code {code}"));
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if !inner.stopping.load(Ordering::SeqCst) {
                    inner.fail("status-poll", &e);
                }
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.tunables.poll_interval) => {}
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn sample_usage(inner: Arc<RuntimeInner>, id: String) {
    let mut stats = match inner.engine.stats(&id).await {
        Ok(stats) => stats,
        Err(e) => {
            warn!(container = %id, error = %e, "usage sampling unavailable");
            return;
        }
    };
    let mut status_rx = inner.status.subscribe();

    while inner.running() {
        tokio::select! {
            sample = stats.next() => match sample {
                Some(Ok(sample)) => {
                    if let Ok(mut usage) = inner.usage.lock() {
                        usage.record(&sample);
                    }
                }
                Some(Err(e)) => {
                    warn!(container = %id, error = %e, "stats stream failed");
                    break;
                }
                None => break,
            },
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Ok(mut usage) = inner.usage.lock() {
        usage.finish();
    }
}
