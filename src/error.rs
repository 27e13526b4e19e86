//! Error types for the sandboxed runtime layer.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for runtime layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the sandboxed runtime layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Capability Errors
    // =========================================================================
    /// No hypervisor backend is usable on this host.
    #[error("hypervisor not available: {0}")]
    HypervisorUnavailable(String),

    /// Host operating system is not supported at all.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Environment configuration rejected.
    #[error("invalid environment config: {0}")]
    InvalidConfig(String),

    /// Image is outside the allow-list.
    #[error("image not allowed: {image}")]
    ImageNotAllowed { image: String },

    /// Bind source cannot be shared with the backend.
    #[error("invalid bind {}: {reason}", path.display())]
    InvalidBind { path: PathBuf, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Entity is in wrong state for operation.
    #[error("{entity} is in state '{state}', expected one of [{expected}]")]
    InvalidState {
        entity: String,
        state: String,
        expected: String,
    },

    /// Container create failed.
    #[error("failed to create container from '{image}': {reason}")]
    CreateFailed { image: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Container stop failed.
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Container remove failed.
    #[error("failed to remove container '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },

    /// Container does not exist in the engine.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Standard input of a container is not open.
    #[error("stdin of container '{0}' is closed")]
    StdinClosed(String),

    // =========================================================================
    // Control-Plane Errors
    // =========================================================================
    /// Control binary exited with a non-zero status.
    #[error("command `{command}` failed (exit code {code:?}): {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// Control binary could not be spawned.
    #[error("failed to spawn `{program}`: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// Container engine API call failed.
    #[error("container engine error in {operation}: {reason}")]
    Engine { operation: String, reason: String },

    /// Hypervisor VM could not be brought back to a reachable state.
    #[error("recovery of VM '{vm}' failed: {reason}")]
    RecoveryFailed { vm: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds an [`Error::Engine`] from any displayable cause.
    pub fn engine(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Engine {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Builds an [`Error::InvalidState`] for a lifecycle call.
    pub fn invalid_state(
        entity: impl Into<String>,
        state: impl std::fmt::Display,
        expected: &[impl std::fmt::Display],
    ) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            state: state.to_string(),
            expected: expected
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Returns true for validation failures raised before any state change.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::ImageNotAllowed { .. } | Self::InvalidBind { .. }
        )
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(e: bollard::errors::Error) -> Self {
        Self::engine("docker", e)
    }
}
