//! # Runtime Layer Constants
//!
//! Defines resource floors, timeouts, polling intervals and the image
//! allow-list for the sandboxed runtime layer. These constants are the
//! **single source of truth** for bounds used throughout the codebase.
//!
//! ## Cross-References
//!
//! - [`crate::command`]: Uses control-binary timeouts
//! - [`crate::config`]: Uses resource floors for validation
//! - [`crate::constraints`]: Uses floors when completing a constraint set
//! - [`crate::runtime`]: Uses polling intervals and join timeouts
//! - [`crate::environment`]: Uses the allow-list

use std::time::Duration;

// =============================================================================
// Resource Floors
// =============================================================================

/// Minimum memory assigned to the hypervisor VM (MiB).
///
/// **Rationale**: The container engine plus a guest kernel need roughly
/// 1 GiB before any job memory is accounted for.
pub const MIN_MEMORY_MB: u64 = 1024;

/// Largest memory setting accepted for the hypervisor VM (MiB, 16 TiB).
///
/// Keeps the byte count handed to the engine well inside `i64`.
pub const MAX_MEMORY_MB: u64 = 16 * 1024 * 1024;

/// Minimum number of CPUs assigned to the hypervisor VM.
pub const MIN_CPU_COUNT: u32 = 1;

// =============================================================================
// Control-Binary Timeouts
// =============================================================================
//
// Every subprocess call into a control binary is bounded. Power transitions
// are quick on healthy hosts; state saves and creation can take minutes.
// =============================================================================

/// Timeout for generic control-binary commands (3 minutes).
///
/// Covers `create`, `regenerate-certs`, `rm` and similar verbs.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(180);

/// Timeout for VM power transitions (`start`, `stop`, `status`).
pub const POWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for commands that persist VM state to disk.
pub const SAVE_STATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum number of control-binary subprocesses running at once.
///
/// **Rationale**: The control binaries serialize on the VM anyway; a small
/// bound keeps a burst of runtimes from spawning dozens of processes.
pub const MAX_CONCURRENT_COMMANDS: usize = 4;

/// Maximum captured command output (1 MiB).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

// =============================================================================
// Runtime Loops
// =============================================================================

/// Interval between container status polls while running.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Time `stop()` waits for each background loop to finish.
pub const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period handed to the engine when stopping a container (seconds).
pub const CONTAINER_STOP_GRACE_SECS: i32 = 10;

// =============================================================================
// Naming
// =============================================================================

/// Default VM name for driver-backed hypervisors.
pub const DEFAULT_VM_NAME: &str = "taskbox";

/// Prefix of container names created by this crate.
pub const CONTAINER_NAME_PREFIX: &str = "taskbox-";

/// Environment identifier reported by [`crate::environment::Environment::metadata`].
pub const ENVIRONMENT_ID: &str = "docker_cpu";

/// Human-readable environment description.
pub const ENVIRONMENT_DESCRIPTION: &str = "Docker environment using CPU";

// =============================================================================
// Image Allow-List
// =============================================================================

/// Repositories permitted to run.
///
/// **Security**: Only images built and published by the network maintainers
/// may execute; any tag of a listed repository is accepted.
pub const ALLOWED_IMAGES: &[&str] = &[
    "taskbox/base",
    "taskbox/blender",
    "taskbox/blender_verifier",
    "taskbox/glambda",
    "taskbox/wasm",
];

/// Returns true if `image` (repository name, without tag) is allow-listed.
#[inline]
#[must_use]
pub fn is_image_allowed(image: &str) -> bool {
    let repository = image.split_once(':').map_or(image, |(repo, _)| repo);
    ALLOWED_IMAGES.contains(&repository)
}
