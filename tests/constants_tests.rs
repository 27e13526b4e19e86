//! Tests for constants module.
//!
//! Validates that resource floors, timeouts and the image allow-list have
//! sensible values.

use std::time::Duration;
use taskbox::*;

// =============================================================================
// Resource Floor Tests
// =============================================================================

#[test]
fn test_memory_floor_reasonable() {
    // A guest kernel plus the engine need about 1 GiB.
    assert!(MIN_MEMORY_MB >= 512, "memory floor too low to boot a VM");
    assert!(MIN_MEMORY_MB <= 4096, "memory floor too high for laptops");
}

#[test]
fn test_memory_ceiling_fits_engine_limit() {
    assert!(MAX_MEMORY_MB > MIN_MEMORY_MB);
    assert!(MAX_MEMORY_MB.checked_mul(1024 * 1024).is_some_and(|b| b <= i64::MAX as u64));
}

#[test]
fn test_cpu_floor_nonzero() {
    assert!(MIN_CPU_COUNT >= 1);
}

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_timeouts_ordered() {
    assert!(
        POWER_TIMEOUT < SAVE_STATE_TIMEOUT,
        "saving state takes longer than a power query"
    );
    assert!(
        SAVE_STATE_TIMEOUT <= COMMAND_TIMEOUT,
        "creation must be allowed at least as long as a state save"
    );
}

#[test]
fn test_command_timeout_bounded() {
    assert!(COMMAND_TIMEOUT >= Duration::from_secs(60));
    assert!(COMMAND_TIMEOUT <= Duration::from_secs(600));
}

#[test]
fn test_poll_interval_shorter_than_join_timeout() {
    assert!(STATUS_POLL_INTERVAL < LOOP_JOIN_TIMEOUT);
    assert!(STATUS_POLL_INTERVAL >= Duration::from_millis(100));
}

#[test]
fn test_concurrency_and_output_limits() {
    assert!(MAX_CONCURRENT_COMMANDS >= 1);
    assert!(MAX_OUTPUT_SIZE >= 64 * 1024);
    assert!(CONTAINER_STOP_GRACE_SECS > 0);
}

// =============================================================================
// Allow-List Tests
// =============================================================================

#[test]
fn test_allow_list_accepts_listed_repositories() {
    for image in ALLOWED_IMAGES {
        assert!(is_image_allowed(image), "{image} should be allowed");
    }
    assert!(is_image_allowed("taskbox/base:1.4"));
}

#[test]
fn test_allow_list_rejects_everything_else() {
    assert!(!is_image_allowed("ubuntu"));
    assert!(!is_image_allowed("taskbox/base-evil"));
    assert!(!is_image_allowed("evil/taskbox/base"));
    assert!(!is_image_allowed(""));
}

#[test]
fn test_names_share_prefix() {
    assert!(CONTAINER_NAME_PREFIX.starts_with(DEFAULT_VM_NAME));
    assert!(!ENVIRONMENT_ID.is_empty());
}
