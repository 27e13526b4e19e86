//! Environment configuration and its validation.
//!
//! An [`EnvironmentConfig`] is immutable once built; reconfiguration
//! replaces it wholesale through `Environment::update_config`.
//!
//! # Validation Rules
//!
//! | Field       | Rule                                                  |
//! |-------------|-------------------------------------------------------|
//! | `work_dirs` | each exists and is a directory                        |
//! | `work_dirs` | no entry is an ancestor of (or equal to) another one  |
//! | `memory_mb` | `>= MIN_MEMORY_MB` and `<= MAX_MEMORY_MB`             |
//! | `cpu_count` | `>= MIN_CPU_COUNT`                                    |

use crate::constants::{MAX_MEMORY_MB, MIN_CPU_COUNT, MIN_MEMORY_MB};
use crate::constraints::Constraints;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resource and sharing configuration of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Host directories that may be bound into containers.
    pub work_dirs: Vec<PathBuf>,
    /// Memory assigned to the hypervisor VM, in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Number of CPUs assigned to the hypervisor VM.
    #[serde(default = "default_cpu_count")]
    pub cpu_count: u32,
}

fn default_memory_mb() -> u64 {
    MIN_MEMORY_MB
}

fn default_cpu_count() -> u32 {
    MIN_CPU_COUNT
}

impl EnvironmentConfig {
    /// Creates a config; call [`EnvironmentConfig::validate`] before use.
    pub fn new(work_dirs: Vec<PathBuf>, memory_mb: u64, cpu_count: u32) -> Self {
        Self {
            work_dirs,
            memory_mb,
            cpu_count,
        }
    }

    /// Loads a config from a JSON file and validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every rule in the module table.
    pub fn validate(&self) -> Result<()> {
        if self.memory_mb < MIN_MEMORY_MB {
            return Err(Error::InvalidConfig(format!(
                "memory_mb {} is below the minimum of {}",
                self.memory_mb, MIN_MEMORY_MB
            )));
        }
        if self.memory_mb > MAX_MEMORY_MB {
            return Err(Error::InvalidConfig(format!(
                "memory_mb {} exceeds the maximum of {}",
                self.memory_mb, MAX_MEMORY_MB
            )));
        }
        if self.cpu_count < MIN_CPU_COUNT {
            return Err(Error::InvalidConfig(format!(
                "cpu_count {} is below the minimum of {}",
                self.cpu_count, MIN_CPU_COUNT
            )));
        }

        for dir in &self.work_dirs {
            if !dir.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "work dir {} does not exist or is not a directory",
                    dir.display()
                )));
            }
        }

        let canonical = self
            .work_dirs
            .iter()
            .map(|d| d.canonicalize())
            .collect::<std::io::Result<Vec<_>>>()?;

        for (i, a) in canonical.iter().enumerate() {
            for b in canonical.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(Error::InvalidConfig(format!(
                        "work dirs {} and {} overlap",
                        a.display(),
                        b.display()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Desired hypervisor constraints for this config.
    pub fn constraints(&self) -> Constraints {
        Constraints::of(self.cpu_count, self.memory_mb)
    }

    /// Memory limit in bytes, saturating at `u64::MAX`.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// Returns true if the shared directories differ from `other`'s.
    pub fn work_dirs_differ(&self, other: &EnvironmentConfig) -> bool {
        self.work_dirs != other.work_dirs
    }
}
