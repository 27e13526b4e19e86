//! # Constraint Reconciler
//!
//! Resource constraints applied to a hypervisor VM, and the pure logic that
//! decides whether a VM needs to be reconfigured at all.
//!
//! ```text
//!   current (queried)      desired (config)
//!         │                      │
//!         └────────► diff ◄──────┘        keys where desired is set
//!                     │                   and differs from current
//!              empty? ├── yes ──► nothing to do, VM untouched
//!                     │
//!                     ▼
//!                 complete            clamp to floors, fill missing
//!                     │               keys from current / floor
//!                     ▼
//!          Hypervisor::restart_ctx(constrain(full set))
//! ```
//!
//! Applying constraints is disruptive for driver-backed hypervisors (a full
//! VM restart), so an empty diff must lead to zero hypervisor calls.

use crate::constants::{MIN_CPU_COUNT, MIN_MEMORY_MB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Names of the constraints a hypervisor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKey {
    /// Number of virtual CPUs.
    CpuCount,
    /// Memory size in MiB.
    MemorySize,
}

impl ConstraintKey {
    /// All keys, in application order.
    pub const ALL: [ConstraintKey; 2] = [ConstraintKey::CpuCount, ConstraintKey::MemorySize];

    /// Lowest value a hypervisor may be given for this key.
    pub fn floor(self) -> u64 {
        match self {
            Self::CpuCount => u64::from(MIN_CPU_COUNT),
            Self::MemorySize => MIN_MEMORY_MB,
        }
    }
}

impl fmt::Display for ConstraintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuCount => write!(f, "cpu_count"),
            Self::MemorySize => write!(f, "memory_size"),
        }
    }
}

/// A (possibly partial) set of constraint values.
///
/// An absent key means "unknown" for queried constraints and "don't care"
/// for desired ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints(BTreeMap<ConstraintKey, u64>);

impl Constraints {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a complete set from CPU count and memory (MiB).
    pub fn of(cpu_count: u32, memory_mb: u64) -> Self {
        Self::new()
            .with(ConstraintKey::CpuCount, u64::from(cpu_count))
            .with(ConstraintKey::MemorySize, memory_mb)
    }

    /// Returns the set with `key` set to `value`.
    #[must_use]
    pub fn with(mut self, key: ConstraintKey, value: u64) -> Self {
        self.0.insert(key, value);
        self
    }

    /// Sets `key` to `value`.
    pub fn set(&mut self, key: ConstraintKey, value: u64) {
        self.0.insert(key, value);
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: ConstraintKey) -> Option<u64> {
        self.0.get(&key).copied()
    }

    /// CPU count, if present.
    pub fn cpu_count(&self) -> Option<u32> {
        self.get(ConstraintKey::CpuCount)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
    }

    /// Memory size in MiB, if present.
    pub fn memory_size(&self) -> Option<u64> {
        self.get(ConstraintKey::MemorySize)
    }

    /// Returns true if no key is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if every key in [`ConstraintKey::ALL`] is present.
    pub fn is_complete(&self) -> bool {
        ConstraintKey::ALL.iter().all(|k| self.0.contains_key(k))
    }

    /// Iterates over present keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (ConstraintKey, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl FromIterator<(ConstraintKey, u64)> for Constraints {
    fn from_iter<T: IntoIterator<Item = (ConstraintKey, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Returns the keys whose desired value is set and differs from current.
pub fn diff(current: &Constraints, desired: &Constraints) -> Constraints {
    desired
        .iter()
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .collect()
}

/// Completes a non-empty diff into a full constraint set.
///
/// Changed values are clamped to their floors; keys missing from the diff
/// are taken from `current`, or from the floor when unknown.
pub fn complete(current: &Constraints, changed: &Constraints) -> Constraints {
    ConstraintKey::ALL
        .iter()
        .map(|&key| {
            let value = changed
                .get(key)
                .map(|v| v.max(key.floor()))
                .or_else(|| current.get(key))
                .unwrap_or_else(|| key.floor());
            (key, value)
        })
        .collect()
}

/// Decides what, if anything, to apply to a hypervisor.
///
/// Returns `None` when the diff is empty, meaning the VM must not be touched.
pub fn reconcile(current: &Constraints, desired: &Constraints) -> Option<Constraints> {
    let changed = diff(current, desired);
    if changed.is_empty() {
        None
    } else {
        Some(complete(current, &changed))
    }
}
