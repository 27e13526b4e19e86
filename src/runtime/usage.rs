//! Resource usage accounting for one runtime.
//!
//! | Counter         | Aggregation                          |
//! |-----------------|--------------------------------------|
//! | `cpu_*_ns`      | running maximum of cumulative values |
//! | `ram_max_bytes` | running maximum                      |
//! | `ram_avg_bytes` | running mean over non-empty samples  |
//! | `clock_ms`      | wall time since start                |
//!
//! The engine reports cumulative CPU time, but a final sample taken while
//! the container shuts down may read zero. Taking the maximum keeps every
//! counter monotonic.

use crate::engine::StatsSample;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Point-in-time copy of a runtime's usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub clock_ms: u64,
    pub cpu_kernel_ns: u64,
    pub cpu_user_ns: u64,
    pub cpu_total_ns: u64,
    pub ram_max_bytes: u64,
    pub ram_avg_bytes: u64,
}

/// Accumulates samples into [`UsageCounters`].
#[derive(Debug, Default)]
pub(crate) struct UsageTracker {
    counters: UsageCounters,
    samples: u64,
    started: Option<Instant>,
    finished: bool,
}

impl UsageTracker {
    pub(crate) fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub(crate) fn record(&mut self, sample: &StatsSample) {
        if *sample == StatsSample::default() {
            return;
        }

        let c = &mut self.counters;
        c.cpu_total_ns = c.cpu_total_ns.max(sample.cpu_total_ns);
        c.cpu_kernel_ns = c.cpu_kernel_ns.max(sample.cpu_kernel_ns);
        c.cpu_user_ns = c.cpu_user_ns.max(sample.cpu_user_ns);
        c.ram_max_bytes = c.ram_max_bytes.max(sample.memory_bytes);

        self.samples += 1;
        let n = u128::from(self.samples);
        let avg = u128::from(c.ram_avg_bytes);
        let next = (avg * (n - 1) + u128::from(sample.memory_bytes)) / n;
        c.ram_avg_bytes = u64::try_from(next).unwrap_or(u64::MAX);

        self.tick();
    }

    /// Freezes the clock.
    pub(crate) fn finish(&mut self) {
        self.tick();
        self.finished = true;
    }

    pub(crate) fn snapshot(&mut self) -> UsageCounters {
        self.tick();
        self.counters
    }

    fn tick(&mut self) {
        if self.finished {
            return;
        }
        if let Some(started) = self.started {
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.counters.clock_ms = self.counters.clock_ms.max(elapsed);
        }
    }
}
