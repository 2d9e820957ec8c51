//! System resource sampling
//!
//! Reads CPU, memory and disk utilization through the `sysinfo` crate.
//! Sampling is strictly best-effort: a reading that cannot be taken is
//! skipped, never surfaced to request handling.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Disks, System};
use tracing::debug;

/// One resource utilization snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SystemSample {
    /// Global CPU usage, percent
    pub cpu_percent: f64,
    /// Used memory as a share of total, percent
    pub memory_percent: f64,
    /// Used disk space summed over all disks, percent
    pub disk_percent: f64,
    pub timestamp: DateTime<Utc>,
}

/// Holds the sysinfo handles between refreshes
pub struct SystemSampler {
    system: System,
    disks: Disks,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Take a fresh sample, or `None` when the platform reports no usable
    /// totals
    pub fn sample(&mut self, timestamp: DateTime<Utc>) -> Option<SystemSample> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let cpu_percent = self.system.global_cpu_usage() as f64;

        let total_mem = self.system.total_memory();
        if total_mem == 0 {
            debug!("skipping system sample: no memory totals reported");
            return None;
        }
        let memory_percent = self.system.used_memory() as f64 / total_mem as f64 * 100.0;

        let (total_disk, used_disk) = self
            .disks
            .iter()
            .map(|d| (d.total_space(), d.total_space() - d.available_space()))
            .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));
        let disk_percent = if total_disk > 0 {
            used_disk as f64 / total_disk as f64 * 100.0
        } else {
            0.0
        };

        Some(SystemSample {
            cpu_percent,
            memory_percent,
            disk_percent,
            timestamp,
        })
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
