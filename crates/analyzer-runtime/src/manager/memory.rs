//! Process and system memory sampling using sysinfo.

use serde::Serialize;
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySample {
    /// Resident memory of this process in MiB, when readable.
    pub process_mb: Option<f64>,
    /// System memory in use, MiB.
    pub used_mb: u64,
    /// Total system memory, MiB.
    pub total_mb: u64,
    /// `used / total` in percent.
    pub percent: f64,
}

/// Reuses one [`System`] between samples.
pub struct MemorySampler {
    system: System,
    pid: Option<Pid>,
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler {
    /// Sampler for the current process.
    pub fn new() -> Self {
        Self {
            system: System::new_with_specifics(RefreshKind::nothing().with_memory(MemoryRefreshKind::everything())),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Refresh and read.
    pub fn sample(&mut self) -> MemorySample {
        self.system
            .refresh_specifics(RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()));
        let process_mb = self.pid.and_then(|pid| {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            self.system
                .process(pid)
                .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        });

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        MemorySample {
            process_mb,
            used_mb: used / 1024 / 1024,
            total_mb: total / 1024 / 1024,
            percent: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_consistent() {
        let sample = MemorySampler::new().sample();
        assert!(sample.used_mb <= sample.total_mb);
        assert!((0.0..=100.0).contains(&sample.percent));
    }
}
