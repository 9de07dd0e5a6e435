use std::sync::Mutex;

use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use crate::scheduler::capacity::WorkerTelemetry;

const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = MB * 1024.0;

/// Source of the `resource_data` snapshot.
pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> WorkerTelemetry;
}

/// Host figures from `sysinfo`. CPU usage is measured between consecutive
/// snapshots, so the first one reads low.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::nothing().with_ram())
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn snapshot(&self) -> WorkerTelemetry {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory() as f64;
        let available = system.available_memory() as f64;
        let memory_percent = if total > 0.0 {
            (total - available) / total * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_free) = disks.list().iter().fold((0u64, 0u64), |(t, f), disk| {
            (t + disk.total_space(), f + disk.available_space())
        });
        let disk_percent = if disk_total > 0 {
            (disk_total - disk_free) as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        WorkerTelemetry {
            cpu_percent: system.global_cpu_usage() as f64,
            memory_percent,
            memory_total_mb: total / MB,
            memory_available_mb: available / MB,
            disk_percent,
            disk_free_gb: disk_free as f64 / GB,
            battery_percent: None,
            battery_plugged: None,
            active_containers: None,
        }
    }
}

/// Fixed snapshot, for hosts where probing is unwanted.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub WorkerTelemetry);

impl ResourceProbe for StaticProbe {
    fn snapshot(&self) -> WorkerTelemetry {
        self.0.clone()
    }
}
