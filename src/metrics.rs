//! Host Metrics
//!
//! Resource figures a node reports with every heartbeat.

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

/// Snapshot of local resource usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_cores: u32,
    pub ram_mb: u64,
    /// Percentages in the range 0..=100
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
}

/// Collect a metrics snapshot
///
/// CPU usage needs two samples, so this blocks for the sysinfo minimum
/// update interval; call it from `spawn_blocking`.
pub fn collect() -> NodeMetrics {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu();

    let total_memory = sys.total_memory();
    let mem_usage = percent(sys.used_memory(), total_memory);

    NodeMetrics {
        cpu_cores: sys.cpus().len().max(1) as u32,
        ram_mb: total_memory / 1024 / 1024,
        cpu_usage: round2(sys.global_cpu_info().cpu_usage() as f64),
        mem_usage,
        disk_usage: root_disk_usage(),
    }
}

/// Usage of the filesystem mounted at `/`, or of the largest disk
fn root_disk_usage() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().max_by_key(|d| d.total_space()));

    match disk {
        Some(d) => percent(d.total_space().saturating_sub(d.available_space()), d.total_space()),
        None => 0.0,
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(used as f64 * 100.0 / total as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(512, 1024), 50.0);
    }

    #[test]
    fn test_collect_reports_hardware() {
        let metrics = collect();
        assert!(metrics.cpu_cores >= 1);
        assert!((0.0..=100.0).contains(&metrics.mem_usage));
        assert!((0.0..=100.0).contains(&metrics.disk_usage));
    }
}
