//! Metrics probe: point-in-time CPU, memory, disk and load snapshot
//!
//! Reads /proc on Linux and statvfs for disk usage. Anything that cannot be
//! read on the current platform is reported as zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of metrics snapshots, swapped for a fixed one in tests
pub trait MetricsProbe: Send + Sync {
    fn snapshot(&self) -> MetricsSnapshot;
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub load_average: LoadAverage,
    pub uptime_seconds: u64,
    pub collected_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// All-zero snapshot, reported when collection itself fails
    pub fn empty() -> Self {
        Self {
            cpu: CpuMetrics::default(),
            memory: MemoryMetrics::default(),
            disk: DiskMetrics::default(),
            load_average: LoadAverage::default(),
            uptime_seconds: 0,
            collected_at: Utc::now(),
        }
    }
}

/// Take a snapshot on the blocking pool; probes read files synchronously
pub async fn collect_metrics(probe: &Arc<dyn MetricsProbe>) -> MetricsSnapshot {
    let probe = Arc::clone(probe);
    match tokio::task::spawn_blocking(move || probe.snapshot()).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Metrics collection failed: {e}");
            MetricsSnapshot::empty()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuMetrics {
    pub cores: usize,
    /// 1-minute load normalised by core count, capped at 100
    pub load_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskMetrics {
    pub path: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Reads the live host
pub struct SystemProbe {
    disk_path: PathBuf,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            disk_path: PathBuf::from("/"),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProbe for SystemProbe {
    fn snapshot(&self) -> MetricsSnapshot {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let load_average = read_proc("/proc/loadavg")
            .map(|s| parse_loadavg(&s))
            .unwrap_or_default();
        let memory = read_proc("/proc/meminfo")
            .map(|s| parse_meminfo(&s))
            .unwrap_or_default();
        let uptime_seconds = read_proc("/proc/uptime")
            .map(|s| parse_uptime(&s))
            .unwrap_or(0);

        MetricsSnapshot {
            cpu: CpuMetrics {
                cores,
                load_percent: (load_average.one / cores as f64 * 100.0).min(100.0),
            },
            memory,
            disk: read_disk(&self.disk_path),
            load_average,
            uptime_seconds,
            collected_at: Utc::now(),
        }
    }
}

fn read_proc(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .map_err(|e| debug!("Cannot read {path}: {e}"))
        .ok()
}

fn read_disk(path: &std::path::Path) -> DiskMetrics {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as f64;
            let total = stat.blocks() as f64 * fragment;
            let free = stat.blocks_free() as f64 * fragment;
            let available = stat.blocks_available() as f64 * fragment;
            let used = total - free;
            // Same ratio df reports: used / (used + available to unprivileged users)
            let percent = if used + available > 0.0 {
                used / (used + available) * 100.0
            } else {
                0.0
            };
            DiskMetrics {
                path: path.display().to_string(),
                total_gb: total / GB,
                used_gb: used / GB,
                available_gb: available / GB,
                percent,
            }
        }
        Err(e) => {
            debug!("statvfs({}) failed: {e}", path.display());
            DiskMetrics {
                path: path.display().to_string(),
                ..Default::default()
            }
        }
    }
}

fn parse_loadavg(contents: &str) -> LoadAverage {
    let mut fields = contents
        .split_whitespace()
        .map(|v| v.parse::<f64>().unwrap_or(0.0));
    LoadAverage {
        one: fields.next().unwrap_or(0.0),
        five: fields.next().unwrap_or(0.0),
        fifteen: fields.next().unwrap_or(0.0),
    }
}

fn parse_meminfo(contents: &str) -> MemoryMetrics {
    let mut total_kb: u64 = 0;
    let mut available_kb: u64 = 0;
    for line in contents.lines() {
        let value = || {
            line.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        if line.starts_with("MemTotal:") {
            total_kb = value();
        } else if line.starts_with("MemAvailable:") {
            available_kb = value();
        }
        if total_kb > 0 && available_kb > 0 {
            break;
        }
    }

    let used_kb = total_kb.saturating_sub(available_kb);
    let percent = if total_kb > 0 {
        used_kb as f64 / total_kb as f64 * 100.0
    } else {
        0.0
    };
    MemoryMetrics {
        total_mb: total_kb / 1024,
        used_mb: used_kb / 1024,
        available_mb: available_kb / 1024,
        percent,
    }
}

fn parse_uptime(contents: &str) -> u64 {
    contents
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|secs| secs as u64)
        .unwrap_or(0)
}
