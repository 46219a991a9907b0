//! Resource metric snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource usage of one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
}

/// All running containers at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerStatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub containers: Vec<ContainerStats>,
}

/// Resource usage of one pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodMetrics {
    pub name: String,
    pub namespace: String,
    /// CPU in millicores
    pub cpu_usage: u64,
    /// Memory in bytes
    pub memory_usage: u64,
}

/// Pod usage for one cluster at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetricsSnapshot {
    pub cluster: String,
    pub timestamp: DateTime<Utc>,
    pub pods: Vec<PodMetrics>,
}

/// Parse a Kubernetes CPU quantity ("250m", "1", "0.5") into millicores
pub fn parse_cpu_quantity(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(milli) = s.strip_suffix('m') {
        return milli.parse().ok();
    }
    if let Some(nano) = s.strip_suffix('n') {
        return nano.parse::<u64>().ok().map(|n| n / 1_000_000);
    }
    s.parse::<f64>().ok().map(|cores| (cores * 1000.0).round() as u64)
}

/// Parse a memory quantity ("128Mi", "1Gi", "512k", "1000") into bytes
pub fn parse_memory_quantity(s: &str) -> Option<u64> {
    let s = s.trim();
    const UNITS: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, factor) in UNITS {
        if let Some(value) = s.strip_suffix(suffix) {
            return value.parse::<f64>().ok().map(|v| (v * factor as f64) as u64);
        }
    }
    s.parse().ok()
}

/// Parse a human size as printed by `docker stats` ("12.5MiB", "1.2kB", "0B")
pub fn parse_docker_size(s: &str) -> Option<u64> {
    let s = s.trim();
    const UNITS: [(&str, f64); 8] = [
        ("KiB", 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("TiB", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("kB", 1e3),
        ("MB", 1e6),
        ("GB", 1e9),
        ("TB", 1e12),
    ];
    for (suffix, factor) in UNITS {
        if let Some(value) = s.strip_suffix(suffix) {
            return value.trim().parse::<f64>().ok().map(|v| (v * factor) as u64);
        }
    }
    s.strip_suffix('B')
        .unwrap_or(s)
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| v as u64)
}
