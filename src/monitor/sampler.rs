use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};
use crate::types::ResourceVector;

/// Kernel clock ticks per second; fixed at 100 on Linux.
const CLK_TCK: f64 = 100.0;

/// Total system memory, read once.
static MEM_TOTAL_MB: Lazy<f64> = Lazy::new(|| {
    read_meminfo_field("MemTotal").unwrap_or(0.0)
});

/// System-wide usage figures.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsage {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

/// Seam for OS resource sampling. The production implementation reads the
/// process table on a blocking worker; tests inject scripted figures.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample_process(&self, pid: u32) -> Result<ResourceVector>;
    async fn sample_system(&self) -> Result<SystemUsage>;
}

#[derive(Default)]
struct CpuCounters {
    /// Per-pid (wall clock, cpu ticks) of the previous sample.
    process: HashMap<u32, (Instant, u64)>,
    /// (busy, total) jiffies of the previous system sample.
    system: Option<(u64, u64)>,
}

/// `/proc`-based sampler. CPU percentages are computed from the delta
/// against the previous sample, so the first reading for a pid reports 0.
pub struct ProcSampler {
    counters: Arc<Mutex<CpuCounters>>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Mutex::new(CpuCounters::default())),
        }
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for ProcSampler {
    async fn sample_process(&self, pid: u32) -> Result<ResourceVector> {
        let counters = self.counters.clone();
        tokio::task::spawn_blocking(move || sample_process_blocking(pid, &counters))
            .await
            .map_err(|e| Error::CoordError(CoordError::ProcessError(e.to_string())))?
    }

    async fn sample_system(&self) -> Result<SystemUsage> {
        let counters = self.counters.clone();
        tokio::task::spawn_blocking(move || sample_system_blocking(&counters))
            .await
            .map_err(|e| Error::CoordError(CoordError::ProcessError(e.to_string())))?
    }
}

fn sample_process_blocking(
    pid: u32,
    counters: &Mutex<CpuCounters>,
) -> Result<ResourceVector> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map_err(|_| Error::CoordError(CoordError::ProcessError(format!("no such pid {pid}"))))?;

    // Skip past the parenthesised comm field; the rest is space separated.
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 2..])
        .ok_or_else(|| Error::CoordError(CoordError::ProcessError("malformed stat".into())))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // utime and stime are overall fields 14 and 15; 11 and 12 after comm.
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);
    let ticks = utime + stime;

    let now = Instant::now();
    let cpu_percent = {
        let mut counters = counters.lock().unwrap_or_else(|e| e.into_inner());
        let previous = counters.process.insert(pid, (now, ticks));
        match previous {
            Some((then, old_ticks)) if now > then => {
                let elapsed = now.duration_since(then).as_secs_f64();
                let used = (ticks.saturating_sub(old_ticks)) as f64 / CLK_TCK;
                (used / elapsed * 100.0).min(100.0 * num_cpus() as f64)
            }
            _ => 0.0,
        }
    };

    let memory_mb = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                line.strip_prefix("VmRSS:").and_then(|rest| {
                    rest.trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse::<f64>()
                        .ok()
                })
            })
        })
        .map(|kb| kb / 1024.0)
        .unwrap_or(0.0);

    let disk_mb = std::fs::read_to_string(format!("/proc/{pid}/io"))
        .ok()
        .map(|io| {
            let mut bytes = 0.0;
            for line in io.lines() {
                if let Some(v) = line.strip_prefix("read_bytes:") {
                    bytes += v.trim().parse::<f64>().unwrap_or(0.0);
                } else if let Some(v) = line.strip_prefix("write_bytes:") {
                    bytes += v.trim().parse::<f64>().unwrap_or(0.0);
                }
            }
            bytes / (1024.0 * 1024.0)
        })
        .unwrap_or(0.0);

    Ok(ResourceVector {
        cpu_percent,
        memory_mb,
        // No portable per-process gpu or network counters.
        gpu_percent: 0.0,
        disk_mb,
        network_mbps: 0.0,
    })
}

fn sample_system_blocking(counters: &Mutex<CpuCounters>) -> Result<SystemUsage> {
    let stat = std::fs::read_to_string("/proc/stat")
        .map_err(|e| Error::CoordError(CoordError::ProcessError(e.to_string())))?;
    let cpu_line = stat
        .lines()
        .next()
        .ok_or_else(|| Error::CoordError(CoordError::ProcessError("empty /proc/stat".into())))?;

    let jiffies: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    let total: u64 = jiffies.iter().sum();
    let idle = jiffies.get(3).copied().unwrap_or(0) + jiffies.get(4).copied().unwrap_or(0);
    let busy = total.saturating_sub(idle);

    let cpu_percent = {
        let mut counters = counters.lock().unwrap_or_else(|e| e.into_inner());
        let previous = counters.system.replace((busy, total));
        match previous {
            Some((old_busy, old_total)) if total > old_total => {
                let busy_delta = busy.saturating_sub(old_busy) as f64;
                let total_delta = (total - old_total) as f64;
                busy_delta / total_delta * 100.0
            }
            _ => 0.0,
        }
    };

    let memory_total_mb = *MEM_TOTAL_MB;
    let memory_available_mb = read_meminfo_field("MemAvailable").unwrap_or(memory_total_mb);
    Ok(SystemUsage {
        cpu_percent,
        memory_used_mb: (memory_total_mb - memory_available_mb).max(0.0),
        memory_total_mb,
    })
}

fn read_meminfo_field(field: &str) -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo.lines().find_map(|line| {
        line.strip_prefix(field)?
            .trim_start_matches(':')
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse::<f64>()
            .ok()
            .map(|kb| kb / 1024.0)
    })
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_pid_errors() {
        let sampler = ProcSampler::new();
        // Pid 0 never has a /proc entry for a user process.
        assert!(sampler.sample_process(0).await.is_err());
    }

    #[tokio::test]
    async fn test_self_sample_has_memory() {
        let sampler = ProcSampler::new();
        let pid = std::process::id();
        if let Ok(usage) = sampler.sample_process(pid).await {
            assert!(usage.memory_mb > 0.0);
        }
    }
}
