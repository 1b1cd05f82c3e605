//! Host memory and CPU gauges parsed from `/proc`.
//!
//! The parsers are pure functions over file contents so they can be tested
//! with string fixtures; [`HostSampler`] reads the files under a configurable
//! proc root and keeps the previous CPU times for utilization deltas.

use std::path::{Path, PathBuf};

use metrica_core::Metric;
use tracing::debug;

pub const TOTAL_MEMORY: &str = "TotalMemory";
pub const FREE_MEMORY: &str = "FreeMemory";
pub const CPU_UTILIZATION_PREFIX: &str = "CPUutilization";

/// Memory totals from `/proc/meminfo`, in kB as the kernel reports them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
}

/// Parses `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> MemInfo {
    let mut info = MemInfo::default();

    let parse_kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            info.mem_total = parse_kb(line);
        } else if line.starts_with("MemFree:") {
            info.mem_free = parse_kb(line);
        }
    }

    info
}

/// Jiffies of one CPU line from `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub cpu_id: u32,
    pub busy: u64,
    pub total: u64,
}

/// Parses the per-CPU lines (`cpu0`, `cpu1`, ...) of `/proc/stat`. The aggregate `cpu` line is skipped.
pub fn parse_cpu_times(content: &str) -> Vec<CpuTimes> {
    let mut cpus = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(cpu_id) = parts
            .first()
            .and_then(|p| p.strip_prefix("cpu"))
            .and_then(|id| id.parse::<u32>().ok())
        else {
            continue;
        };

        let get_val =
            |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        // user nice system idle iowait irq softirq steal; guest time is already in user.
        let total: u64 = (1..=8).map(get_val).sum();
        let idle = get_val(4) + get_val(5);
        cpus.push(CpuTimes {
            cpu_id,
            busy: total.saturating_sub(idle),
            total,
        });
    }

    cpus
}

/// Busy percentage per CPU between two samples. CPUs without a previous
/// sample, or with no elapsed jiffies, report 0.
pub fn utilization(prev: &[CpuTimes], cur: &[CpuTimes]) -> Vec<(u32, f64)> {
    cur.iter()
        .map(|c| {
            let pct = prev
                .iter()
                .find(|p| p.cpu_id == c.cpu_id)
                .and_then(|p| {
                    let total = c.total.checked_sub(p.total)?;
                    let busy = c.busy.checked_sub(p.busy)?;
                    (total > 0).then(|| busy as f64 * 100.0 / total as f64)
                })
                .unwrap_or(0.0);
            (c.cpu_id, pct)
        })
        .collect()
}

pub struct HostSampler {
    proc_path: PathBuf,
    prev_cpu: Vec<CpuTimes>,
}

impl HostSampler {
    pub fn new(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
            prev_cpu: Vec::new(),
        }
    }

    fn read(&self, name: &str) -> Option<String> {
        let path = self.proc_path.join(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "host stats unavailable");
                None
            }
        }
    }

    /// Returns the memory and per-CPU utilization gauges. Unreadable files contribute nothing.
    pub fn sample(&mut self) -> Vec<Metric> {
        let mut metrics = Vec::new();

        if let Some(content) = self.read("meminfo") {
            let info = parse_meminfo(&content);
            metrics.push(Metric::gauge(TOTAL_MEMORY, (info.mem_total * 1024) as f64));
            metrics.push(Metric::gauge(FREE_MEMORY, (info.mem_free * 1024) as f64));
        }

        if let Some(content) = self.read("stat") {
            let cpus = parse_cpu_times(&content);
            for (cpu_id, pct) in utilization(&self.prev_cpu, &cpus) {
                metrics.push(Metric::gauge(
                    format!("{CPU_UTILIZATION_PREFIX}{}", cpu_id + 1),
                    pct,
                ));
            }
            self.prev_cpu = cpus;
        }

        metrics
    }

    pub fn proc_path(&self) -> &Path {
        &self.proc_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrica_core::MetricValue;
    use tempfile::tempdir;

    const MEMINFO: &str = "\
MemTotal:       16384000 kB
MemFree:         8192000 kB
MemAvailable:   12000000 kB
Buffers:          512000 kB
";

    const STAT_1: &str = "\
cpu  10000 500 3000 80000 1000 200 100 0 0 0
cpu0 2500 125 750 20000 250 50 25 0 0 0
cpu1 2500 125 750 20000 250 50 25 0 0 0
ctxt 500000
btime 1700000000
";

    // cpu0: +100 busy of +400 total; cpu1: +0 busy of +200 total.
    const STAT_2: &str = "\
cpu  10100 500 3000 80500 1000 200 100 0 0 0
cpu0 2600 125 750 20300 250 50 25 0 0 0
cpu1 2500 125 750 20200 250 50 25 0 0 0
ctxt 500100
";

    fn gauge(metrics: &[Metric], name: &str) -> f64 {
        match metrics.iter().find(|m| m.name == name).map(|m| m.value) {
            Some(MetricValue::Gauge(v)) => v,
            other => panic!("{name}: unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(MEMINFO);
        assert_eq!(info.mem_total, 16384000);
        assert_eq!(info.mem_free, 8192000);
    }

    #[test]
    fn test_parse_cpu_times() {
        let cpus = parse_cpu_times(STAT_1);
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[0].cpu_id, 0);
        assert_eq!(cpus[0].total, 2500 + 125 + 750 + 20000 + 250 + 50 + 25);
        assert_eq!(cpus[0].busy, 2500 + 125 + 750 + 50 + 25);
        assert_eq!(cpus[1].cpu_id, 1);
    }

    #[test]
    fn test_utilization() {
        let prev = parse_cpu_times(STAT_1);
        let cur = parse_cpu_times(STAT_2);
        let util = utilization(&prev, &cur);
        assert_eq!(util, vec![(0, 25.0), (1, 0.0)]);

        let first = utilization(&[], &cur);
        assert_eq!(first, vec![(0, 0.0), (1, 0.0)]);
    }

    #[test]
    fn sampler_reads_proc_root() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::write(dir.path().join("stat"), STAT_1).unwrap();

        let mut sampler = HostSampler::new(dir.path());
        let first = sampler.sample();
        assert_eq!(gauge(&first, TOTAL_MEMORY), 16384000.0 * 1024.0);
        assert_eq!(gauge(&first, FREE_MEMORY), 8192000.0 * 1024.0);
        assert_eq!(gauge(&first, "CPUutilization1"), 0.0);
        assert_eq!(gauge(&first, "CPUutilization2"), 0.0);

        std::fs::write(dir.path().join("stat"), STAT_2).unwrap();
        let second = sampler.sample();
        assert_eq!(gauge(&second, "CPUutilization1"), 25.0);
    }

    #[test]
    fn missing_files_yield_nothing() {
        let dir = tempdir().unwrap();
        let mut sampler = HostSampler::new(dir.path().join("absent"));
        assert!(sampler.sample().is_empty());
    }
}
