/// Resource sampling: CPU, memory and uptime of bot processes plus a host
/// summary for the status page.
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Usage figures for one process.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub uptime: Duration,
}

/// Host-wide figures.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HostSummary {
    pub hostname: String,
    pub os: String,
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub uptime_secs: u64,
    pub arch: String,
    pub version: String,
}

impl HostSummary {
    /// Three-line summary shown above the bot table.
    pub fn to_text(&self) -> String {
        format!(
            "{} | {}\nCPU: {:.1}% | RAM: {:.1}% | Uptime: {}\nVersion: {} | Arch: {}",
            self.hostname,
            self.os,
            self.cpu_percent,
            self.ram_percent,
            format_uptime(Duration::from_secs(self.uptime_secs)),
            self.version,
            self.arch,
        )
    }
}

/// One round of sampling.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// Keyed by PID. A PID missing here could not be sampled.
    pub processes: HashMap<u32, ProcessUsage>,
    pub host: HostSummary,
}

/// Source of resource figures.
///
/// Implementations block (CPU usage needs two measurements some time
/// apart), so callers run them off the async executor. They must not fail:
/// processes that cannot be sampled are simply left out.
pub trait ResourceReporter: Send + Sync {
    fn sample(&self, pids: &[u32]) -> ResourceSample;
}

/// [`ResourceReporter`] backed by `sysinfo`.
pub struct SysinfoReporter {
    system: Mutex<System>,
}

impl SysinfoReporter {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceReporter for SysinfoReporter {
    fn sample(&self, pids: &[u32]) -> ResourceSample {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pids: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
        let kind = ProcessRefreshKind::new().with_cpu().with_memory();

        // CPU usage is a delta between two refreshes.
        system.refresh_cpu_usage();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&pids), true, kind);
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu_usage();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&pids), true, kind);
        system.refresh_memory();

        let total_memory = system.total_memory();
        let percent_of_total = |bytes: u64| {
            if total_memory == 0 {
                0.0
            } else {
                (bytes as f64 / total_memory as f64 * 100.0) as f32
            }
        };

        let processes = pids
            .iter()
            .filter_map(|pid| {
                let process = system.process(*pid)?;
                Some((
                    pid.as_u32(),
                    ProcessUsage {
                        cpu_percent: process.cpu_usage(),
                        mem_percent: percent_of_total(process.memory()),
                        uptime: Duration::from_secs(process.run_time()),
                    },
                ))
            })
            .collect();

        let host = HostSummary {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: format!(
                "{} {}",
                System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
                System::kernel_version().unwrap_or_default()
            )
            .trim_end()
            .to_string(),
            cpu_percent: system.global_cpu_usage(),
            ram_percent: percent_of_total(system.used_memory()),
            uptime_secs: System::uptime(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        ResourceSample { processes, host }
    }
}

/// Format a duration as `1d 2h 3m 4s`, omitting leading zero components.
/// Seconds are always shown.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    let mut parts = Vec::with_capacity(4);
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::ZERO), "0s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "59s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m 1s");
        assert_eq!(format_uptime(Duration::from_secs(3_600)), "1h 0s");
        assert_eq!(
            format_uptime(Duration::from_secs(86_400 + 2 * 3_600 + 3 * 60 + 4)),
            "1d 2h 3m 4s"
        );
        assert_eq!(format_uptime(Duration::from_secs(86_400 + 5)), "1d 5s");
    }

    #[test]
    fn test_host_summary_text() {
        let host = HostSummary {
            hostname: "box".to_string(),
            os: "Linux 6.1".to_string(),
            cpu_percent: 12.34,
            ram_percent: 56.78,
            uptime_secs: 3_661,
            arch: "x86_64".to_string(),
            version: "0.1.0".to_string(),
        };
        assert_eq!(
            host.to_text(),
            "box | Linux 6.1\nCPU: 12.3% | RAM: 56.8% | Uptime: 1h 1m 1s\nVersion: 0.1.0 | Arch: x86_64"
        );
    }

    #[test]
    fn test_sysinfo_samples_own_process() {
        let reporter = SysinfoReporter::new();
        let me = std::process::id();
        let sample = reporter.sample(&[me]);

        let usage = sample.processes.get(&me).expect("own process is sampled");
        assert!(usage.mem_percent > 0.0);
        assert!(usage.cpu_percent >= 0.0);
        assert!(sample.host.uptime_secs > 0);
        assert!(!sample.host.os.is_empty());
    }

    #[test]
    fn test_sysinfo_leaves_out_vanished_process() {
        let reporter = SysinfoReporter::new();
        // PIDs are capped well below this on Linux.
        let sample = reporter.sample(&[u32::MAX - 1]);
        assert!(sample.processes.is_empty());
    }
}
