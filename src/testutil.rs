//! Fixtures shared by the process-level tests: shell-script bots, a `sh`
//! launcher and millisecond timings.

use crate::config::LauncherConfig;
use crate::discovery::Bot;
use crate::disabled::{DisabledSet, DisabledStore};
use crate::launcher::Launcher;
use crate::monitor::MonitorTiming;
use crate::reporter::{HostSummary, ProcessUsage, ResourceReporter, ResourceSample};
use crate::supervisor::Supervisor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Write `<dir>/<name>/main.sh` and return the bot for it.
pub fn script_bot(dir: &Path, name: &str, script: &str) -> Bot {
    let bot_dir = dir.join(name);
    std::fs::create_dir_all(&bot_dir).unwrap();
    std::fs::write(bot_dir.join("main.sh"), script).unwrap();
    Bot::new(name, bot_dir, "main.sh")
}

pub fn sh_launcher() -> Launcher {
    Launcher::new(LauncherConfig {
        command: "sh".to_string(),
        args: vec!["{entrypoint}".to_string()],
        stderr_tail_bytes: 4096,
    })
}

pub fn fast_timing() -> MonitorTiming {
    MonitorTiming {
        cooldown: Duration::from_millis(100),
        poll_interval: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Script that appends its PID to `<bot dir>/pids` and then sleeps.
pub const PID_LOGGING_SLEEPER: &str = "echo $$ >> \"$(dirname \"$0\")/pids\"\nexec sleep 30\n";

/// Lines of `<bot dir>/pids`.
pub fn logged_pids(bot: &Bot) -> Vec<u32> {
    std::fs::read_to_string(bot.launch_path.join("pids"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

/// Reports the same figures for every PID.
pub struct FixedReporter(pub ProcessUsage);

impl FixedReporter {
    pub fn new() -> Self {
        Self(ProcessUsage {
            cpu_percent: 1.5,
            mem_percent: 2.5,
            uptime: Duration::from_secs(90),
        })
    }
}

impl ResourceReporter for FixedReporter {
    fn sample(&self, pids: &[u32]) -> ResourceSample {
        ResourceSample {
            processes: pids.iter().map(|p| (*p, self.0)).collect(),
            host: HostSummary {
                hostname: "test-host".to_string(),
                os: "Linux".to_string(),
                cpu_percent: 10.0,
                ram_percent: 20.0,
                uptime_secs: 60,
                arch: "x86_64".to_string(),
                version: "0.1.0".to_string(),
            },
        }
    }
}

/// Supervisor over `bots` with its disabled set in `<dir>/disabled.json`.
/// Not started.
pub fn test_supervisor(dir: &Path, bots: &[&Bot]) -> Supervisor {
    let bots = bots.iter().map(|b| (b.name.clone(), (*b).clone())).collect();
    let disabled = DisabledSet::load(DisabledStore::new(dir.join("disabled.json")));
    Supervisor::new(
        bots,
        sh_launcher(),
        disabled,
        Arc::new(FixedReporter::new()),
        fast_timing(),
    )
}
