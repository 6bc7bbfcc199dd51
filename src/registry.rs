//! Worker registry: the shared, per-bot record of status, live process
//! handle and recent errors.
//!
//! The set of bots is fixed when the registry is built. Each record sits
//! behind its own mutex, held only to copy or mutate the record and never
//! across an await, so no operation can block on a child process and no
//! operation spans two bots.

use chrono::{DateTime, Local};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Number of errors kept per bot.
pub const MAX_ERRORS: usize = 5;

/// Lifecycle state of a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BotStatus {
    Offline,
    Starting,
    On,
    Down,
    Error,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BotStatus::Offline => "OFFLINE",
            BotStatus::Starting => "STARTING",
            BotStatus::On => "ON",
            BotStatus::Down => "DOWN",
            BotStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub at: DateTime<Local>,
    pub message: String,
}

impl std::fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

/// Bounded FIFO of the most recent errors, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ErrorHistory {
    entries: VecDeque<ErrorEntry>,
}

impl ErrorHistory {
    pub fn push(&mut self, message: impl Into<String>) {
        self.entries.push_back(ErrorEntry {
            at: Local::now(),
            message: message.into(),
        });
        while self.entries.len() > MAX_ERRORS {
            self.entries.pop_front();
        }
    }

    pub fn to_vec(&self) -> Vec<ErrorEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Reference to a launched child process.
///
/// The monitor loop owns the child; the registry and control actions hold
/// clones for signalling and sampling. The handle goes stale once the child
/// is reaped. The child leads its own process group, so signals go to the
/// whole group.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// False once the owning loop has reaped the child.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exited(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Ask the process group to exit (SIGTERM). No-op on a stale handle.
    pub fn terminate(&self) -> bool {
        self.signal(Signal::SIGTERM)
    }

    /// Force the process group down (SIGKILL). No-op on a stale handle.
    pub fn kill(&self) -> bool {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, signal: Signal) -> bool {
        // pid 0 would address our own process group.
        if !self.is_alive() || self.pid == 0 {
            return false;
        }
        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pid = self.pid, signal = ?signal, error = %e, "failed to signal process group");
                false
            }
        }
    }
}

/// How a run ended, as classified by the monitor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code 0: nothing to record.
    Clean,
    /// The child ran and ended badly (non-zero exit or foreign signal).
    Abnormal(String),
    /// Launching or waiting on the child failed.
    Failed(String),
}

#[derive(Debug)]
struct BotRecord {
    status: BotStatus,
    process: Option<ProcessHandle>,
    errors: ErrorHistory,
    /// The next exit of the current process was requested by a control action.
    termination_requested: bool,
    /// A monitor loop currently exists for this bot.
    monitored: bool,
}

impl BotRecord {
    fn new() -> Self {
        Self {
            status: BotStatus::Offline,
            process: None,
            errors: ErrorHistory::default(),
            termination_requested: false,
            monitored: false,
        }
    }

    fn live_process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref().filter(|p| p.is_alive())
    }
}

/// Point-in-time copy of one bot's record.
#[derive(Debug, Clone)]
pub struct BotSnapshot {
    pub status: BotStatus,
    /// Present only while the process is alive.
    pub process: Option<ProcessHandle>,
    pub errors: Vec<ErrorEntry>,
}

/// Shared registry of every discovered bot.
#[derive(Debug)]
pub struct Registry {
    records: HashMap<String, Mutex<BotRecord>>,
}

impl Registry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = names
            .into_iter()
            .map(|n| (n.into(), Mutex::new(BotRecord::new())))
            .collect();
        Self { records }
    }

    /// Sorted bot names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn with_record<R>(&self, name: &str, f: impl FnOnce(&mut BotRecord) -> R) -> Option<R> {
        let cell = self.records.get(name)?;
        let mut record = cell.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut record))
    }

    /// Returns false for unknown bots.
    pub fn set_status(&self, name: &str, status: BotStatus) -> bool {
        self.with_record(name, |r| r.status = status).is_some()
    }

    pub fn status(&self, name: &str) -> Option<BotStatus> {
        self.with_record(name, |r| r.status)
    }

    pub fn errors(&self, name: &str) -> Vec<ErrorEntry> {
        self.with_record(name, |r| r.errors.to_vec())
            .unwrap_or_default()
    }

    /// Append to the bot's error history, evicting the oldest beyond
    /// [`MAX_ERRORS`].
    pub fn record_error(&self, name: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        self.with_record(name, |r| r.errors.push(message)).is_some()
    }

    /// Publish a freshly spawned process and move the bot to `ON`.
    pub fn mark_launched(&self, name: &str, handle: ProcessHandle) -> bool {
        self.with_record(name, |r| {
            r.process = Some(handle);
            r.termination_requested = false;
            r.status = BotStatus::On;
        })
        .is_some()
    }

    /// The bot's process handle, if one is published and still alive.
    pub fn process_handle(&self, name: &str) -> Option<ProcessHandle> {
        self.with_record(name, |r| r.live_process().cloned())
            .flatten()
    }

    /// Control-side termination: signal a live process (SIGTERM) and set
    /// `status`, in one step. If the signal is delivered, the exit that
    /// follows is recorded as requested, so the monitor loop neither logs it as an error nor
    /// overwrites `status`. Returns whether a live process was signalled,
    /// or `None` for unknown bots.
    pub fn terminate(&self, name: &str, status: BotStatus) -> Option<bool> {
        self.with_record(name, |r| {
            r.status = status;
            let Some(handle) = r.live_process().cloned() else {
                return false;
            };
            // Only a delivered signal makes the next exit a requested one.
            let signalled = handle.terminate();
            if signalled {
                r.termination_requested = true;
            }
            signalled
        })
    }

    /// Monitor-side end of a run: retire the handle and apply the outcome.
    /// Returns true when the exit was requested by a control action, in
    /// which case nothing is recorded and the status is left alone.
    pub fn finish_run(&self, name: &str, outcome: RunOutcome) -> bool {
        self.with_record(name, |r| {
            if let Some(handle) = r.process.take() {
                handle.mark_exited();
            }
            if std::mem::take(&mut r.termination_requested) {
                return true;
            }
            match outcome {
                RunOutcome::Clean => {}
                RunOutcome::Abnormal(message) => {
                    r.errors.push(message);
                    r.status = BotStatus::Down;
                }
                RunOutcome::Failed(message) => {
                    r.errors.push(message);
                    r.status = BotStatus::Error;
                }
            }
            false
        })
        .unwrap_or(false)
    }

    /// Claim the single monitor slot for `name`. False if a monitor already
    /// exists or the bot is unknown.
    pub fn claim_monitor(&self, name: &str) -> bool {
        self.with_record(name, |r| !std::mem::replace(&mut r.monitored, true))
            .unwrap_or(false)
    }

    pub fn release_monitor(&self, name: &str) {
        self.with_record(name, |r| r.monitored = false);
    }

    pub fn is_monitored(&self, name: &str) -> bool {
        self.with_record(name, |r| r.monitored).unwrap_or(false)
    }

    pub fn snapshot_one(&self, name: &str) -> Option<BotSnapshot> {
        self.with_record(name, |r| BotSnapshot {
            status: r.status,
            process: r.live_process().cloned(),
            errors: r.errors.to_vec(),
        })
    }

    /// Copy every record, one lock at a time.
    pub fn snapshot(&self) -> BTreeMap<String, BotSnapshot> {
        self.records
            .keys()
            .filter_map(|name| Some((name.clone(), self.snapshot_one(name)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bots_start_offline() {
        let reg = Registry::new(["a", "b"]);
        assert_eq!(reg.status("a"), Some(BotStatus::Offline));
        assert_eq!(reg.names(), vec!["a", "b"]);
        assert!(reg.status("zzz").is_none());
    }

    #[test]
    fn test_unknown_bot_operations_are_noops() {
        let reg = Registry::new(["a"]);
        assert!(!reg.set_status("ghost", BotStatus::On));
        assert!(!reg.record_error("ghost", "x"));
        assert!(!reg.finish_run("ghost", RunOutcome::Failed("x".into())));
        assert!(reg.errors("ghost").is_empty());
        assert!(reg.terminate("ghost", BotStatus::Offline).is_none());
        assert!(!reg.claim_monitor("ghost"));
        assert!(reg.process_handle("ghost").is_none());
        assert!(!reg.snapshot().contains_key("ghost"));
    }

    #[test]
    fn test_error_history_keeps_last_five_in_order() {
        let reg = Registry::new(["bot"]);
        for i in 1..=6 {
            reg.finish_run("bot", RunOutcome::Abnormal(format!("failure {i}")));
        }
        let errors = reg.errors("bot");
        let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["failure 2", "failure 3", "failure 4", "failure 5", "failure 6"]
        );
        assert!(errors.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[test]
    fn test_error_entry_display() {
        let mut history = ErrorHistory::default();
        history.push("boom");
        let rendered = history.to_vec()[0].to_string();
        assert!(rendered.ends_with(" - boom"));
        // "YYYY-MM-DD HH:MM:SS - boom"
        assert_eq!(rendered.len(), 19 + " - boom".len());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&BotStatus::On).unwrap(), "\"ON\"");
        assert_eq!(
            serde_json::to_string(&BotStatus::Offline).unwrap(),
            "\"OFFLINE\""
        );
        assert_eq!(BotStatus::Starting.to_string(), "STARTING");
    }

    #[test]
    fn test_launch_publishes_handle_and_sets_on() {
        let reg = Registry::new(["bot"]);
        reg.set_status("bot", BotStatus::Starting);
        reg.mark_launched("bot", ProcessHandle::new(4242));

        let snap = reg.snapshot_one("bot").unwrap();
        assert_eq!(snap.status, BotStatus::On);
        assert!(snap.process.is_some());
        assert_eq!(reg.process_handle("bot").unwrap().pid(), 4242);
    }

    #[test]
    fn test_finish_run_abnormal_records_and_marks_down() {
        let reg = Registry::new(["bot"]);
        let handle = ProcessHandle::new(4242);
        reg.mark_launched("bot", handle.clone());

        let requested = reg.finish_run("bot", RunOutcome::Abnormal("boom".into()));
        assert!(!requested);
        assert!(!handle.is_alive());
        let snap = reg.snapshot_one("bot").unwrap();
        assert_eq!(snap.status, BotStatus::Down);
        assert!(snap.process.is_none());
        assert_eq!(snap.errors.len(), 1);
        assert_eq!(snap.errors[0].message, "boom");
    }

    #[test]
    fn test_finish_run_failed_marks_error() {
        let reg = Registry::new(["bot"]);
        reg.set_status("bot", BotStatus::Starting);
        reg.finish_run("bot", RunOutcome::Failed("spawn denied".into()));
        assert_eq!(reg.status("bot"), Some(BotStatus::Error));
        assert_eq!(reg.errors("bot")[0].message, "spawn denied");
    }

    #[test]
    fn test_finish_run_clean_leaves_status() {
        let reg = Registry::new(["bot"]);
        reg.mark_launched("bot", ProcessHandle::new(4242));
        reg.finish_run("bot", RunOutcome::Clean);
        assert_eq!(reg.status("bot"), Some(BotStatus::On));
        assert!(reg.errors("bot").is_empty());
        assert!(reg.process_handle("bot").is_none());
    }

    #[tokio::test]
    async fn test_requested_exit_is_not_an_error() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let reg = Registry::new(["bot"]);
        reg.mark_launched("bot", ProcessHandle::new(child.id().unwrap()));

        assert_eq!(reg.terminate("bot", BotStatus::Offline), Some(true));
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        let requested = reg.finish_run("bot", RunOutcome::Abnormal("Terminated by signal 15".into()));
        assert!(requested);
        assert_eq!(reg.status("bot"), Some(BotStatus::Offline));
        assert!(reg.errors("bot").is_empty());

        // The intent is consumed: the next abnormal exit is recorded again.
        reg.mark_launched("bot", ProcessHandle::new(1));
        reg.finish_run("bot", RunOutcome::Abnormal("crash".into()));
        assert_eq!(reg.errors("bot").len(), 1);
    }

    #[test]
    fn test_terminate_without_process_only_sets_status() {
        let reg = Registry::new(["bot"]);
        assert_eq!(reg.terminate("bot", BotStatus::Offline), Some(false));
        assert_eq!(reg.status("bot"), Some(BotStatus::Offline));

        // No stale intent is left behind to swallow a later crash.
        reg.mark_launched("bot", ProcessHandle::new(1));
        assert!(!reg.finish_run("bot", RunOutcome::Abnormal("crash".into())));
    }

    #[test]
    fn test_undelivered_signal_leaves_next_crash_recorded() {
        // A reaped child's pid leads no process group, so killpg fails.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let reg = Registry::new(["bot"]);
        reg.mark_launched("bot", ProcessHandle::new(pid));
        assert_eq!(reg.terminate("bot", BotStatus::Starting), Some(false));

        assert!(!reg.finish_run("bot", RunOutcome::Abnormal("crash".into())));
        assert_eq!(reg.status("bot"), Some(BotStatus::Down));
        let errors = reg.errors("bot");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "crash");
    }

    #[test]
    fn test_stale_handle_is_not_signalled() {
        let handle = ProcessHandle::new(4242);
        handle.mark_exited();
        assert!(!handle.is_alive());
        assert!(!handle.terminate());
        assert!(!handle.kill());
    }

    #[test]
    fn test_monitor_claim_is_exclusive() {
        let reg = Arc::new(Registry::new(["bot"]));
        let winners: usize = (0..16)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.claim_monitor("bot"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert!(reg.is_monitored("bot"));

        reg.release_monitor("bot");
        assert!(!reg.is_monitored("bot"));
        assert!(reg.claim_monitor("bot"));
    }
}
