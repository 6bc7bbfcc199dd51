//! Supervisor: owns the monitor loops and exposes the control actions and
//! the status report used by the HTTP surface.
//!
//! Control actions only mutate the registry and the disabled set; the
//! monitor loops observe those changes on their next wake. Each bot has at
//! most one loop, guarded by the registry's monitor claim.

use crate::discovery::Bot;
use crate::disabled::DisabledSet;
use crate::launcher::Launcher;
use crate::monitor::{self, MonitorContext, MonitorTiming};
use crate::registry::{BotStatus, Registry, RunOutcome};
use crate::reporter::{format_uptime, HostSummary, ResourceReporter, ResourceSample};
use crate::signals::{self, Shutdown, ShutdownTrigger};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::{JoinHandle, JoinSet};

/// Errors surfaced to control callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    UnknownBot(String),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::UnknownBot(name) => write!(f, "unknown bot '{name}'"),
        }
    }
}

impl std::error::Error for ControlError {}

/// Per-bot row of the status report.
#[derive(Debug, Clone, Serialize)]
pub struct BotReport {
    pub status: BotStatus,
    pub cpu: f32,
    pub mem: f32,
    /// Formatted uptime, or `-` when the bot has no sampled process.
    pub uptime: String,
    /// Recent errors, oldest first, as `<timestamp> - <message>`.
    pub errors: Vec<String>,
}

/// Everything the status page shows.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub system_info: String,
    pub host: HostSummary,
    pub bots: BTreeMap<String, BotReport>,
}

pub struct Supervisor {
    bots: BTreeMap<String, Bot>,
    ctx: MonitorContext,
    reporter: Arc<dyn ResourceReporter>,
    trigger: ShutdownTrigger,
    tasks: Mutex<JoinSet<()>>,
}

impl Supervisor {
    /// Build a supervisor for `bots`. `disabled` must already be loaded;
    /// no loop runs until [`Supervisor::start`].
    pub fn new(
        bots: BTreeMap<String, Bot>,
        launcher: Launcher,
        disabled: DisabledSet,
        reporter: Arc<dyn ResourceReporter>,
        timing: MonitorTiming,
    ) -> Self {
        let (trigger, shutdown) = signals::channel();
        let ctx = MonitorContext {
            registry: Arc::new(Registry::new(bots.keys().cloned())),
            disabled: Arc::new(disabled),
            launcher: Arc::new(launcher),
            timing,
            shutdown,
        };
        Self {
            bots,
            ctx,
            reporter,
            trigger,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    pub fn disabled(&self) -> &DisabledSet {
        &self.ctx.disabled
    }

    /// Listener that resolves once [`Supervisor::shutdown`] begins.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.trigger.subscribe()
    }

    /// Start a monitor loop for every bot that is not disabled. Disabled
    /// bots are marked `OFFLINE` and get no loop until enabled.
    pub fn start(&self) {
        for bot in self.bots.values() {
            if self.ctx.disabled.contains(&bot.name) {
                self.ctx.registry.set_status(&bot.name, BotStatus::Offline);
                tracing::info!(bot = %bot.name, "bot is disabled, not starting");
            } else {
                self.ctx.registry.set_status(&bot.name, BotStatus::Starting);
                self.ensure_monitor(bot);
            }
        }
    }

    fn ensure_monitor(&self, bot: &Bot) {
        if self.ctx.shutdown.is_triggered() || !self.ctx.registry.claim_monitor(&bot.name) {
            return;
        }
        let ctx = self.ctx.clone();
        let bot = bot.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.spawn(async move {
            let loop_ctx = ctx.clone();
            supervise(ctx, bot.name.clone(), move || {
                monitor::run(loop_ctx.clone(), bot.clone())
            })
            .await;
        });
    }

    fn known(&self, name: &str) -> Result<&Bot, ControlError> {
        self.bots.get(name).ok_or_else(|| {
            tracing::warn!(bot = %name, "control action for unknown bot");
            ControlError::UnknownBot(name.to_string())
        })
    }

    /// Terminate the running process (if any) and mark the bot `STARTING`;
    /// its loop relaunches it after the cooldown. A disabled bot stays
    /// `OFFLINE`.
    pub fn restart(&self, name: &str) -> Result<(), ControlError> {
        self.known(name)?;
        let status = if self.ctx.disabled.contains(name) {
            BotStatus::Offline
        } else {
            BotStatus::Starting
        };
        let signalled = self.ctx.registry.terminate(name, status);
        tracing::info!(bot = %name, signalled = ?signalled, "restart requested");
        Ok(())
    }

    /// One-shot kill: terminate and mark `OFFLINE`. The bot stays in
    /// rotation and is relaunched on the next loop iteration; use
    /// [`Supervisor::disable`] to keep it down.
    pub fn stop(&self, name: &str) -> Result<(), ControlError> {
        self.known(name)?;
        let signalled = self.ctx.registry.terminate(name, BotStatus::Offline);
        tracing::info!(bot = %name, signalled = ?signalled, "stop requested");
        Ok(())
    }

    /// Persistently disable: record in the disabled set, terminate, mark
    /// `OFFLINE`.
    pub fn disable(&self, name: &str) -> Result<(), ControlError> {
        self.known(name)?;
        // Insert before terminating: a loop that launches concurrently
        // re-checks the set after publishing its handle.
        self.ctx.disabled.insert(name);
        self.ctx.registry.terminate(name, BotStatus::Offline);
        tracing::info!(bot = %name, "bot disabled");
        Ok(())
    }

    /// Remove from the disabled set, mark `STARTING` and make sure a loop
    /// is running. A bot that was not disabled is left alone.
    pub fn enable(&self, name: &str) -> Result<(), ControlError> {
        let bot = self.known(name)?;
        if self.ctx.disabled.remove(name) {
            self.ctx.registry.set_status(name, BotStatus::Starting);
            tracing::info!(bot = %name, "bot enabled");
        }
        self.ensure_monitor(bot);
        Ok(())
    }

    /// Sample every live bot and the host, and build the status report.
    pub async fn status_report(&self) -> StatusReport {
        let snapshot = self.ctx.registry.snapshot();
        let pids: Vec<u32> = snapshot
            .values()
            .filter_map(|s| s.process.as_ref().map(|p| p.pid()))
            .collect();

        let reporter = Arc::clone(&self.reporter);
        let sample = match tokio::task::spawn_blocking(move || reporter.sample(&pids)).await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %e, "resource sampling failed");
                ResourceSample {
                    processes: HashMap::new(),
                    host: HostSummary::default(),
                }
            }
        };

        let bots = snapshot
            .into_iter()
            .map(|(name, snap)| {
                let usage = snap
                    .process
                    .as_ref()
                    .and_then(|p| sample.processes.get(&p.pid()))
                    .copied()
                    .unwrap_or_default();
                let uptime = if usage.uptime.as_secs() > 0 {
                    format_uptime(usage.uptime)
                } else {
                    "-".to_string()
                };
                let report = BotReport {
                    status: snap.status,
                    cpu: usage.cpu_percent,
                    mem: usage.mem_percent,
                    uptime,
                    errors: snap.errors.iter().map(ToString::to_string).collect(),
                };
                (name, report)
            })
            .collect();

        StatusReport {
            system_info: sample.host.to_text(),
            host: sample.host,
            bots,
        }
    }

    /// Stop every loop (terminating running bots) and wait for them.
    pub async fn shutdown(&self) {
        self.trigger.trigger();
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        tracing::info!(loops = tasks.len(), "stopping monitor loops");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "monitor task ended abnormally");
            }
        }
    }
}

/// Run the loop produced by `make_loop` until it returns. A panic inside
/// the loop is recorded against the bot and a fresh loop is started after
/// the cooldown; the monitor claim is released when this returns.
async fn supervise<F, Fut>(ctx: MonitorContext, name: String, make_loop: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let mut task = AbortOnDrop(tokio::spawn(make_loop()));
        match (&mut task.0).await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(bot = %name, panic = %message, "monitor loop panicked, restarting it");
                // Retire whatever handle the dead loop left behind; a panic
                // counts as an error even if a control action was pending.
                ctx.registry.finish_run(&name, RunOutcome::Clean);
                ctx.registry
                    .record_error(&name, format!("monitor loop panicked: {message}"));
                ctx.registry.set_status(&name, BotStatus::Error);
                let resumed = tokio::select! {
                    _ = tokio::time::sleep(ctx.timing.cooldown) => true,
                    _ = shutdown.wait() => false,
                };
                if !resumed {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(bot = %name, error = %e, "monitor loop cancelled");
                break;
            }
        }
    }
    ctx.registry.release_monitor(&name);
}

/// Aborts the wrapped task when dropped, so cancelling [`supervise`] also
/// stops the loop it spawned.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
