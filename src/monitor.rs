//! Monitor loop: one long-lived task per bot.
//!
//! ```text
//! loop {
//!   ├─► disabled?  → OFFLINE, sleep(poll), re-check
//!   ├─► STARTING → spawn ──err──► ERROR + record ─┐
//!   │                 │                           │
//!   │                 ▼                           │
//!   │                ON → wait for exit           │
//!   │                 ├─► code 0      → (relaunch)│
//!   │                 ├─► requested   → (relaunch)│
//!   │                 └─► abnormal    → DOWN + record
//!   └─► sleep(cooldown) ◄─────────────────────────┘
//! }
//! ```
//!
//! The loop never ends on its own: every exit, clean or not, leads to a
//! relaunch after the cooldown. Shutdown is observed at each suspension
//! point (wait, cooldown, poll); on shutdown the running child is terminated
//! and the loop returns.

use crate::config::TimingConfig;
use crate::discovery::Bot;
use crate::disabled::DisabledSet;
use crate::launcher::Launcher;
use crate::registry::{BotStatus, Registry, RunOutcome};
use crate::signals::Shutdown;
use std::sync::Arc;
use std::time::Duration;

/// Pauses used by every monitor loop.
#[derive(Debug, Clone, Copy)]
pub struct MonitorTiming {
    /// Pause after any exit or failure before relaunching.
    pub cooldown: Duration,
    /// How often a disabled bot re-checks the disabled set.
    pub poll_interval: Duration,
    /// How long a child gets between SIGTERM and SIGKILL on shutdown.
    pub stop_grace: Duration,
}

impl From<&TimingConfig> for MonitorTiming {
    fn from(config: &TimingConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            poll_interval: config.poll_interval(),
            stop_grace: config.stop_grace(),
        }
    }
}

/// Everything a monitor loop shares with the rest of the supervisor.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    pub registry: Arc<Registry>,
    pub disabled: Arc<DisabledSet>,
    pub launcher: Arc<Launcher>,
    pub timing: MonitorTiming,
    pub shutdown: Shutdown,
}

enum Flow {
    Continue,
    Shutdown,
}

/// Drive `bot` through its lifecycle until shutdown.
pub async fn run(ctx: MonitorContext, bot: Bot) {
    let name = bot.name.as_str();
    let mut shutdown = ctx.shutdown.clone();
    let mut parked = false;
    tracing::debug!(bot = %name, "monitor loop started");

    while !shutdown.is_triggered() {
        if ctx.disabled.contains(name) {
            if !parked {
                tracing::info!(bot = %name, "bot disabled, parking");
                parked = true;
            }
            ctx.registry.terminate(name, BotStatus::Offline);
            if !pause(ctx.timing.poll_interval, &mut shutdown).await {
                break;
            }
            continue;
        }
        parked = false;

        if let Flow::Shutdown = run_once(&ctx, &bot, &mut shutdown).await {
            break;
        }
        if !pause(ctx.timing.cooldown, &mut shutdown).await {
            break;
        }
    }

    tracing::debug!(bot = %name, "monitor loop stopped");
}

/// One launch → wait → classify cycle.
async fn run_once(ctx: &MonitorContext, bot: &Bot, shutdown: &mut Shutdown) -> Flow {
    let name = bot.name.as_str();
    ctx.registry.set_status(name, BotStatus::Starting);

    let mut running = match ctx.launcher.spawn(bot) {
        Ok(running) => running,
        Err(e) => {
            tracing::warn!(bot = %name, error = %e, "bot failed to launch");
            ctx.registry
                .finish_run(name, RunOutcome::Failed(e.to_string()));
            return Flow::Continue;
        }
    };
    ctx.registry.mark_launched(name, running.handle());

    // A disable that landed between the top-of-loop check and publishing the
    // handle found nothing to terminate; catch it here.
    if ctx.disabled.contains(name) {
        ctx.registry.terminate(name, BotStatus::Offline);
    }

    let waited = tokio::select! {
        result = running.wait() => Some(result),
        _ = shutdown.wait() => None,
    };

    let Some(result) = waited else {
        if let Err(e) = running.shutdown(ctx.timing.stop_grace).await {
            tracing::warn!(bot = %name, error = %e, "failed to stop bot on shutdown");
        }
        ctx.registry.finish_run(name, RunOutcome::Clean);
        ctx.registry.set_status(name, BotStatus::Offline);
        return Flow::Shutdown;
    };

    let outcome = match result {
        Ok(exit) => match exit.failure_message() {
            None => RunOutcome::Clean,
            Some(message) => RunOutcome::Abnormal(message),
        },
        Err(e) => RunOutcome::Failed(e.to_string()),
    };

    let requested = ctx.registry.finish_run(name, outcome.clone());
    match (&outcome, requested) {
        (_, true) => tracing::info!(bot = %name, "bot stopped on request"),
        (RunOutcome::Clean, false) => {
            tracing::info!(bot = %name, "bot exited cleanly, relaunching after cooldown")
        }
        (RunOutcome::Abnormal(message), false) => {
            tracing::warn!(bot = %name, error = %message, "bot exited abnormally")
        }
        (RunOutcome::Failed(message), false) => {
            tracing::warn!(bot = %name, error = %message, "lost track of bot process")
        }
    }
    Flow::Continue
}

/// Sleep for `duration`. Returns false if shutdown arrived first.
async fn pause(duration: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.wait() => false,
    }
}
