/// Bot process lifecycle: spawn the bot's command, forward its output,
/// keep a bounded tail of stderr, wait for exit, and terminate it.
use crate::config::LauncherConfig;
use crate::discovery::Bot;
use crate::registry::ProcessHandle;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long to wait for the stderr reader to drain after the child exits.
/// Grandchildren that inherited the pipe can keep it open indefinitely.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors from launching or waiting on a bot process.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to spawn the bot process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed while waiting for the bot process to exit.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { command, source } => {
                write!(f, "failed to spawn {command}: {source}")
            }
            LaunchError::Wait { source } => {
                write!(f, "failed to wait for bot process: {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::Wait { source } => Some(source),
        }
    }
}

/// Result of a finished bot process.
#[derive(Debug)]
pub struct BotExit {
    /// Process exit code (None if killed by signal).
    pub code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Tail of everything the process wrote to stderr.
    pub stderr: String,
    /// Wall-clock run time.
    pub duration: Duration,
}

impl BotExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Text describing an unsuccessful exit: the captured stderr, or the
    /// exit code / signal when stderr was empty. None on success.
    pub fn failure_message(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return Some(stderr.to_string());
        }
        Some(match (self.code, self.signal) {
            (Some(code), _) => format!("Exit code {code}"),
            (None, Some(signal)) => format!("Terminated by signal {signal}"),
            (None, None) => "Exited with unknown status".to_string(),
        })
    }
}

/// Bounded buffer holding the last `cap` bytes of a stream.
#[derive(Debug)]
struct Tail {
    text: String,
    cap: usize,
}

impl Tail {
    fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.cap {
            let mut cut = self.text.len() - self.cap;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
}

/// Spawns bot processes from the configured command template.
#[derive(Debug, Clone)]
pub struct Launcher {
    config: LauncherConfig,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Build the command arguments, replacing `{name}`, `{dir}` and
    /// `{entrypoint}` with the bot's values.
    fn build_args(&self, bot: &Bot) -> Vec<String> {
        let dir = bot.launch_path.to_string_lossy();
        let entrypoint = bot.entrypoint.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{name}", &bot.name)
                    .replace("{dir}", &dir)
                    .replace("{entrypoint}", &entrypoint)
            })
            .collect()
    }

    /// Spawn the bot process.
    ///
    /// The process is spawned in its own process group (via
    /// `process_group(0)`) so terminating it also reaches anything it
    /// started, such as the interpreter behind a shell wrapper.
    pub fn spawn(&self, bot: &Bot) -> Result<RunningBot, LaunchError> {
        let args = self.build_args(bot);
        tracing::debug!(
            bot = %bot.name,
            command = %self.config.command,
            args = ?args,
            "spawning bot"
        );

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                command: self.config.command.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(bot = %bot.name, pid, "bot process started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, bot.name.clone(), "stdout", None));
        }
        let tail = Arc::new(Mutex::new(Tail::new(self.config.stderr_tail_bytes)));
        let stderr_reader = child.stderr.take().map(|stderr| {
            tokio::spawn(forward_lines(
                stderr,
                bot.name.clone(),
                "stderr",
                Some(Arc::clone(&tail)),
            ))
        });

        Ok(RunningBot {
            name: bot.name.clone(),
            child,
            handle: ProcessHandle::new(pid),
            tail,
            stderr_reader,
            started: Instant::now(),
            reaped: false,
        })
    }
}

/// Read `reader` line by line, logging each line and optionally keeping a
/// tail of the text.
async fn forward_lines<R>(
    reader: R,
    bot: String,
    stream: &'static str,
    tail: Option<Arc<Mutex<Tail>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!(bot = %bot, stream, "{}", line.trim_end());
                if let Some(tail) = &tail {
                    tail.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&line);
                }
            }
            Err(e) => {
                tracing::debug!(bot = %bot, stream, error = %e, "stopped reading bot output");
                break;
            }
        }
    }
}

/// A launched bot process, owned by its monitor loop.
///
/// Dropping a `RunningBot` whose process has not been reaped kills the
/// whole process group.
#[derive(Debug)]
pub struct RunningBot {
    name: String,
    child: Child,
    handle: ProcessHandle,
    tail: Arc<Mutex<Tail>>,
    stderr_reader: Option<JoinHandle<()>>,
    started: Instant,
    reaped: bool,
}

impl RunningBot {
    /// Shared handle for the registry.
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// Wait for the process to exit. Cancel-safe.
    pub async fn wait(&mut self) -> Result<BotExit, LaunchError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| LaunchError::Wait { source: e })?;
        Ok(self.collect(status).await)
    }

    /// Terminate the process group with SIGTERM, escalating to SIGKILL if
    /// it is still running after `grace`.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<BotExit, LaunchError> {
        self.handle.terminate();
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(result) => result.map_err(|e| LaunchError::Wait { source: e })?,
            Err(_) => {
                tracing::warn!(
                    bot = %self.name,
                    pid = self.pid(),
                    grace_secs = grace.as_secs_f64(),
                    "bot ignored SIGTERM, killing"
                );
                self.handle.kill();
                self.child
                    .wait()
                    .await
                    .map_err(|e| LaunchError::Wait { source: e })?
            }
        };
        Ok(self.collect(status).await)
    }

    async fn collect(&mut self, status: ExitStatus) -> BotExit {
        self.reaped = true;
        self.handle.mark_exited();
        if let Some(reader) = self.stderr_reader.take() {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader)
                .await
                .is_err()
            {
                tracing::debug!(bot = %self.name, "stderr still open after exit, using partial capture");
            }
        }
        let stderr = {
            let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut tail.text)
        };
        let exit = BotExit {
            code: status.code(),
            signal: status.signal(),
            stderr,
            duration: self.started.elapsed(),
        };
        tracing::info!(
            bot = %self.name,
            pid = self.pid(),
            exit_code = ?exit.code,
            signal = ?exit.signal,
            duration_secs = exit.duration.as_secs(),
            "bot process exited"
        );
        exit
    }
}

impl Drop for RunningBot {
    fn drop(&mut self) {
        if !self.reaped {
            self.handle.kill();
        }
    }
}
