mod config;
mod data_dir;
mod disabled;
mod discovery;
mod launcher;
mod lock;
mod monitor;
mod registry;
mod reporter;
#[cfg(feature = "serve")]
mod serve;
mod signals;
mod supervisor;
#[cfg(test)]
mod testutil;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Supervise a directory of bot processes: launch each one, relaunch it
/// when it exits, and control them over HTTP.
#[derive(Parser, Debug)]
#[command(name = "botcommander", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "botcommander.toml")]
    config: PathBuf,

    /// Directory of bots (overrides config)
    #[arg(long)]
    bots_dir: Option<PathBuf>,

    /// Data directory for the disabled list and lock (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between an exit and the next launch (overrides config)
    #[arg(long)]
    cooldown: Option<u64>,

    /// Print resolved settings and discovered bots, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging, including bot stdout
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut config::SupervisorConfig) {
        if let Some(dir) = &self.bots_dir {
            config.bots.dir = dir.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(bind) = &self.bind {
            config.serve.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.serve.port = port;
        }
        if let Some(secs) = self.cooldown {
            config.supervisor.cooldown_secs = secs;
        }
    }

    fn log_filter(&self) -> tracing_subscriber::EnvFilter {
        use tracing_subscriber::EnvFilter;

        if self.verbose {
            EnvFilter::new("botcommander=debug")
        } else if self.quiet {
            EnvFilter::new("botcommander=warn")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("botcommander=info"))
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = config::load(&cli.config)?;
    cli.apply_overrides(&mut config);

    let bots = discovery::discover(&config.bots.dir, &config.bots.entrypoint);
    let data_dir = data_dir::DataDir::new(&config.storage.data_dir);

    if cli.dry_run {
        print_dry_run(&cli, &config, &data_dir, &bots);
        return Ok(());
    }

    if data_dir.init()? {
        tracing::info!(path = %data_dir.root().display(), "created data directory");
    }
    let lock = lock::SingletonLock::acquire(&data_dir.lock())?;
    tracing::debug!(path = %lock.path().display(), "acquired supervisor lock");

    let disabled = disabled::DisabledSet::load(disabled::DisabledStore::new(data_dir.disabled()));
    let supervisor = Arc::new(supervisor::Supervisor::new(
        bots,
        launcher::Launcher::new(config.launcher.clone()),
        disabled,
        Arc::new(reporter::SysinfoReporter::new()),
        monitor::MonitorTiming::from(&config.supervisor),
    ));

    #[cfg(feature = "serve")]
    let listener = serve::bind(&config.serve).await?;

    tracing::info!(
        bots = supervisor.registry().names().len(),
        "botcommander v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    supervisor.start();

    #[cfg(feature = "serve")]
    {
        let mut server = tokio::spawn(serve::run(
            listener,
            serve::router(Arc::clone(&supervisor)),
            supervisor.shutdown_signal(),
        ));

        let server_result = tokio::select! {
            _ = signals::os_shutdown_signal() => None,
            result = &mut server => Some(result),
        };
        supervisor.shutdown().await;
        let server_result = match server_result {
            Some(result) => result,
            None => server.await,
        };
        match server_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("HTTP server failed: {e}").into()),
            Err(e) => return Err(format!("HTTP server task failed: {e}").into()),
        }
    }

    #[cfg(not(feature = "serve"))]
    {
        signals::os_shutdown_signal().await;
        supervisor.shutdown().await;
    }

    tracing::info!("all bots stopped");
    Ok(())
}

fn print_dry_run(
    cli: &Cli,
    config: &config::SupervisorConfig,
    data_dir: &data_dir::DataDir,
    bots: &std::collections::BTreeMap<String, discovery::Bot>,
) {
    let store = disabled::DisabledStore::new(data_dir.disabled());
    let disabled_path = store.path().display().to_string();
    let disabled = disabled::DisabledSet::load(store).names();

    println!("botcommander v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", cli.config.display());
    println!("Bots dir: {}", config.bots.dir.display());
    println!("Entrypoint: {}", config.bots.entrypoint);
    println!(
        "Launcher: {} {}",
        config.launcher.command,
        config.launcher.args.join(" ")
    );
    println!(
        "Cooldown: {}s, poll interval: {}s, stop grace: {}s",
        config.supervisor.cooldown_secs,
        config.supervisor.poll_interval_secs,
        config.supervisor.stop_grace_secs
    );
    println!("Data dir: {}", data_dir.root().display());
    println!("Disabled list: {disabled_path}");
    println!("Listen: {}:{}", config.serve.bind, config.serve.port);
    println!("Bots ({}):", bots.len());
    for bot in bots.values() {
        let note = if disabled.contains(&bot.name) { " [disabled]" } else { "" };
        println!("  {} ({}){note}", bot.name, bot.entrypoint.display());
    }
    println!("Dry run mode, config validated, not running.");
}
