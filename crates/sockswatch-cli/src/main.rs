use std::io;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use merge::Merge;
use sockswatch_config::{Config, ServerCatalog, load_from_file, load_from_paths};
use sockswatch_logging::init_logging;
use sockswatch_ssh::SshLauncher;
use sockswatch_supervisor::{
    Health, HealthProbe, RestartOutcome, Snapshot, SupervisorSettings, TcpProbe, TunnelStatus,
    TunnelSupervisor,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

mod console;

use console::{Command, parse_command, render_event, render_row};

type Supervisor = TunnelSupervisor<SshLauncher, TcpProbe>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// JSON config file to use instead of the default search paths.
    #[arg(long, env = "SOCKSWATCH_CONFIG")]
    pub config: Option<String>,
    #[arg(long, env = "SOCKSWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,
    #[arg(long)]
    pub probe_timeout_ms: Option<u64>,
    #[arg(long)]
    pub ssh_binary: Option<String>,
    #[arg(long)]
    pub no_color: bool,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Starts one SSH SOCKS tunnel per configured server and watches them.
    Run,
    /// Prints the configured servers.
    List,
    /// Probes every configured local port once without starting anything.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- Configuration Setup ---
    let config = build_config(&cli)?;

    // --- Logging ---
    init_logging(config.log_level.as_deref().unwrap_or("info"), !cli.no_color, false)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    if cli.no_color {
        colored::control::set_override(false);
    }

    debug!("Final configuration: {:#?}", config);

    match cli.command {
        Commands::Run => run(&cli, config).await,
        Commands::List => list(&config),
        Commands::Check => check(&config).await,
    }
}

/// Defaults, then the config file, then command-line flags.
fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let file_config = match &cli.config {
        Some(path) => load_from_file(path)?,
        None => load_from_paths()?,
    };
    let cli_config = Config {
        poll_interval_secs: cli.poll_interval_secs,
        probe_timeout_ms: cli.probe_timeout_ms,
        ssh_binary: cli.ssh_binary.clone(),
        log_level: cli.log_level.clone(),
        ..Default::default()
    };
    let mut config = Config::defaults();
    config.merge(file_config);
    config.merge(cli_config);
    Ok(config)
}

fn load_catalog(config: &Config) -> anyhow::Result<ServerCatalog> {
    let catalog = config.catalog_provider().load()?;
    if catalog.is_empty() {
        warn!(
            "No servers configured. Set {}_1_HOST and {}_1_PORT or add a 'servers' list to the config file.",
            prefix(config),
            prefix(config)
        );
    }
    Ok(catalog)
}

fn prefix(config: &Config) -> &str {
    config.env_prefix.as_deref().unwrap_or("SERVER")
}

async fn run(cli: &Cli, config: Config) -> anyhow::Result<()> {
    let launcher = SshLauncher::new(&config);

    if cli.dry_run {
        let catalog = load_catalog(&config)?;
        info!("[dry-run] Would supervise {} tunnel(s):", catalog.len());
        for spec in catalog.iter() {
            info!("[dry-run] [{}] {}", spec.id, launcher.command_line(spec));
        }
        info!(
            "[dry-run] Each local port would be probed every {}s",
            SupervisorSettings::from_config(&config).poll_interval.as_secs()
        );
        return Ok(());
    }

    let supervisor = TunnelSupervisor::new(
        launcher,
        TcpProbe::from_config(&config),
        SupervisorSettings::from_config(&config),
    );
    let printer = supervisor.subscribe(|event| println!("{}", render_event(&event)));

    let provider = config.catalog_provider();
    supervisor.start(provider.as_ref()).await?;
    print_status(&supervisor.snapshot());
    info!("Commands: status, restart <id>, reload, quit. Press Ctrl+C to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut hangup = Hangup::new()?;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => execute(cli, &supervisor, command).await,
                    Ok(None) => {}
                    Err(e) => warn!("{}", e),
                },
                Ok(None) => {
                    debug!("Console input closed; waiting for a signal");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    stdin_open = false;
                }
            },
            _ = hangup.recv() => {
                info!("Received SIGHUP. Reloading server list...");
                reload(cli, &supervisor).await;
            }
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                warn!("Received shutdown signal. Cleaning up...");
                break;
            }
        }
    }

    let report = supervisor.shutdown().await;
    for (id, e) in &report.failures {
        error!(server = %id, "Failed to stop tunnel: {}", e);
    }
    info!("Shutdown complete. {} tunnel(s) terminated.", report.terminated);

    // Dropping the last handle closes the event channel so the printer drains and exits.
    drop(supervisor);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Event printer did not finish in time");
    }
    Ok(())
}

async fn execute(cli: &Cli, supervisor: &Supervisor, command: Command) {
    match command {
        Command::Status => print_status(&supervisor.snapshot()),
        Command::Restart(id) => match supervisor.restart(id).await {
            Ok(RestartOutcome::Restarted { generation }) => {
                info!(server = %id, generation, "Tunnel restarted");
            }
            Ok(RestartOutcome::Coalesced { generation }) => {
                info!(server = %id, generation, "Tunnel was already restarted by another request");
            }
            Ok(RestartOutcome::SpawnFailed { error, .. }) => {
                error!(server = %id, "Restart failed: {}", error);
            }
            Err(e) => warn!("{}", e),
        },
        Command::Reload => reload(cli, supervisor).await,
        Command::Quit => {}
    }
}

/// Re-reads configuration from its sources and applies the new server list.
async fn reload(cli: &Cli, supervisor: &Supervisor) {
    let catalog = match build_config(cli).and_then(|config| load_catalog(&config)) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Reload aborted, keeping current tunnels: {}", e);
            return;
        }
    };
    match supervisor.reload(catalog).await {
        Ok(report) => info!(
            "Reloaded: {} added, {} removed, {} replaced, {} unchanged",
            report.added.len(),
            report.removed.len(),
            report.replaced.len(),
            report.unchanged.len()
        ),
        Err(e) => error!("Reload failed: {}", e),
    }
}

fn print_status(snapshot: &Snapshot) {
    if snapshot.is_empty() {
        println!("No tunnels.");
        return;
    }
    for (id, status) in snapshot.iter() {
        println!("{}", render_row(*id, status));
    }
}

fn list(config: &Config) -> anyhow::Result<()> {
    let catalog = load_catalog(config)?;
    for spec in catalog.iter() {
        println!(
            "{:>3}  {:<24} socks5://127.0.0.1:{:<5} via {}",
            spec.id, spec.display_name, spec.port, spec.host
        );
    }
    Ok(())
}

async fn check(config: &Config) -> anyhow::Result<()> {
    let catalog = load_catalog(config)?;
    let probe = Arc::new(TcpProbe::from_config(config));

    let mut probes = JoinSet::new();
    for spec in catalog.iter().cloned() {
        let probe = Arc::clone(&probe);
        probes.spawn(async move {
            let status = probe.check(spec.port).await;
            (spec, status)
        });
    }

    let mut results = Vec::with_capacity(catalog.len());
    while let Some(joined) = probes.join_next().await {
        results.push(joined?);
    }
    results.sort_by_key(|(spec, _)| spec.id);

    for (spec, status) in results {
        let health = match status {
            Ok(status) => Health::from(status),
            Err(e) => {
                error!(server = %spec.id, "Probe failed: {}", e);
                continue;
            }
        };
        let row = TunnelStatus {
            display_name: spec.display_name,
            host: spec.host,
            port: spec.port,
            health,
            generation: 0,
            pid: None,
        };
        println!("{}", render_row(spec.id, &row));
    }
    Ok(())
}

/// SIGHUP as a reload request. Never fires off unix.
#[cfg(unix)]
struct Hangup(signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> io::Result<Self> {
        Ok(Self(signal::unix::signal(signal::unix::SignalKind::hangup())?))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
