mod kube;
mod launcher;
mod logging;
mod terminal;
mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use tunnelkeeper_core::app::App;
use tunnelkeeper_core::config::DashboardConfig;
use tunnelkeeper_core::graph::DependencyGraph;
use tunnelkeeper_core::message::{Inbox, Message};
use tunnelkeeper_core::runtime::{EventLoop, TaskRunner};

use crate::kube::KubeClient;
use crate::launcher::ProcessLauncher;
use crate::terminal::TerminalFrontend;

#[derive(Parser)]
#[command(name = "tunnelkeeper")]
#[command(about = "Supervise cluster tunnels and local proxies", long_about = None)]
struct Cli {
    /// Configuration file (default: discovered from the current directory upwards)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Primary cluster to connect to at startup
    #[arg(short, long, global = true)]
    primary: Option<String>,

    /// Secondary cluster nested in the primary
    #[arg(short, long, global = true)]
    secondary: Option<String>,

    /// Where diagnostics are written
    #[arg(long, env = "TUNNELKEEPER_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the services for the initial pair
    Check,
}

fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, DashboardConfig)> {
    match explicit {
        Some(path) => {
            let config = DashboardConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            Ok((path.to_path_buf(), config))
        }
        None => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            Ok(DashboardConfig::discover(&cwd)?)
        }
    }
}

fn run_check(path: &Path, config: &DashboardConfig) -> Result<()> {
    println!("config: {}", path.display());
    let Some(pair) = config.clusters.initial_pair() else {
        bail!("no initial cluster pair; set clusters.primary or pass --primary");
    };

    let services = config.services_for(&pair);
    println!("cluster pair: {}", pair.display());
    println!("services ({}):", services.len());
    for service in &services {
        println!(
            "  {:<24} {:<6} {:<9} {}",
            service.label,
            service.kind().label(),
            service.role.label(),
            service.describe()
        );
    }

    let order = DependencyGraph::build(&services).topo_order();
    println!("start order: {}", order.join(" -> "));
    Ok(())
}

async fn run_dashboard(path: &Path, config: DashboardConfig, log_file: &Path) -> Result<()> {
    logging::init(log_file)?;
    info!(config = %path.display(), log = %log_file.display(), "starting");

    let (inbox, rx) = Inbox::channel();
    let launcher = Arc::new(ProcessLauncher::new(config.tools.kubectl.clone()));
    let client = Arc::new(KubeClient::new(&config));
    let runner = TaskRunner::new(client, inbox.clone(), config.timings.clone());

    let initial = config.clusters.initial_pair();
    let mut app = App::new(config, launcher, inbox.clone());
    let boot = app.boot(initial);

    let mut frontend = TerminalFrontend::new(terminal::setup_terminal()?);
    if let Ok((width, height)) = crossterm::terminal::size() {
        inbox.send(Message::Resize { width, height });
    }
    let reader = terminal::spawn_input_reader(inbox);

    let result = EventLoop::new(app, runner, rx).run(&mut frontend, boot).await;
    frontend.restore()?;
    // The inbox is closed now, so the reader exits within one poll interval.
    if reader.join().is_err() {
        error!("input reader panicked");
    }

    let app = result?;
    info!(
        stale_discarded = app.snapshot().stale_discarded,
        "stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (path, mut config) = load_config(cli.config.as_deref())?;
    if let Some(primary) = cli.primary {
        config.clusters.primary = Some(primary);
    }
    if let Some(secondary) = cli.secondary {
        config.clusters.secondary = Some(secondary);
    }

    match cli.command {
        Some(Commands::Check) => run_check(&path, &config),
        None => {
            let log_file = cli.log_file.unwrap_or_else(logging::default_log_path);
            run_dashboard(&path, config, &log_file).await
        }
    }
}
