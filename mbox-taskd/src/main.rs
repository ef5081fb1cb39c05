use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mbox_taskd::config::{Config, DEFAULT_CONCURRENCY, Paths, SupervisorConfig};
use mbox_taskd::initialize_services;
use mbox_taskd::process::OsLauncher;

#[derive(Parser)]
#[command(name = "mbox-taskd")]
#[command(about = "mbox task daemon - runs app and platform task workers")]
struct Args {
    /// Data directory for the SQLite database, shared with workers
    #[arg(short, long, default_value = "/var/lib/mbox")]
    data_dir: PathBuf,

    /// Root directory for worker log files
    #[arg(short, long, default_value = "/var/log/mbox")]
    log_dir: PathBuf,

    /// Worker program for app tasks, started as `<program> <app_id>`
    #[arg(long, default_value = "/usr/lib/mbox/apptask")]
    apptask_program: PathBuf,

    /// Worker program for platform tasks, started as `<program> <task_type> [args]`
    #[arg(long, default_value = "/usr/lib/mbox/mbox-taskworker")]
    task_program: PathBuf,

    /// Maximum number of app task workers running at once
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Poll interval in milliseconds while draining app tasks on shutdown
    #[arg(long, default_value_t = 1000)]
    drain_poll_ms: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            paths: Paths {
                data_dir: args.data_dir,
                log_dir: args.log_dir,
                apptask_program: args.apptask_program,
                task_program: args.task_program,
            },
            supervisor: SupervisorConfig {
                concurrency: args.concurrency.max(1),
                start_paused: true,
                drain_poll_interval: Duration::from_millis(args.drain_poll_ms),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mbox_taskd=info".parse()?))
        .init();

    let args = Args::parse();
    let config = Config::from(args);

    info!(
        data_dir = %config.paths.data_dir.display(),
        log_dir = %config.paths.log_dir.display(),
        concurrency = config.supervisor.concurrency,
        "Starting mbox-taskd"
    );

    let services = initialize_services(config, Arc::new(OsLauncher::new()))
        .await
        .context("Failed to initialize task services")?;
    info!(tasks = ?services.tasks.registry().types(), "Platform tasks registered");

    // Re-derive outstanding app work from persisted state
    services
        .app_tasks
        .resume()
        .await
        .context("Failed to resume app tasks")?;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    if let Err(e) = services.app_tasks.pause().await {
        error!(error = %e, "Failed to stop app tasks");
    }
    if let Err(e) = services.app_tasks.drain_and_wait().await {
        error!(error = %e, "Failed to drain app tasks");
    }
    if let Err(e) = services.app_tasks.shutdown().await {
        error!(error = %e, "Failed to shut down app task dispatcher");
    }

    info!("mbox-taskd stopped");
    Ok(())
}
