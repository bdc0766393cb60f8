use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cicd_backup::config::{AppConfig, ConfigOverrides, ServiceName};
use cicd_backup::core::{
    ContainerRegistry, DockerRegistry, FailurePolicy, LogProgress, Orchestrator,
    ProgressReporter, RunOptions, TerminalProgress, select_jobs,
};
use cicd_backup::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use tracing::{info, trace};

#[derive(Parser)]
#[command(name = "cicd-backup")]
#[command(about = "Back up the data volumes of the CI/CD service containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    /// TOML config file (defaults to /etc/cicd-backup/config.toml if present)
    #[arg(long = "config", global = true)]
    config_file: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration and exit
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// The service to limit performing backups for (repeatable)
    #[arg(short, long, value_enum)]
    service: Vec<ServiceName>,

    /// Do not check that the service's container has exited before backing up
    #[arg(short = 'd', long)]
    skip_docker_check: bool,

    /// Attempt every service even if one fails
    #[arg(long)]
    keep_going: bool,

    /// Never draw a progress bar, log progress instead
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config_file.as_deref(), &cli.overrides)
        .context("Failed to load configuration")?;

    logging::init(LogConfig {
        json: cli.log_json,
        level: config.log_level,
    });

    match cli.command {
        Some(Commands::Config) => print_config(&config),
        None => run_backups(&config, &cli.run).await,
    }
}

fn print_config(config: &AppConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to serialize config")?;
    print!("{rendered}");
    Ok(())
}

async fn run_backups(config: &AppConfig, args: &RunArgs) -> Result<()> {
    let filter = (!args.service.is_empty()).then_some(args.service.as_slice());
    let jobs = select_jobs(&config.jobs(), filter);

    let registry: Option<Arc<dyn ContainerRegistry>> = if args.skip_docker_check {
        trace!("Not connecting to docker due to --skip-docker-check flag");
        None
    } else {
        Some(Arc::new(DockerRegistry::connect()?))
    };

    let progress: Arc<dyn ProgressReporter> =
        if args.no_progress || !std::io::stderr().is_terminal() {
            Arc::new(LogProgress::default())
        } else {
            Arc::new(TerminalProgress::new())
        };

    let mut options = RunOptions::new(
        config.backup_directory.clone(),
        chrono::Local::now().date_naive(),
    );
    options.skip_docker_check = args.skip_docker_check;
    options.history_directory = config.history_directory.clone();
    if args.keep_going {
        options.failure_policy = FailurePolicy::KeepGoing;
    }

    info!(
        run_id = %options.run_id,
        jobs = jobs.len(),
        "Starting backup run"
    );

    let summary = Orchestrator::new(options, registry, progress)
        .run(&jobs)
        .await?;

    for report in &summary.completed {
        info!(
            service = %report.service,
            archive = %report.archive_path.display(),
            archive_bytes = report.archive.archive_bytes,
            "Backup written"
        );
    }

    Ok(())
}
