use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use jobrun::config::{LogFormat, LoggingConfig, Settings};
use jobrun::jobs::{execute_job, JobKind, JobStatus, LoggingExecutor};
use jobrun::storage::{self, job_runs, ConnectionManager};

#[derive(Parser)]
#[command(
    name = "jobrun",
    about = "Job-triggering API with durable run tracking",
    version,
    long_about = None
)]
struct Cli {
    /// Settings file (TOML). Defaults to $JOBRUN_CONFIG, then built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + periodic trigger)
    Serve {
        /// Bind address, overrides host/port from settings
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a job once and record the run
    Run {
        /// Job name
        #[arg(long)]
        job_name: String,

        /// Record it as a training job
        #[arg(long)]
        train: bool,
    },

    /// Show the latest run of a job
    Status {
        /// Job name
        #[arg(long)]
        job_name: String,
    },

    /// List recent runs of a job
    History {
        /// Job name
        #[arg(long)]
        job_name: String,

        /// Maximum runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print the effective settings
    ShowConfig,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings.logging);
    settings.log_effective();

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                let Some((host, port)) = bind.rsplit_once(':') else {
                    bail!("--bind must be HOST:PORT, got '{bind}'");
                };
                settings.host = host.to_string();
                settings.port = port.parse()?;
            }
            tracing::info!(bind = %settings.bind_addr(), env = %settings.runtime_env, "Starting jobrun daemon");
            let shutdown = jobrun::shutdown::install_shutdown_handler();
            jobrun::serve(settings, shutdown).await?;
        }
        Commands::Run { job_name, train } => {
            let kind = if train { JobKind::Train } else { JobKind::Run };
            let connections = ConnectionManager::new(storage::open_pool(&settings.database)?);
            let mut handle = connections.request_scope().await?;
            let run = execute_job(&mut handle, &LoggingExecutor, &job_name, kind).await?;
            println!("Run {} of '{}': {}", run.id, run.job_name, run.status);
            if run.status != JobStatus::Success {
                bail!("job '{}' failed", run.job_name);
            }
        }
        Commands::Status { job_name } => {
            let connections = ConnectionManager::new(storage::open_pool(&settings.database)?);
            let latest =
                connections.with_request_scope(|h| job_runs::find_latest(h, &job_name))?;
            match latest {
                Some(run) => println!(
                    "{}: {} (run {}, started {}, updated {})",
                    run.job_name,
                    run.status,
                    run.id,
                    run.start_ts.to_rfc3339(),
                    run.update_ts.to_rfc3339()
                ),
                None => println!("No runs recorded for '{}'.", job_name),
            }
        }
        Commands::History { job_name, limit } => {
            let connections = ConnectionManager::new(storage::open_pool(&settings.database)?);
            let runs =
                connections.with_request_scope(|h| job_runs::list_recent(h, &job_name, limit))?;
            if runs.is_empty() {
                println!("No runs recorded for '{}'.", job_name);
            } else {
                println!("{:<8} | {:<8} | {:<32} | Ended", "Run", "Status", "Started");
                println!("{:-<8}-|-{:-<8}-|-{:-<32}-|-{:-<32}", "", "", "", "");
                for run in runs {
                    let ended = run
                        .end_ts
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<8} | {:<8} | {:<32} | {}",
                        run.id,
                        run.status,
                        run.start_ts.to_rfc3339(),
                        ended
                    );
                }
            }
        }
        Commands::ShowConfig => {
            print!("{}", settings.to_redacted_toml()?);
            println!("# database uri: {}", jobrun::redact_uri(&settings.database.uri()));
        }
    }
    Ok(())
}
