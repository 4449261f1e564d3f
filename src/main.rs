//! # ActionTrack — task notification worker and admin tooling
//!
//! Usage:
//!   actiontrack worker                 # Run the notification worker loop
//!   actiontrack worker --once          # Deliver whatever is due, then exit
//!   actiontrack jobs                   # List pending notification jobs
//!   actiontrack config                 # Print the effective configuration
//!   actiontrack init                   # Write a default config file
//!
//! Environment variables:
//!   TASK_NOTIFICATION_DELAY - debounce window in seconds (default: 20)
//!   RUST_LOG                - tracing filter (overrides --verbose)

use std::path::PathBuf;
use std::sync::Arc;

use actiontrack_core::TrackerConfig;
use actiontrack_core::traits::{EntityStore, JobFilter, JobQueue, NotificationJob};
use actiontrack_scheduler::{NotificationWorker, TaskDispatcher, TrackerDb, spawn_worker};
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "actiontrack",
    version,
    about = "📋 ActionTrack — debounced task notifications"
)]
struct Cli {
    /// Config file (default: ~/.actiontrack/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides worker.db_path)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the notification worker
    Worker {
        /// Run one polling round and exit
        #[arg(long)]
        once: bool,
    },
    /// List notification jobs
    Jobs {
        /// Include finished and cancelled jobs
        #[arg(long)]
        all: bool,

        /// Maximum jobs to show with --all
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&PathBuf>) -> Result<TrackerConfig> {
    match path {
        Some(path) => {
            let mut config = TrackerConfig::load_from(path)?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Ok(TrackerConfig::load()?),
    }
}

fn open_db(cli: &Cli, config: &TrackerConfig) -> Result<Arc<TrackerDb>> {
    let raw = cli.db.as_deref().unwrap_or(&config.worker.db_path);
    let path = PathBuf::from(expand_path(raw));
    tracing::debug!("Opening database {}", path.display());
    Ok(Arc::new(TrackerDb::open(&path)?))
}

fn print_jobs(jobs: &[NotificationJob], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<42} {:<13} {:<10} {:<12} {:<12} FIRE AT",
        "HANDLE", "KIND", "STATE", "RECIPIENT", "SUBJECT"
    );
    for job in jobs {
        println!(
            "{:<42} {:<13} {:<10} {:<12} {:<12} {}",
            job.handle.0,
            job.payload.kind.as_str(),
            job.state.as_str(),
            job.payload.recipient.to_string(),
            job.payload.subject.to_string(),
            job.fire_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "actiontrack=debug,actiontrack_scheduler=debug,actiontrack_channels=debug"
    } else {
        "actiontrack=info,actiontrack_scheduler=info,actiontrack_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match &cli.command {
        Commands::Worker { once } => {
            let db = open_db(&cli, &config)?;
            let store: Arc<dyn EntityStore> = db.clone();
            let queue: Arc<dyn JobQueue> = db;
            let mailer = actiontrack_channels::mailer_from_config(&config.mail)?;
            let dispatcher = TaskDispatcher::new(store, mailer, Arc::new(config.types.clone()))
                .with_enabled(config.notifications.enabled);
            let worker = Arc::new(
                NotificationWorker::new(queue, dispatcher, config.worker.batch_size)
                    .with_lease_secs(config.worker.lease_secs),
            );

            if *once {
                let stats = worker.run_due(chrono::Utc::now()).await?;
                println!(
                    "✅ {} reclaimed, {} claimed, {} sent, {} suppressed, {} failed",
                    stats.reclaimed, stats.claimed, stats.sent, stats.suppressed, stats.failed
                );
                return Ok(());
            }

            let poll = config.worker.poll_interval_secs;
            let handle = tokio::spawn(spawn_worker(worker, poll));
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received shutdown signal");
                }
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!("Worker task error: {e}");
                    }
                }
            }
            tracing::info!("Worker shutting down");
        }
        Commands::Jobs { all, limit, json } => {
            let db = open_db(&cli, &config)?;
            let jobs = if *all {
                db.recent_jobs(*limit)?
            } else {
                db.list_pending(&JobFilter::all())?
            };
            print_jobs(&jobs, *json)?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Init { force } => {
            let path = cli.config.clone().unwrap_or_else(TrackerConfig::default_path);
            if path.exists() && !*force {
                println!("⚠️  {} already exists (use --force to overwrite).", path.display());
                return Ok(());
            }
            TrackerConfig::default().save_to(&path)?;
            println!("✅ Config written to {}", path.display());
        }
    }

    Ok(())
}
