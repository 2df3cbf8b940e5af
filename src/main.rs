//! sheet-tracker CLI - watch spreadsheet ranges for changes

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sheet_tracker::sheet::{SheetSource, SheetUrl};
use sheet_tracker::tracker::{DeliveryTarget, Job, JobId, JobRegistry, NewJob, OwnerId, TrackInterval};
use sheet_tracker::TrackerConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sheet-tracker")]
#[command(author, version, about = "Track spreadsheet ranges and report every change")]
struct Cli {
    /// JSON configuration file (default: built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track every enabled job until interrupted
    Run,

    /// Start tracking a range
    Add {
        /// Spreadsheet URL; `gid` and `range` arguments are picked up
        #[arg(short, long)]
        url: String,

        /// Range to track, e.g. A1:C20, 2:5 or A:C (default: from the URL)
        #[arg(short, long)]
        range: Option<String>,

        /// Sheet (tab) name; required when the URL points at a sheet other than gid 0
        #[arg(long, default_value = "")]
        sheet_name: String,

        /// Polling period in seconds (default: from config)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Chat receiving notifications (default: the owner)
        #[arg(long)]
        chat: Option<i64>,

        #[arg(long, default_value = "0")]
        owner: i64,

        /// Store the job without starting it
        #[arg(long)]
        disabled: bool,
    },

    /// List tracked ranges
    List {
        #[arg(long)]
        owner: Option<i64>,
    },

    /// Resume tracking a job
    Enable { id: String },

    /// Pause tracking a job
    Disable { id: String },

    /// Change a job's polling period
    Interval { id: String, seconds: u64 },

    /// Change where a job's notifications go
    Target {
        id: String,
        chat: i64,

        #[arg(long, default_value = "")]
        name: String,
    },

    /// Stop tracking a job and delete its history
    Remove { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = TrackerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Commands::Run = cli.command {
        return sheet_tracker::run(config).await.context("Tracker stopped with an error");
    }

    // Loops run only under `run`; it picks up edits on its next start
    let registry = sheet_tracker::open_detached_registry(&config)
        .with_context(|| format!("Failed to open '{}'", config.database_path.display()))?;

    manage(&registry, &config, cli.command).await
}

async fn manage(registry: &JobRegistry, config: &TrackerConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Run => Ok(()),
        Commands::Add {
            url,
            range,
            sheet_name,
            interval,
            chat,
            owner,
            disabled,
        } => {
            let parsed = SheetUrl::parse(&url).with_context(|| format!("Not a spreadsheet URL: {}", url))?;

            let range = match range {
                Some(range) => range,
                None => match parsed.range() {
                    Some(range) => range.to_string(),
                    None => bail!("No range given and none found in the URL"),
                },
            };

            let owner = OwnerId(owner);
            let job = registry.create_job(NewJob {
                source: SheetSource {
                    spreadsheet_id: parsed.id.clone(),
                    sheet_id: parsed.sheet_id().unwrap_or(0),
                    sheet_name,
                },
                range,
                interval: interval
                    .map(|seconds| TrackInterval::Period { seconds })
                    .unwrap_or_else(|| config.default_interval()),
                owner,
                target: chat.map(|chat_id| DeliveryTarget {
                    chat_id,
                    name: String::new(),
                }),
                enabled: !disabled,
            })?;

            println!("Added {}", job.id);
            print_job(&job);
            Ok(())
        }
        Commands::List { owner } => {
            let jobs = registry.list_jobs(owner.map(OwnerId))?;
            if jobs.is_empty() {
                eprintln!("No tracked ranges");
            }
            for job in &jobs {
                print_job(job);
            }
            Ok(())
        }
        Commands::Enable { id } => {
            let job = registry.set_enabled(&JobId::from(id), true).await?;
            print_job(&job);
            Ok(())
        }
        Commands::Disable { id } => {
            let job = registry.set_enabled(&JobId::from(id), false).await?;
            print_job(&job);
            Ok(())
        }
        Commands::Interval { id, seconds } => {
            let job = registry
                .set_interval(&JobId::from(id), TrackInterval::Period { seconds })
                .await?;
            print_job(&job);
            Ok(())
        }
        Commands::Target { id, chat, name } => {
            let job = registry
                .set_target(&JobId::from(id), DeliveryTarget { chat_id: chat, name })
                .await?;
            print_job(&job);
            Ok(())
        }
        Commands::Remove { id } => {
            let id = JobId::from(id);
            registry.delete_job(&id).await?;
            println!("Removed {}", id);
            Ok(())
        }
    }
}

fn print_job(job: &Job) {
    println!(
        "{}\t{}\t{}\tevery {}\t{}\tchat {}\t{}",
        job.id,
        if job.enabled { "on" } else { "off" },
        job.range,
        job.interval,
        job.owner,
        job.target.chat_id,
        job.source.url_to(job.range),
    );
}
