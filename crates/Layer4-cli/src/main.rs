//! Cadence CLI - Main entry point

mod schedule;

use cadence_foundation::ExecutorConfig;
use cadence_task::ExecutorBuilder;
use clap::{Parser, Subcommand};
use schedule::{Periodic, Work};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cadence - run and observe scheduled task series
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Executor configuration file (.json or .toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task at a fixed rate
    FixedRate(PeriodicArgs),

    /// Run a task with a fixed delay between the end of one run and the next
    FixedDelay(PeriodicArgs),

    /// Run a task at explicit offsets from submission
    Trigger {
        /// Run offsets in milliseconds (comma separated)
        #[arg(long, value_delimiter = ',', required = true)]
        at: Vec<i64>,

        /// Attempt numbers to skip (comma separated)
        #[arg(long, value_delimiter = ',')]
        skip: Vec<u64>,

        #[command(flatten)]
        work: WorkArgs,
    },
}

#[derive(clap::Args, Debug)]
struct PeriodicArgs {
    /// Delay before the first run in milliseconds
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    initial_delay: i64,

    /// Period in milliseconds
    #[arg(short, long, default_value = "1000")]
    period: i64,

    /// Number of runs, 0 runs until Ctrl-C
    #[arg(short = 'n', long, default_value = "3")]
    runs: u64,

    #[command(flatten)]
    work: WorkArgs,
}

#[derive(clap::Args, Debug)]
struct WorkArgs {
    /// Simulated work per run in milliseconds
    #[arg(long, default_value = "50")]
    work_ms: u64,

    /// Make this attempt number fail
    #[arg(long)]
    fail_on: Option<u64>,
}

impl From<WorkArgs> for Work {
    fn from(args: WorkArgs) -> Self {
        Work {
            work_ms: args.work_ms,
            fail_on: args.fail_on,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let config = match &args.config {
        Some(path) => ExecutorConfig::load(path)?,
        None => ExecutorConfig::unmanaged().with_name("cadence-cli"),
    };
    let executor = ExecutorBuilder::new().config(config).build()?;
    tracing::debug!("Using executor {:?}", executor);

    match args.command {
        Command::FixedRate(p) => {
            schedule::run_periodic(
                &executor,
                Periodic::FixedRate,
                p.initial_delay,
                p.period,
                p.runs,
                p.work.into(),
            )
            .await
        }
        Command::FixedDelay(p) => {
            schedule::run_periodic(
                &executor,
                Periodic::FixedDelay,
                p.initial_delay,
                p.period,
                p.runs,
                p.work.into(),
            )
            .await
        }
        Command::Trigger { at, skip, work } => {
            schedule::run_offsets(&executor, at, skip, work.into()).await
        }
    }
}
