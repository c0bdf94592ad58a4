//! procqueue - run a queue of commands through a bounded process pool.

mod run;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "procqueue")]
#[command(about = "Run queued commands through a bounded pool of child processes")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drain the queue through the pool and wait for every process
    Run(RunArgs),
    /// Launch one command detached, with its output discarded
    Background(LaunchArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct LaunchArgs {
    /// Launcher executable (overrides settings and PROCQUEUE_LAUNCHER)
    #[arg(long)]
    pub launcher: Option<PathBuf>,

    /// Fixed first argument passed to the launcher, e.g. an application script
    #[arg(long)]
    pub entry_point: Option<String>,

    /// JSON settings file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Commands, each split on whitespace into a name and arguments
    pub commands: Vec<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Maximum concurrently running processes
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Seconds to pause after each dispatch
    #[arg(long)]
    pub delay: Option<u64>,

    /// Per-process timeout in seconds (0 = unlimited)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// JSON file with an array of commands to queue before the positional ones
    #[arg(long)]
    pub queue_file: Option<PathBuf>,

    /// Print the run summary as JSON on exit
    #[arg(long)]
    pub json_summary: bool,
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json_logs);

    match cli.command {
        Command::Run(args) => {
            let summary = run::run_queue(&args)?;
            if args.json_summary {
                // Intentional stdout so callers can parse the result
                println!("{}", serde_json::to_string(&summary)?);
            }
        }
        Command::Background(args) => {
            let pids = run::launch_background(&args)?;
            info!("Started {} background processes", pids.len());
        }
    }

    Ok(())
}
