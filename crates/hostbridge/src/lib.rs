use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod batch;
pub mod clock;
mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod plugins;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod utils;
pub mod watcher;
pub mod writer;

use crate::config::AppContext;

/// Hostbridge - run batches of commands dropped as JSON files into a watched folder.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
  /// Create the data directories and a project config template
  Init,
  /// Run the host loop and execute pending batches
  Run {
    /// Return once nothing is queued and no batch is running
    #[arg(long)]
    exit_when_idle: bool,
    /// Stop after this many ticks
    #[arg(long, value_name = "N")]
    max_ticks: Option<usize>,
  },
  /// Validate a batch file and drop it into the pending folder
  Submit {
    /// Batch JSON file, or `-` for stdin
    file: String,
    /// Name of the pending file (defaults to the batch id)
    #[arg(long)]
    id: Option<String>,
  },
  /// Print the result of a batch
  Result {
    batch_id: String,
    /// Poll until the batch is completed
    #[arg(long)]
    wait: bool,
    /// How long `--wait` polls before giving up
    #[arg(long, value_name = "MS", default_value_t = 30_000)]
    timeout_ms: u64,
  },
  /// Show pending, running and finished batch counts
  Status,
}

pub fn parse() -> Cli {
  Cli::parse()
}

/// Entry point of the `hostbridge` binary.
///
/// # Errors
/// Returns the failure of the selected subcommand.
pub fn run() -> Result<()> {
  let cli = parse();
  let cwd = std::env::current_dir()?;
  let ctx = AppContext::load(&cwd)?;

  match cli.command {
    Commands::Init => commands::init::run(&ctx),
    Commands::Run {
      exit_when_idle,
      max_ticks,
    } => commands::run::run(
      &ctx,
      &commands::run::RunOptions {
        exit_when_idle,
        max_ticks,
      },
    ),
    Commands::Submit { file, id } => commands::submit::run(&ctx, &file, id.as_deref()),
    Commands::Result {
      batch_id,
      wait,
      timeout_ms,
    } => commands::result::run(&ctx, &batch_id, wait.then_some(timeout_ms)),
    Commands::Status => commands::status::run(&ctx),
  }
}
