mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fetchq")]
#[command(about = "Fetch, cache and mutate remote resources with request coalescing")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./fetchq.yaml, then $XDG_CONFIG_HOME/fetchq/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Start with the connectivity signal set to offline
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = fetchq::Config::load(args.config.as_deref())?;

  // Dropping the guard flushes the file writer.
  let _log_guard = fetchq::logging::init_logging(&config.logging, args.verbose)?;

  commands::run(args.command, &config, args.offline).await
}
