//! nozem: hermetic, content-addressed builds for JS/TS monorepos.
//!
//! Two subcommands:
//! - `nozem from-lerna` — scan a Lerna-style workspace and emit `nozem.json`
//! - `nozem build [TARGET...]` — build units with caching and bounded
//!   parallelism

mod cmd;

use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "nozem")]
#[command(version, about = "Hermetic, content-addressed builds for JS/TS monorepos")]
struct Cli {
  /// Increase log verbosity
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build units (default: everything below the current directory)
  Build {
    /// Unit identifiers or directories; empty means the whole graph when
    /// run at the workspace root
    targets: Vec<String>,

    /// Number of builds to run in parallel
    #[arg(short, long, default_value_t = nozem_lib::consts::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Stop at the first failure (the default)
    #[arg(short, long, action = ArgAction::SetTrue, conflicts_with = "no_bail")]
    bail: bool,

    /// Keep building unaffected units after a failure
    #[arg(long = "no-bail", action = ArgAction::SetTrue)]
    no_bail: bool,

    /// Also build everything that depends on the selected targets
    #[arg(short, long)]
    down: bool,

    /// Run each package's test script after its build
    #[arg(long)]
    test: bool,
  },

  /// Scan the monorepo for a Lerna-style manifest and emit nozem.json
  FromLerna,
}

fn main() {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();

  let result = match cli.command {
    Commands::Build {
      targets,
      concurrency,
      bail: _,
      no_bail,
      down,
      test,
    } => cmd::cmd_build(&targets, concurrency, !no_bail, down, test),
    Commands::FromLerna => cmd::cmd_from_lerna(),
  };

  if let Err(err) = result {
    // One line, no backtrace; the details already went to stderr.
    eprintln!("error: {err:#}");
    std::process::exit(1);
  }
}
