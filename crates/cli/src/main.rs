mod cmd;
mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildArgs, cmd_build, cmd_clean, cmd_plan, cmd_rulekey};
use crate::config::{Overrides, parse_flush_interval};
use crate::output::{OutputFormat, print_error};

/// Quarry - incremental builds with shareable, content-addressed outputs
#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build targets and their dependencies
  Build {
    /// Path to the build file
    file: PathBuf,

    /// Targets to build (default: every target in the file)
    targets: Vec<String>,

    /// Rule-key seed; changing it invalidates every key
    #[arg(long)]
    seed: Option<String>,

    /// Concurrent step executions
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Local cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Base URL of a remote HTTP cache
    #[arg(long)]
    remote_cache: Option<String>,

    /// Outstanding requests to the remote cache
    #[arg(long)]
    remote_concurrency: Option<usize>,

    /// Skip every artifact cache
    #[arg(long)]
    no_cache: bool,

    /// Files larger than this many bytes are keyed by reference
    #[arg(long)]
    input_size_limit: Option<u64>,

    /// Write every rule key and its contributions to this file
    #[arg(long)]
    rule_key_log: Option<PathBuf>,

    /// Output root (default: quarry-out next to the build file)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// How often counters are reported, e.g. "10s"
    #[arg(long, value_parser = parse_flush_interval, default_value = "10s")]
    flush_interval: Duration,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Print the rule key of a target
  Rulekey {
    /// Path to the build file
    file: PathBuf,

    /// Target to key
    target: String,

    /// Rule-key seed
    #[arg(long)]
    seed: Option<String>,

    /// Files larger than this many bytes are keyed by reference
    #[arg(long)]
    input_size_limit: Option<u64>,

    /// Also print every contribution to the key
    #[arg(long)]
    log: bool,
  },

  /// Show the order targets would build in
  Plan {
    /// Path to the build file
    file: PathBuf,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Remove every entry from the local cache
  Clean {
    /// Local cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match run(cli.command) {
    Ok(code) => code,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}

fn run(command: Commands) -> Result<ExitCode> {
  match command {
    Commands::Build {
      file,
      targets,
      seed,
      jobs,
      cache_dir,
      remote_cache,
      remote_concurrency,
      no_cache,
      input_size_limit,
      rule_key_log,
      out_dir,
      flush_interval,
      output,
    } => cmd_build(BuildArgs {
      file,
      targets,
      overrides: Overrides {
        seed,
        cache_dir,
        remote_cache,
        input_size_limit,
        jobs,
        remote_concurrency,
      },
      no_cache,
      rule_key_log,
      out_dir,
      flush_interval,
      output,
    }),
    Commands::Rulekey {
      file,
      target,
      seed,
      input_size_limit,
      log,
    } => {
      let overrides = Overrides {
        seed,
        input_size_limit,
        ..Default::default()
      };
      cmd_rulekey(&file, &target, overrides, log)?;
      Ok(ExitCode::SUCCESS)
    }
    Commands::Plan { file, output } => {
      cmd_plan(&file, output)?;
      Ok(ExitCode::SUCCESS)
    }
    Commands::Clean { cache_dir } => {
      cmd_clean(Overrides {
        cache_dir,
        ..Default::default()
      })?;
      Ok(ExitCode::SUCCESS)
    }
  }
}
