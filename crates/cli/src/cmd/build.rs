//! Implementation of the `quarry build` command.
//!
//! Wires configuration into a [`BuildEngine`]: the local directory cache held
//! under a shared [`CacheLock`], an optional remote HTTP cache behind retries,
//! Ctrl-C cancellation and periodic counter reporting.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use quarry_lib::cache::{
  CacheLock, DirArtifactCache, HttpArtifactCache, LockMode, RemoteDownloadStats, RetryingArtifactCache,
};
use quarry_lib::counters::{TracingCounterSink, spawn_periodic_flush};
use quarry_lib::engine::{BuildConfig, BuildContext, BuildEngine, BuildReport};
use quarry_lib::rulekey::RuleKeyConfiguration;

use super::{DEFAULT_OUT_DIR, load_build_file, parse_targets};
use crate::config::{Overrides, Settings};
use crate::output::{
  OutputFormat, format_bytes, format_duration, print_error, print_json, print_node, print_stat, print_success,
  print_warning,
};

/// Attempts per remote cache request.
const REMOTE_ATTEMPTS: usize = 3;

pub struct BuildArgs {
  pub file: PathBuf,
  pub targets: Vec<String>,
  pub overrides: Overrides,
  pub no_cache: bool,
  pub rule_key_log: Option<PathBuf>,
  pub out_dir: Option<PathBuf>,
  pub flush_interval: Duration,
  pub output: OutputFormat,
}

#[derive(Serialize)]
struct BuildSummary {
  build_id: String,
  success: bool,
  targets: BTreeMap<String, String>,
  counts: BTreeMap<&'static str, usize>,
  failures: Vec<FailureSummary>,
  network: RemoteDownloadStats,
  elapsed_ms: u128,
}

#[derive(Serialize)]
struct FailureSummary {
  target: String,
  cause: String,
}

impl BuildSummary {
  fn new(report: &BuildReport) -> Self {
    let mut counts = report.success_counts();
    counts.insert("failed", report.failures().len());
    counts.insert("cancelled", report.cancelled().len());
    Self {
      build_id: report.build_id.clone(),
      success: report.is_success(),
      targets: report
        .outcomes
        .iter()
        .map(|(target, outcome)| (target.to_string(), outcome.state().to_string()))
        .collect(),
      counts,
      failures: report
        .failures()
        .into_iter()
        .map(|(target, cause)| FailureSummary {
          target: target.to_string(),
          cause: cause.to_string(),
        })
        .collect(),
      network: report.network,
      elapsed_ms: report.elapsed.as_millis(),
    }
  }
}

/// Build the requested targets (all of them when none are given).
///
/// Returns a failing exit code when any node failed or was cancelled.
pub fn cmd_build(args: BuildArgs) -> Result<ExitCode> {
  let start = Instant::now();
  let settings = Settings::load(args.overrides)?;
  let build_file = load_build_file(&args.file)?;
  let targets = parse_targets(&args.targets)?;

  let project_root = build_file.project_root().to_path_buf();
  let out_dir = args.out_dir.unwrap_or_else(|| project_root.join(DEFAULT_OUT_DIR));

  let rule_keys = RuleKeyConfiguration::new(settings.seed.clone(), settings.build_version.clone())
    .with_input_size_limit(settings.input_size_limit);
  let context = BuildContext::new(rule_keys);
  let config = BuildConfig::new(&project_root, &out_dir)
    .with_jobs(settings.jobs)
    .with_remote_concurrency(settings.remote_concurrency)
    .with_rule_key_diagnostics(args.rule_key_log.is_some());

  let mut engine = BuildEngine::new(Arc::new(build_file.resolver()), config, context.clone())
    .context("Invalid build graph")?;

  let _lock = if args.no_cache {
    None
  } else {
    let lock = CacheLock::acquire(&settings.cache_dir, LockMode::Shared, "build")
      .context("Failed to acquire cache lock")?;
    engine = engine.with_cache(Arc::new(DirArtifactCache::new(&settings.cache_dir)));
    if let Some(url) = &settings.remote_cache {
      let remote = HttpArtifactCache::new(url.clone()).context("Failed to create remote cache client")?;
      engine = engine.with_cache(Arc::new(RetryingArtifactCache::new(Arc::new(remote), REMOTE_ATTEMPTS)));
    }
    Some(lock)
  };

  info!(
    build_id = %context.build_id,
    jobs = settings.jobs,
    remote_concurrency = settings.remote_concurrency,
    out_dir = %out_dir.display(),
    "starting build"
  );

  let flush_interval = args.flush_interval;
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(async {
      let cancellation = context.cancellation.clone();
      let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          warn!("interrupted, cancelling build");
          cancellation.cancel();
        }
      });
      let flusher = spawn_periodic_flush(context.counters.clone(), Arc::new(TracingCounterSink), flush_interval);

      let report = engine.build(&targets).await;

      flusher.stop().await;
      interrupt.abort();
      report
    })
    .context("Build failed")?;

  if let Some(path) = &args.rule_key_log {
    let mut content = report.rule_key_log_lines().join("\n");
    content.push('\n');
    std::fs::write(path, content).with_context(|| format!("Failed to write rule key log: {}", path.display()))?;
  }

  if args.output.is_json() {
    print_json(&BuildSummary::new(&report))?;
  } else {
    print_summary(&report, start.elapsed());
  }

  Ok(if report.is_success() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

fn print_summary(report: &BuildReport, elapsed: Duration) {
  for (target, outcome) in &report.outcomes {
    print_node(&target.to_string(), &outcome.state());
  }

  println!();
  if report.is_success() {
    print_success("Build complete!");
  } else if report.failures().is_empty() {
    print_warning("Build cancelled");
  } else {
    print_error("Build failed");
  }

  let counts = report.success_counts();
  for (label, key) in [("Built", "built"), ("Fetched", "fetched"), ("Up to date", "matching")] {
    print_stat(label, &counts.get(key).copied().unwrap_or(0).to_string());
  }
  print_stat("Failed", &report.failures().len().to_string());
  print_stat("Cancelled", &report.cancelled().len().to_string());

  let network = &report.network;
  if network.downloads_started > 0 {
    print_stat(
      "Downloaded",
      &format!(
        "{} of {} requests, {} in {}",
        network.artifacts_downloaded,
        network.downloads_started,
        format_bytes(network.bytes_downloaded),
        format_duration(network.download_time)
      ),
    );
  }
  print_stat("Duration", &format_duration(elapsed));

  for (target, cause) in report.failures() {
    print_error(&format!("{target}: {cause}"));
  }
}
