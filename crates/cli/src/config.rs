//! Settings assembled from built-in defaults, then environment variables,
//! then command-line flags.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use quarry_lib::rulekey::DEFAULT_INPUT_SIZE_LIMIT;

const APP_NAME: &str = "quarry";

pub const ENV_KEY_SEED: &str = "QUARRY_KEY_SEED";
pub const ENV_CACHE_DIR: &str = "QUARRY_CACHE_DIR";
pub const ENV_REMOTE_CACHE: &str = "QUARRY_REMOTE_CACHE";
pub const ENV_INPUT_SIZE_LIMIT: &str = "QUARRY_INPUT_SIZE_LIMIT";
pub const ENV_JOBS: &str = "QUARRY_JOBS";
pub const ENV_REMOTE_CONCURRENCY: &str = "QUARRY_REMOTE_CONCURRENCY";

/// Outstanding remote cache requests when nothing else is configured.
pub const DEFAULT_REMOTE_CONCURRENCY: usize = 8;

/// Values given on the command line. `None` defers to the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
  pub seed: Option<String>,
  pub cache_dir: Option<PathBuf>,
  pub remote_cache: Option<String>,
  pub input_size_limit: Option<u64>,
  pub jobs: Option<usize>,
  pub remote_concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
  pub seed: String,
  pub build_version: String,
  pub cache_dir: PathBuf,
  pub remote_cache: Option<String>,
  pub input_size_limit: u64,
  pub jobs: usize,
  pub remote_concurrency: usize,
}

impl Settings {
  pub fn load(overrides: Overrides) -> Result<Self> {
    let seed = overrides.seed.or_else(|| env_var(ENV_KEY_SEED)).unwrap_or_default();

    let cache_dir = match overrides.cache_dir.or_else(|| env_var(ENV_CACHE_DIR).map(PathBuf::from)) {
      Some(dir) => dir,
      None => default_cache_dir()?,
    };

    let remote_cache = overrides.remote_cache.or_else(|| env_var(ENV_REMOTE_CACHE));

    let input_size_limit = match overrides.input_size_limit {
      Some(limit) => limit,
      None => parse_env(ENV_INPUT_SIZE_LIMIT)?.unwrap_or(DEFAULT_INPUT_SIZE_LIMIT),
    };

    let jobs = match overrides.jobs {
      Some(jobs) => jobs,
      None => parse_env(ENV_JOBS)?.unwrap_or_else(default_jobs),
    };
    if jobs == 0 {
      bail!("jobs must be at least 1");
    }

    let remote_concurrency = match overrides.remote_concurrency {
      Some(limit) => limit,
      None => parse_env(ENV_REMOTE_CONCURRENCY)?.unwrap_or(DEFAULT_REMOTE_CONCURRENCY),
    };
    if remote_concurrency == 0 {
      bail!("remote concurrency must be at least 1");
    }

    Ok(Self {
      seed,
      build_version: env!("CARGO_PKG_VERSION").to_string(),
      cache_dir,
      remote_cache,
      input_size_limit,
      jobs,
      remote_concurrency,
    })
  }
}

/// Parse a counter flush interval such as "10s". Zero is rejected.
pub fn parse_flush_interval(raw: &str) -> Result<Duration> {
  let interval = humantime::parse_duration(raw).with_context(|| format!("invalid interval: {raw:?}"))?;
  if interval.is_zero() {
    bail!("flush interval must be greater than zero");
  }
  Ok(interval)
}

fn env_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
  T: std::str::FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  env_var(name)
    .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid {name}: {raw:?}")))
    .transpose()
}

fn default_jobs() -> usize {
  std::thread::available_parallelism().map(usize::from).unwrap_or(4)
}

/// Default local cache location for the platform.
#[cfg(windows)]
pub fn default_cache_dir() -> Result<PathBuf> {
  let local_appdata = std::env::var("LOCALAPPDATA").context("LOCALAPPDATA not set")?;
  Ok(PathBuf::from(local_appdata).join(APP_NAME).join("Cache"))
}

/// Default local cache location for the platform.
#[cfg(not(windows))]
pub fn default_cache_dir() -> Result<PathBuf> {
  let cache_home = match env_var("XDG_CACHE_HOME") {
    Some(dir) => PathBuf::from(dir),
    None => PathBuf::from(std::env::var("HOME").context("HOME not set")?).join(".cache"),
  };
  Ok(cache_home.join(APP_NAME))
}
