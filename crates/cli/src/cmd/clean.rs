//! Implementation of the `quarry clean` command.

use anyhow::{Context, Result};

use quarry_lib::cache::{CacheLock, DirArtifactCache, LockMode};

use crate::config::{Overrides, Settings};
use crate::output::{print_stat, print_success};

pub fn cmd_clean(overrides: Overrides) -> Result<()> {
  let settings = Settings::load(overrides)?;

  let _lock =
    CacheLock::acquire(&settings.cache_dir, LockMode::Exclusive, "clean").context("Failed to acquire cache lock")?;

  let removed = DirArtifactCache::new(&settings.cache_dir)
    .clear()
    .with_context(|| format!("Failed to clear cache: {}", settings.cache_dir.display()))?;

  print_success("Cache cleared");
  print_stat("Entries removed", &removed.to_string());
  print_stat("Cache", &settings.cache_dir.display().to_string());
  Ok(())
}
