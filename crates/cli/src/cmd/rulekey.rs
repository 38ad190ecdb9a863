//! Implementation of the `quarry rulekey` command.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use quarry_lib::engine::{BuildConfig, BuildContext, BuildEngine};
use quarry_lib::rulekey::RuleKeyConfiguration;
use quarry_lib::target::BuildTarget;

use super::{DEFAULT_OUT_DIR, load_build_file};
use crate::config::{Overrides, Settings};

/// Print the rule key of `target`, followed by its contributions with `log`.
pub fn cmd_rulekey(file: &Path, target: &str, overrides: Overrides, log: bool) -> Result<()> {
  let settings = Settings::load(overrides)?;
  let build_file = load_build_file(file)?;
  let target = BuildTarget::parse(target).with_context(|| format!("Invalid target: {target}"))?;

  let rule_keys = RuleKeyConfiguration::new(settings.seed, settings.build_version)
    .with_input_size_limit(settings.input_size_limit);
  let root = build_file.project_root().to_path_buf();
  let config = BuildConfig::new(&root, root.join(DEFAULT_OUT_DIR)).with_rule_key_diagnostics(log);
  let engine = BuildEngine::new(Arc::new(build_file.resolver()), config, BuildContext::new(rule_keys))
    .context("Invalid build graph")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let key = rt
    .block_on(engine.rule_key(&target))
    .with_context(|| format!("Failed to compute rule key for {target}"))?;

  println!("{key}");
  if log && let Some(entries) = key.log() {
    for line in entries.lines() {
      println!("  {line}");
    }
  }
  Ok(())
}
