mod build;
mod clean;
mod plan;
mod rulekey;

use std::path::Path;

use anyhow::{Context, Result};

use quarry_lib::manifest::BuildFile;
use quarry_lib::target::BuildTarget;

pub use build::{BuildArgs, cmd_build};
pub use clean::cmd_clean;
pub use plan::cmd_plan;
pub use rulekey::cmd_rulekey;

/// Directory next to the build file that outputs land in by default.
const DEFAULT_OUT_DIR: &str = "quarry-out";

fn load_build_file(file: &Path) -> Result<BuildFile> {
  let path = dunce::canonicalize(file).with_context(|| format!("Build file not found: {}", file.display()))?;
  BuildFile::load(&path).with_context(|| format!("Failed to load build file: {}", path.display()))
}

fn parse_targets(targets: &[String]) -> Result<Vec<BuildTarget>> {
  targets
    .iter()
    .map(|t| BuildTarget::parse(t).with_context(|| format!("Invalid target: {t}")))
    .collect()
}
