use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use quarry_lib::engine::{BuildConfig, BuildContext, BuildEngine};
use quarry_lib::manifest::BuildFile;
use quarry_lib::rulekey::RuleKeyConfiguration;
use quarry_lib::target::BuildTarget;

pub fn t(s: &str) -> BuildTarget {
  BuildTarget::parse(s).unwrap()
}

/// A project directory holding `quarry.json` and the given source files.
pub fn project(build_file: &str, files: &[(&str, &str)]) -> TempDir {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("quarry.json"), build_file).unwrap();
  for (path, content) in files {
    write(temp.path(), path, content);
  }
  temp
}

pub fn write(root: &Path, path: &str, content: &str) {
  let path = root.join(path);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, content).unwrap();
}

pub fn load(project: &TempDir) -> BuildFile {
  BuildFile::load(&project.path().join("quarry.json")).unwrap()
}

pub fn engine(project: &TempDir, rule_keys: RuleKeyConfiguration, out: &Path) -> BuildEngine {
  let file = load(project);
  let config = BuildConfig::new(file.project_root(), out).with_jobs(2);
  BuildEngine::new(Arc::new(file.resolver()), config, BuildContext::new(rule_keys)).unwrap()
}

pub fn out_dir(project: &TempDir) -> PathBuf {
  project.path().join("quarry-out")
}
