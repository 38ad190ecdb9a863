use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::target::BuildTarget;
use crate::util::{BoxFuture, CancellationFlag};

/// One unit of work inside a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
  /// A shell command run in an isolated environment.
  Cmd {
    cmd: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    /// Relative to the project root. Defaults to the output dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
  },
  /// Write `content` to `path` inside the output dir.
  WriteFile { path: String, content: String },
}

impl Step {
  /// Short label for logs.
  pub fn describe(&self) -> String {
    match self {
      Step::Cmd { cmd, .. } => {
        let first = cmd.trim().lines().next().unwrap_or_default();
        format!("cmd `{first}`")
      }
      Step::WriteFile { path, .. } => format!("write_file {path}"),
    }
  }
}

/// Everything a step may see of the build.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub target: BuildTarget,
  pub output_dir: PathBuf,
  /// Root under which every target's outputs live.
  pub output_root: PathBuf,
  pub project_root: PathBuf,
  /// Tool name to runnable command.
  pub tools: BTreeMap<String, PathBuf>,
  pub cancellation: CancellationFlag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
  Success,
  Failure { exit_code: Option<i32>, message: String },
}

impl StepResult {
  pub fn failure(message: impl Into<String>) -> Self {
    StepResult::Failure {
      exit_code: None,
      message: message.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, StepResult::Success)
  }
}

pub trait StepExecutor: Send + Sync {
  fn execute<'a>(&'a self, ctx: &'a StepContext, step: &'a Step) -> BoxFuture<'a, StepResult>;
}
