use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::compute::ComputeError;
use crate::counters::CounterRegistry;
use crate::rulekey::{KeyedRule, RuleIndex, RuleKey, RuleKeyConfiguration, Tool};
use crate::step::Step;
use crate::target::BuildTarget;
use crate::util::CancellationFlag;

/// What the scheduler knows about a node before it is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEngineAction {
  pub target: BuildTarget,
  /// Targets that must be terminal before this one may check caches.
  pub deps: Vec<BuildTarget>,
}

/// A resolved rule: the key-contributing description plus what to run.
pub trait BuildRule: KeyedRule {
  fn steps(&self) -> &[Step];

  /// Tools available to the steps, by name.
  fn tools(&self) -> BTreeMap<String, Tool> {
    BTreeMap::new()
  }
}

/// Maps actions to rules. Also serves rule-key lookups for the same targets.
pub trait RuleResolver: RuleIndex {
  /// Every action this resolver knows, in declaration order.
  fn actions(&self) -> Vec<BuildEngineAction>;

  fn resolve(&self, action: &BuildEngineAction) -> Result<Arc<dyn BuildRule>, BuildError>;
}

/// How a node reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuccessType {
  /// The output dir already held a verified output for this rule key.
  MatchingRuleKey,
  FetchedFromCache { source: String },
  BuiltLocally,
}

impl SuccessType {
  pub fn label(&self) -> &'static str {
    match self {
      SuccessType::MatchingRuleKey => "matching",
      SuccessType::FetchedFromCache { .. } => "fetched",
      SuccessType::BuiltLocally => "built",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
  Pending,
  ResolvingDeps,
  CacheCheck,
  Executing,
  Done(SuccessType),
  Failed,
  Cancelled,
}

impl NodeState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, NodeState::Done(_) | NodeState::Failed | NodeState::Cancelled)
  }
}

impl std::fmt::Display for NodeState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      NodeState::Pending => f.write_str("pending"),
      NodeState::ResolvingDeps => f.write_str("resolving_deps"),
      NodeState::CacheCheck => f.write_str("cache_check"),
      NodeState::Executing => f.write_str("executing"),
      NodeState::Done(success) => write!(f, "done({})", success.label()),
      NodeState::Failed => f.write_str("failed"),
      NodeState::Cancelled => f.write_str("cancelled"),
    }
  }
}

/// Terminal result of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
  Success {
    success: SuccessType,
    rule_key: RuleKey,
    output_dir: PathBuf,
  },
  Failed(BuildError),
  Cancelled,
}

impl NodeOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, NodeOutcome::Success { .. })
  }

  pub fn state(&self) -> NodeState {
    match self {
      NodeOutcome::Success { success, .. } => NodeState::Done(success.clone()),
      NodeOutcome::Failed(_) => NodeState::Failed,
      NodeOutcome::Cancelled => NodeState::Cancelled,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  #[error("cyclic dependency: {}", .path.join(" -> "))]
  CyclicDependency { path: Vec<String> },

  #[error("{target} depends on unknown target {dependency}")]
  UnknownDependency { target: BuildTarget, dependency: BuildTarget },

  #[error("unknown target {0}")]
  UnknownTarget(BuildTarget),

  #[error("target {0} is declared more than once")]
  DuplicateAction(BuildTarget),

  #[error("failed to resolve rule for {target}: {message}")]
  RuleResolution { target: BuildTarget, message: String },

  #[error("failed to compute rule key for {target}: {message}")]
  RuleKey { target: BuildTarget, message: String },

  #[error("{target}: step {step} failed: {message}")]
  StepExecutionFailure {
    target: BuildTarget,
    step: usize,
    exit_code: Option<i32>,
    message: String,
  },

  #[error("dependency {dependency} failed: {root_cause}")]
  DependencyFailed {
    dependency: BuildTarget,
    root_cause: Box<BuildError>,
  },

  #[error("{}: {message}", .path.display())]
  Io { path: PathBuf, message: String },

  #[error("computation failed: {0}")]
  Compute(ComputeError),
}

impl BuildError {
  pub(crate) fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
    BuildError::Io {
      path: path.into(),
      message: err.to_string(),
    }
  }

  /// The failure that started a chain of `DependencyFailed`.
  pub fn root_cause(&self) -> &BuildError {
    match self {
      BuildError::DependencyFailed { root_cause, .. } => root_cause.root_cause(),
      other => other,
    }
  }
}

impl From<ComputeError> for BuildError {
  fn from(err: ComputeError) -> Self {
    match err {
      ComputeError::CyclicDependency { path } => BuildError::CyclicDependency { path },
      other => BuildError::Compute(other),
    }
  }
}

/// Tunables of one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Concurrent step executions.
  pub jobs: usize,
  /// Outstanding remote cache requests.
  pub remote_concurrency: usize,
  /// Every target builds into `<output_root>/<package>/__<name>__`.
  pub output_root: PathBuf,
  pub project_root: PathBuf,
  /// Keep a `RuleKeyLog` on every computed key.
  pub rule_key_diagnostics: bool,
}

impl BuildConfig {
  pub fn new(project_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
    Self {
      jobs: std::thread::available_parallelism().map(usize::from).unwrap_or(4),
      remote_concurrency: 8,
      output_root: output_root.into(),
      project_root: project_root.into(),
      rule_key_diagnostics: false,
    }
  }

  pub fn with_jobs(mut self, jobs: usize) -> Self {
    self.jobs = jobs.max(1);
    self
  }

  pub fn with_remote_concurrency(mut self, limit: usize) -> Self {
    self.remote_concurrency = limit.max(1);
    self
  }

  pub fn with_rule_key_diagnostics(mut self, enabled: bool) -> Self {
    self.rule_key_diagnostics = enabled;
    self
  }
}

/// Build-scoped state shared by every node. Created per invocation so
/// concurrent builds in one process stay isolated.
#[derive(Clone)]
pub struct BuildContext {
  pub build_id: String,
  pub rule_keys: Arc<RuleKeyConfiguration>,
  pub counters: Arc<CounterRegistry>,
  pub cancellation: CancellationFlag,
}

impl BuildContext {
  pub fn new(rule_keys: RuleKeyConfiguration) -> Self {
    let started = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .unwrap_or_default();
    Self {
      build_id: format!("{:x}-{:x}", started.as_millis(), std::process::id()),
      rule_keys: Arc::new(rule_keys),
      counters: Arc::new(CounterRegistry::new()),
      cancellation: CancellationFlag::new(),
    }
  }

  pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
    self.cancellation = cancellation;
    self
  }

  pub fn with_counters(mut self, counters: Arc<CounterRegistry>) -> Self {
    self.counters = counters;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn target(s: &str) -> BuildTarget {
    BuildTarget::parse(s).unwrap()
  }

  #[test]
  fn root_cause_skips_dependency_chain() {
    let leaf = BuildError::StepExecutionFailure {
      target: target("//c:c"),
      step: 0,
      exit_code: Some(2),
      message: "boom".to_string(),
    };
    let middle = BuildError::DependencyFailed {
      dependency: target("//c:c"),
      root_cause: Box::new(leaf.clone()),
    };
    let top = BuildError::DependencyFailed {
      dependency: target("//b:b"),
      root_cause: Box::new(middle),
    };
    assert_eq!(top.root_cause(), &leaf);
  }

  #[test]
  fn compute_cycles_become_build_cycles() {
    let err: BuildError = ComputeError::CyclicDependency {
      path: vec!["//a:a".into(), "//b:b".into(), "//a:a".into()],
    }
    .into();
    assert_eq!(err.to_string(), "cyclic dependency: //a:a -> //b:b -> //a:a");
  }

  #[test]
  fn terminal_states() {
    assert!(NodeState::Done(SuccessType::BuiltLocally).is_terminal());
    assert!(NodeState::Cancelled.is_terminal());
    assert!(!NodeState::CacheCheck.is_terminal());
    assert_eq!(
      NodeState::Done(SuccessType::FetchedFromCache { source: "dir".into() }).to_string(),
      "done(fetched)"
    );
  }
}
