//! The build engine.
//!
//! Each node is a [`Computation`] over its target inside a [`GraphEngine`],
//! with the node's action dependencies as preliminary dependencies. A node
//! therefore only reaches its cache check once every dependency is terminal,
//! shared dependencies run at most once, and siblings run in parallel.
//!
//! Node outcomes are values, not errors: a failed node still completes its
//! computation, and its dependents read the failure and fail fast without
//! touching any cache.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::{Artifact, ArtifactCache, CacheMode, CacheResult, NetworkStats};
use crate::compute::{ComputeEnv, ComputeError, Computation, GraphEngine};
use crate::counters::{CounterInfo, CounterRegistry, IntegerCounter, SamplingCounter};
use crate::rulekey::{FileHashCache, RuleKey, RuleKeyComputation, RuleKeyFactory};
use crate::step::{ShellStepExecutor, StepContext, StepExecutor, StepResult, TMP_DIR_NAME};
use crate::target::BuildTarget;
use crate::util::BoxFuture;

use super::graph::ActionGraph;
use super::listener::{BuildListener, NoopListener};
use super::marker::{OUTPUT_EXCLUSIONS, matches_rule_key, write_marker};
use super::report::BuildReport;
use super::types::{
  BuildConfig, BuildContext, BuildEngineAction, BuildError, BuildRule, NodeOutcome, NodeState, RuleResolver,
  SuccessType,
};

type RuleKeyEngine = GraphEngine<RuleKeyComputation<dyn RuleResolver>>;

/// Schedules a resolver's actions against caches and a step executor.
pub struct BuildEngine {
  resolver: Arc<dyn RuleResolver>,
  graph: ActionGraph,
  caches: Vec<Arc<dyn ArtifactCache>>,
  executor: Arc<dyn StepExecutor>,
  listener: Arc<dyn BuildListener>,
  config: BuildConfig,
  context: BuildContext,
  counters: Arc<EngineCounters>,
}

impl BuildEngine {
  /// Fails when the resolver's actions do not form a valid DAG.
  pub fn new(resolver: Arc<dyn RuleResolver>, config: BuildConfig, context: BuildContext) -> Result<Self, BuildError> {
    let graph = ActionGraph::new(resolver.actions())?;
    let counters = Arc::new(EngineCounters::new(&context.counters));
    Ok(Self {
      resolver,
      graph,
      caches: Vec::new(),
      executor: Arc::new(ShellStepExecutor::new()),
      listener: Arc::new(NoopListener),
      config,
      context,
      counters,
    })
  }

  /// Caches are consulted local first, then remote, otherwise in the order
  /// they were added.
  pub fn with_cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
    self.caches.push(cache);
    self.caches.sort_by_key(|c| c.mode() == CacheMode::Remote);
    self
  }

  pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
    self.executor = executor;
    self
  }

  pub fn with_listener(mut self, listener: Arc<dyn BuildListener>) -> Self {
    self.listener = listener;
    self
  }

  pub fn graph(&self) -> &ActionGraph {
    &self.graph
  }

  pub fn context(&self) -> &BuildContext {
    &self.context
  }

  fn rule_key_engine(&self) -> RuleKeyEngine {
    let files = Arc::new(FileHashCache::new(&self.config.project_root));
    let factory = RuleKeyFactory::new(Arc::clone(&self.context.rule_keys), files)
      .with_diagnostics(self.config.rule_key_diagnostics);
    GraphEngine::new(RuleKeyComputation::new(Arc::clone(&self.resolver), factory))
  }

  /// Compute the rule key of `target` without building anything.
  pub async fn rule_key(&self, target: &BuildTarget) -> Result<RuleKey, BuildError> {
    if !self.graph.contains(target) {
      return Err(BuildError::UnknownTarget(target.clone()));
    }
    self
      .rule_key_engine()
      .compute(target.clone())
      .await
      .map_err(|e| BuildError::RuleKey {
        target: target.clone(),
        message: e.to_string(),
      })
  }

  /// Build `targets` and everything they depend on. An empty list builds
  /// every target.
  ///
  /// Node failures are reported in the [`BuildReport`]; `Err` is reserved for
  /// requests that cannot start, such as an unknown target.
  pub async fn build(&self, targets: &[BuildTarget]) -> Result<BuildReport, BuildError> {
    let started = Instant::now();
    if let Some(unknown) = targets.iter().find(|t| !self.graph.contains(t)) {
      return Err(BuildError::UnknownTarget(unknown.clone()));
    }
    let requested = if targets.is_empty() {
      self.graph.targets()
    } else {
      targets.to_vec()
    };
    let closure = self.graph.closure(&requested);

    info!(
      build_id = %self.context.build_id,
      requested = requested.len(),
      nodes = closure.len(),
      jobs = self.config.jobs,
      "starting build"
    );

    let session = BuildSession {
      resolver: Arc::clone(&self.resolver),
      actions: closure
        .iter()
        .filter_map(|t| self.graph.action(t).map(|a| (t.clone(), a.clone())))
        .collect(),
      rule_keys: self.rule_key_engine(),
      caches: self.caches.clone(),
      executor: Arc::clone(&self.executor),
      listener: Arc::clone(&self.listener),
      config: self.config.clone(),
      context: self.context.clone(),
      jobs: Semaphore::new(self.config.jobs.max(1)),
      remote: Semaphore::new(self.config.remote_concurrency.max(1)),
      network: NetworkStats::new(),
      counters: Arc::clone(&self.counters),
    };
    for target in &closure {
      session.transition(target, NodeState::Pending);
    }

    let nodes = GraphEngine::new(session);
    nodes.compose(requested).await?;

    let session = nodes.computation();
    let mut outcomes = BTreeMap::new();
    let mut rule_keys = BTreeMap::new();
    for target in closure {
      let outcome = match nodes.peek(&target) {
        Some(Ok(outcome)) => outcome,
        Some(Err(err)) => NodeOutcome::Failed(err.into()),
        None => NodeOutcome::Cancelled,
      };
      if let Some(Ok(key)) = session.rule_keys.peek(&target) {
        rule_keys.insert(target.clone(), key);
      }
      outcomes.insert(target, outcome);
    }

    let report = BuildReport {
      build_id: self.context.build_id.clone(),
      outcomes,
      rule_keys,
      network: session.network.snapshot(),
      elapsed: started.elapsed(),
    };
    info!(
      build_id = %report.build_id,
      success = report.is_success(),
      failed = report.failures().len(),
      cancelled = report.cancelled().len(),
      elapsed_ms = report.elapsed.as_millis() as u64,
      "build finished"
    );
    Ok(report)
  }
}

/// Registered once per engine; every build adds to the same entries.
struct EngineCounters {
  built: Arc<IntegerCounter>,
  fetched: Arc<IntegerCounter>,
  matching: Arc<IntegerCounter>,
  failed: Arc<IntegerCounter>,
  cancelled: Arc<IntegerCounter>,
  cache_errors: Arc<IntegerCounter>,
  store_errors: Arc<IntegerCounter>,
  step_millis: Arc<SamplingCounter>,
}

impl EngineCounters {
  fn new(registry: &CounterRegistry) -> Self {
    Self {
      built: registry.integer(CounterInfo::new("build", "rules_built")),
      fetched: registry.integer(CounterInfo::new("build", "rules_fetched")),
      matching: registry.integer(CounterInfo::new("build", "rules_matching")),
      failed: registry.integer(CounterInfo::new("build", "rules_failed")),
      cancelled: registry.integer(CounterInfo::new("build", "rules_cancelled")),
      cache_errors: registry.integer(CounterInfo::new("cache", "errors")),
      store_errors: registry.integer(CounterInfo::new("cache", "store_errors")),
      step_millis: registry.sampling(CounterInfo::new("build", "execution_millis")),
    }
  }

  fn record(&self, outcome: &NodeOutcome) {
    match outcome {
      NodeOutcome::Success { success, .. } => match success {
        SuccessType::BuiltLocally => self.built.inc(),
        SuccessType::FetchedFromCache { .. } => self.fetched.inc(),
        SuccessType::MatchingRuleKey => self.matching.inc(),
      },
      NodeOutcome::Failed(_) => self.failed.inc(),
      NodeOutcome::Cancelled => self.cancelled.inc(),
    }
  }
}

/// State of one `build` call. Dropped when the call returns.
struct BuildSession {
  resolver: Arc<dyn RuleResolver>,
  actions: HashMap<BuildTarget, BuildEngineAction>,
  rule_keys: RuleKeyEngine,
  caches: Vec<Arc<dyn ArtifactCache>>,
  executor: Arc<dyn StepExecutor>,
  listener: Arc<dyn BuildListener>,
  config: BuildConfig,
  context: BuildContext,
  jobs: Semaphore,
  remote: Semaphore,
  network: NetworkStats,
  counters: Arc<EngineCounters>,
}

impl Computation for BuildSession {
  type Key = BuildTarget;
  type Output = NodeOutcome;

  fn preliminary_deps(&self, target: &BuildTarget) -> Result<Vec<BuildTarget>, ComputeError> {
    let action = self
      .actions
      .get(target)
      .ok_or_else(|| ComputeError::msg(format!("unknown target {target}")))?;
    self.transition(target, NodeState::ResolvingDeps);
    Ok(action.deps.clone())
  }

  fn compute(&self, target: BuildTarget, env: ComputeEnv<Self>) -> BoxFuture<'_, Result<NodeOutcome, ComputeError>> {
    Box::pin(async move {
      let outcome = self.run_node(&target, &env).await;
      match &outcome {
        NodeOutcome::Failed(err @ BuildError::DependencyFailed { .. }) => {
          error!(target = %target, error = %err, "skipped after dependency failure");
        }
        NodeOutcome::Failed(err) => error!(target = %target, error = %err, "build failed"),
        _ => {}
      }
      self.counters.record(&outcome);
      self.transition(&target, outcome.state());
      Ok(outcome)
    })
  }
}

impl BuildSession {
  fn transition(&self, target: &BuildTarget, state: NodeState) {
    debug!(target = %target, state = %state, "node state");
    self.listener.on_state_change(target, &state);
  }

  fn cancelled(&self) -> bool {
    self.context.cancellation.is_cancelled()
  }

  async fn run_node(&self, target: &BuildTarget, env: &ComputeEnv<Self>) -> NodeOutcome {
    let Some(action) = self.actions.get(target) else {
      return NodeOutcome::Failed(BuildError::UnknownTarget(target.clone()));
    };

    let mut dep_cancelled = false;
    for dep in &action.deps {
      match env.dep(dep) {
        Some(NodeOutcome::Failed(err)) => {
          return NodeOutcome::Failed(BuildError::DependencyFailed {
            dependency: dep.clone(),
            root_cause: Box::new(err.root_cause().clone()),
          });
        }
        Some(NodeOutcome::Cancelled) | None => dep_cancelled = true,
        Some(NodeOutcome::Success { .. }) => {}
      }
    }
    if dep_cancelled || self.cancelled() {
      return NodeOutcome::Cancelled;
    }

    let rule = match self.resolver.resolve(action) {
      Ok(rule) => rule,
      Err(err) => return NodeOutcome::Failed(err),
    };
    let compute: BoxFuture<'_, Result<RuleKey, ComputeError>> = Box::pin(self.rule_keys.compute(target.clone()));
    let rule_key = match compute.await {
      Ok(key) => key,
      Err(err) => {
        return NodeOutcome::Failed(BuildError::RuleKey {
          target: target.clone(),
          message: err.to_string(),
        });
      }
    };

    self.transition(target, NodeState::CacheCheck);
    let output_dir = self.config.output_root.join(target.output_path());

    if matches_rule_key(&output_dir, &rule_key) {
      debug!(target = %target, rule_key = %rule_key, "outputs already match rule key");
      return NodeOutcome::Success {
        success: SuccessType::MatchingRuleKey,
        rule_key,
        output_dir,
      };
    }

    if let Some(source) = self.fetch(target, &rule_key, &output_dir).await {
      return NodeOutcome::Success {
        success: SuccessType::FetchedFromCache { source },
        rule_key,
        output_dir,
      };
    }

    self.execute(target, rule, rule_key, output_dir).await
  }

  /// Try each cache in turn. Backend errors degrade to misses.
  async fn fetch(&self, target: &BuildTarget, rule_key: &RuleKey, output_dir: &Path) -> Option<String> {
    for cache in &self.caches {
      let result = match cache.mode() {
        CacheMode::Local => cache.fetch(rule_key).await,
        CacheMode::Remote => {
          let Ok(_permit) = self.remote.acquire().await else {
            return None;
          };
          self.network.download_started();
          let started = Instant::now();
          let result = cache.fetch(rule_key).await;
          let bytes = match &result {
            CacheResult::Hit { artifact, .. } => Some(artifact.size()),
            _ => None,
          };
          self.network.download_finished(bytes, started.elapsed());
          result
        }
      };

      match result {
        CacheResult::Hit { artifact, source } => {
          if let Err(err) = self.install(target, rule_key, &artifact, output_dir) {
            warn!(target = %target, cache = %cache.name(), error = %err, "failed to install cached artifact");
            continue;
          }
          info!(target = %target, rule_key = %rule_key, source = %source, "fetched from cache");
          if cache.mode() == CacheMode::Remote {
            self.write_back(rule_key, &artifact).await;
          }
          return Some(source);
        }
        CacheResult::Miss => debug!(target = %target, cache = %cache.name(), "cache miss"),
        CacheResult::Error(message) => {
          self.counters.cache_errors.inc();
          warn!(
            target = %target,
            cache = %cache.name(),
            error = %message,
            "cache unavailable, treating as miss"
          );
        }
      }
    }
    None
  }

  fn install(&self, target: &BuildTarget, rule_key: &RuleKey, artifact: &Artifact, output_dir: &Path) -> Result<(), BuildError> {
    artifact
      .materialize(output_dir)
      .map_err(|e| BuildError::io(output_dir, e))?;
    write_marker(output_dir, &target.to_string(), rule_key)?;
    Ok(())
  }

  /// Copy a remote hit into every local cache.
  async fn write_back(&self, rule_key: &RuleKey, artifact: &Artifact) {
    for cache in &self.caches {
      if cache.mode() != CacheMode::Local {
        continue;
      }
      if let Err(err) = cache.store(rule_key, artifact).await {
        self.counters.store_errors.inc();
        warn!(cache = %cache.name(), rule_key = %rule_key, error = %err, "failed to write back remote hit");
      }
    }
  }

  async fn execute(&self, target: &BuildTarget, rule: Arc<dyn BuildRule>, rule_key: RuleKey, output_dir: PathBuf) -> NodeOutcome {
    let Ok(_permit) = self.jobs.acquire().await else {
      return NodeOutcome::Cancelled;
    };
    if self.cancelled() {
      return NodeOutcome::Cancelled;
    }

    self.transition(target, NodeState::Executing);
    info!(target = %target, rule_key = %rule_key, "building");

    if let Err(err) = prepare_output_dir(&output_dir).await {
      return NodeOutcome::Failed(err);
    }

    let ctx = StepContext {
      target: target.clone(),
      output_dir: output_dir.clone(),
      output_root: self.config.output_root.clone(),
      project_root: self.config.project_root.clone(),
      tools: rule
        .tools()
        .into_iter()
        .map(|(name, tool)| (name, tool.command_prefix(&self.config.output_root)))
        .collect(),
      cancellation: self.context.cancellation.clone(),
    };

    let started = Instant::now();
    for (index, step) in rule.steps().iter().enumerate() {
      if self.cancelled() {
        debug!(target = %target, step = index, "cancelled between steps");
        return NodeOutcome::Cancelled;
      }
      debug!(target = %target, step = index, what = %step.describe(), "running step");
      if let StepResult::Failure { exit_code, message } = self.executor.execute(&ctx, step).await {
        return NodeOutcome::Failed(BuildError::StepExecutionFailure {
          target: target.clone(),
          step: index,
          exit_code,
          message,
        });
      }
    }
    self
      .counters
      .step_millis
      .add_sample(i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX));

    let tmp_dir = output_dir.join(TMP_DIR_NAME);
    if tmp_dir.exists()
      && let Err(e) = tokio::fs::remove_dir_all(&tmp_dir).await
    {
      debug!(path = ?tmp_dir, error = %e, "failed to remove scratch dir");
    }

    let artifact = match Artifact::collect(target.clone(), &output_dir, OUTPUT_EXCLUSIONS) {
      Ok(artifact) => artifact,
      Err(e) => return NodeOutcome::Failed(BuildError::io(&output_dir, e)),
    };
    if let Err(err) = write_marker(&output_dir, &target.to_string(), &rule_key) {
      return NodeOutcome::Failed(err);
    }
    self.store(target, &rule_key, &artifact).await;

    NodeOutcome::Success {
      success: SuccessType::BuiltLocally,
      rule_key,
      output_dir,
    }
  }

  /// Store a fresh artifact everywhere. Failures are logged only.
  async fn store(&self, target: &BuildTarget, rule_key: &RuleKey, artifact: &Artifact) {
    for cache in &self.caches {
      let result = match cache.mode() {
        CacheMode::Local => cache.store(rule_key, artifact).await,
        CacheMode::Remote => {
          let Ok(_permit) = self.remote.acquire().await else {
            return;
          };
          cache.store(rule_key, artifact).await
        }
      };
      match result {
        Ok(()) => debug!(target = %target, cache = %cache.name(), "stored artifact"),
        Err(err) => {
          self.counters.store_errors.inc();
          warn!(target = %target, cache = %cache.name(), error = %err, "failed to store artifact");
        }
      }
    }
  }
}

/// Start from an empty output dir so stale files never leak into an artifact.
async fn prepare_output_dir(dir: &Path) -> Result<(), BuildError> {
  if dir.exists() {
    tokio::fs::remove_dir_all(dir).await.map_err(|e| BuildError::io(dir, e))?;
  }
  tokio::fs::create_dir_all(dir).await.map_err(|e| BuildError::io(dir, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryArtifactCache;
  use crate::rulekey::{Field, FieldKind, FieldValue, KeyedRule, RuleIndex, RuleKeyConfiguration, RuleKeyError};
  use crate::step::Step;
  use crate::util::CancellationFlag;
  use std::fs;
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  fn t(s: &str) -> BuildTarget {
    BuildTarget::parse(s).unwrap()
  }

  struct TestRule {
    target: BuildTarget,
    srcs: Vec<&'static str>,
    deps: Vec<BuildTarget>,
    steps: Vec<Step>,
  }

  impl KeyedRule for TestRule {
    fn target(&self) -> &BuildTarget {
      &self.target
    }

    fn rule_type(&self) -> &str {
      "test_rule"
    }

    fn key_fields(&self) -> Vec<Field> {
      vec![
        Field {
          name: "srcs",
          kind: FieldKind::File,
          value: FieldValue::List(self.srcs.iter().map(|s| FieldValue::File(PathBuf::from(s))).collect()),
        },
        Field {
          name: "deps",
          kind: FieldKind::Buildable,
          value: FieldValue::List(self.deps.iter().cloned().map(FieldValue::Buildable).collect()),
        },
        Field {
          name: "steps",
          kind: FieldKind::Value,
          value: serde_json::to_value(&self.steps).unwrap().into(),
        },
      ]
    }
  }

  impl BuildRule for TestRule {
    fn steps(&self) -> &[Step] {
      &self.steps
    }
  }

  #[derive(Default)]
  struct TestResolver {
    rules: Vec<Arc<TestRule>>,
  }

  impl TestResolver {
    /// `cmd` is "fail", "cancel", "slow" or the text written to `out.txt`.
    fn rule(mut self, target: &str, deps: &[&str], srcs: &[&'static str], cmd: &str) -> Self {
      let steps = match cmd {
        "fail" | "cancel" | "slow" => vec![Step::Cmd {
          cmd: cmd.to_string(),
          env: Default::default(),
          cwd: None,
        }],
        text => vec![Step::WriteFile {
          path: "out.txt".to_string(),
          content: text.to_string(),
        }],
      };
      self.rules.push(Arc::new(TestRule {
        target: t(target),
        srcs: srcs.to_vec(),
        deps: deps.iter().map(|d| t(d)).collect(),
        steps,
      }));
      self
    }

    fn find(&self, target: &BuildTarget) -> Option<Arc<TestRule>> {
      self.rules.iter().find(|r| &r.target == target).cloned()
    }
  }

  impl RuleIndex for TestResolver {
    fn keyed_rule(&self, target: &BuildTarget) -> Result<Arc<dyn KeyedRule>, RuleKeyError> {
      match self.find(target) {
        Some(rule) => Ok(rule),
        None => Err(RuleKeyError::UnknownTarget(target.clone())),
      }
    }
  }

  impl RuleResolver for TestResolver {
    fn actions(&self) -> Vec<BuildEngineAction> {
      self
        .rules
        .iter()
        .map(|r| BuildEngineAction {
          target: r.target.clone(),
          deps: r.deps.clone(),
        })
        .collect()
    }

    fn resolve(&self, action: &BuildEngineAction) -> Result<Arc<dyn BuildRule>, BuildError> {
      match self.find(&action.target) {
        Some(rule) => Ok(rule),
        None => Err(BuildError::RuleResolution {
          target: action.target.clone(),
          message: "not found".to_string(),
        }),
      }
    }
  }

  /// Counts executions per target. `fail` fails, `slow` sleeps, `cancel`
  /// trips the cancellation flag and succeeds.
  #[derive(Default)]
  struct ScriptedExecutor {
    runs: Mutex<HashMap<BuildTarget, usize>>,
    running: AtomicUsize,
    peak: AtomicUsize,
  }

  impl ScriptedExecutor {
    fn runs(&self, target: &str) -> usize {
      self.runs.lock().unwrap().get(&t(target)).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
      self.runs.lock().unwrap().values().sum()
    }
  }

  impl StepExecutor for ScriptedExecutor {
    fn execute<'a>(&'a self, ctx: &'a StepContext, step: &'a Step) -> BoxFuture<'a, StepResult> {
      Box::pin(async move {
        *self.runs.lock().unwrap().entry(ctx.target.clone()).or_default() += 1;
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = match step {
          Step::Cmd { cmd, .. } if cmd == "fail" => StepResult::Failure {
            exit_code: Some(1),
            message: "failed on purpose".to_string(),
          },
          Step::Cmd { cmd, .. } if cmd == "cancel" => {
            ctx.cancellation.cancel();
            StepResult::Success
          }
          Step::Cmd { cmd, .. } if cmd == "slow" => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            StepResult::Success
          }
          other => ShellStepExecutor::new().execute(ctx, other).await,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
      })
    }
  }

  #[derive(Default)]
  struct RecordingListener(Mutex<Vec<(BuildTarget, NodeState)>>);

  impl RecordingListener {
    fn states(&self, target: &str) -> Vec<NodeState> {
      let target = t(target);
      self
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|(t, _)| *t == target)
        .map(|(_, s)| s.clone())
        .collect()
    }
  }

  impl BuildListener for RecordingListener {
    fn on_state_change(&self, target: &BuildTarget, state: &NodeState) {
      self.0.lock().unwrap().push((target.clone(), state.clone()));
    }
  }

  struct BrokenCache;

  impl ArtifactCache for BrokenCache {
    fn name(&self) -> &str {
      "broken"
    }

    fn mode(&self) -> CacheMode {
      CacheMode::Remote
    }

    fn fetch<'a>(&'a self, _key: &'a RuleKey) -> BoxFuture<'a, CacheResult> {
      Box::pin(async { CacheResult::Error("connection refused".to_string()) })
    }

    fn store<'a>(&'a self, _key: &'a RuleKey, _artifact: &'a Artifact) -> BoxFuture<'a, Result<(), crate::cache::CacheError>> {
      Box::pin(async {
        Err(crate::cache::CacheError::Status {
          url: "http://cache".to_string(),
          status: 503,
        })
      })
    }
  }

  /// Remote cache that always misses after a delay, tracking how many
  /// fetches overlap.
  #[derive(Default)]
  struct SlowRemote {
    running: AtomicUsize,
    peak: AtomicUsize,
  }

  impl ArtifactCache for SlowRemote {
    fn name(&self) -> &str {
      "slow"
    }

    fn mode(&self) -> CacheMode {
      CacheMode::Remote
    }

    fn fetch<'a>(&'a self, _key: &'a RuleKey) -> BoxFuture<'a, CacheResult> {
      Box::pin(async move {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        CacheResult::Miss
      })
    }

    fn store<'a>(&'a self, _key: &'a RuleKey, _artifact: &'a Artifact) -> BoxFuture<'a, Result<(), crate::cache::CacheError>> {
      Box::pin(async { Ok(()) })
    }
  }

  struct Fixture {
    project: TempDir,
    out: TempDir,
    executor: Arc<ScriptedExecutor>,
    listener: Arc<RecordingListener>,
    cancellation: CancellationFlag,
  }

  impl Fixture {
    fn new() -> Self {
      let project = TempDir::new().unwrap();
      fs::write(project.path().join("a.txt"), "hello").unwrap();
      Self {
        project,
        out: TempDir::new().unwrap(),
        executor: Arc::new(ScriptedExecutor::default()),
        listener: Arc::new(RecordingListener::default()),
        cancellation: CancellationFlag::new(),
      }
    }

    fn engine(&self, resolver: TestResolver) -> BuildEngine {
      let config = BuildConfig::new(self.project.path(), self.out.path()).with_jobs(4);
      let context = BuildContext::new(RuleKeyConfiguration::new("seed", "test")).with_cancellation(self.cancellation.clone());
      BuildEngine::new(Arc::new(resolver), config, context)
        .unwrap()
        .with_executor(self.executor.clone())
        .with_listener(self.listener.clone())
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn failed_dependency_skips_cache_check() {
    let fx = Fixture::new();
    let cache = Arc::new(MemoryArtifactCache::new("memory", CacheMode::Local));
    let engine = fx
      .engine(
        TestResolver::default()
          .rule("//x:a", &["//x:b"], &[], "a")
          .rule("//x:b", &[], &["a.txt"], "fail"),
      )
      .with_cache(cache.clone());

    let report = engine.build(&[t("//x:a")]).await.unwrap();

    assert!(!report.is_success());
    assert!(matches!(
      report.outcome(&t("//x:b")),
      Some(NodeOutcome::Failed(BuildError::StepExecutionFailure { exit_code: Some(1), .. }))
    ));
    let Some(NodeOutcome::Failed(BuildError::DependencyFailed { dependency, root_cause })) = report.outcome(&t("//x:a")) else {
      panic!("a should fail on its dependency");
    };
    assert_eq!(dependency, &t("//x:b"));
    assert!(matches!(**root_cause, BuildError::StepExecutionFailure { .. }));

    assert_eq!(cache.fetch_count(), 1, "only b may reach the cache");
    assert!(!fx.listener.states("//x:a").contains(&NodeState::CacheCheck));
    assert_eq!(fx.listener.states("//x:a").last(), Some(&NodeState::Failed));
    assert_eq!(fx.executor.runs("//x:a"), 0);
    assert_eq!(report.failures().len(), 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn independent_failure_does_not_stop_siblings() {
    let fx = Fixture::new();
    let engine = fx.engine(
      TestResolver::default()
        .rule("//x:broken", &[], &[], "fail")
        .rule("//x:fine", &[], &[], "fine"),
    );

    let report = engine.build(&[]).await.unwrap();
    assert_eq!(report.success_type(&t("//x:fine")), Some(&SuccessType::BuiltLocally));
    assert_eq!(report.failures().len(), 1);
    assert_eq!(
      fs::read_to_string(fx.out.path().join("x/__fine__/out.txt")).unwrap(),
      "fine"
    );
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn shared_dependency_executes_once() {
    let fx = Fixture::new();
    let engine = fx.engine(
      TestResolver::default()
        .rule("//app:bin", &["//lib:a", "//lib:b"], &[], "bin")
        .rule("//lib:a", &["//base:core"], &[], "slow")
        .rule("//lib:b", &["//base:core"], &[], "slow")
        .rule("//base:core", &[], &["a.txt"], "core"),
    );

    let report = engine
      .build(&[t("//app:bin"), t("//lib:a"), t("//lib:b"), t("//app:bin")])
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(fx.executor.runs("//base:core"), 1);
    assert_eq!(fx.executor.total(), 4);
    assert_eq!(fx.executor.peak.load(Ordering::SeqCst), 2, "lib:a and lib:b run side by side");
    assert_eq!(report.rule_keys.len(), 4);
  }

  #[tokio::test]
  async fn jobs_bound_parallel_execution() {
    let fx = Fixture::new();
    let resolver = TestResolver::default()
      .rule("//p:a", &[], &[], "slow")
      .rule("//p:b", &[], &[], "slow")
      .rule("//p:c", &[], &[], "slow");
    let config = BuildConfig::new(fx.project.path(), fx.out.path()).with_jobs(1);
    let engine = BuildEngine::new(Arc::new(resolver), config, BuildContext::new(RuleKeyConfiguration::new("s", "v")))
      .unwrap()
      .with_executor(fx.executor.clone());

    assert!(engine.build(&[]).await.unwrap().is_success());
    assert_eq!(fx.executor.peak.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn unchanged_rule_reuses_outputs() {
    let fx = Fixture::new();
    let resolver = || TestResolver::default().rule("//x:y", &[], &["a.txt"], "built");

    let first = fx.engine(resolver()).build(&[]).await.unwrap();
    assert_eq!(first.success_type(&t("//x:y")), Some(&SuccessType::BuiltLocally));

    let second = fx.engine(resolver()).build(&[]).await.unwrap();
    assert_eq!(second.success_type(&t("//x:y")), Some(&SuccessType::MatchingRuleKey));
    assert_eq!(fx.executor.runs("//x:y"), 1);
    assert_eq!(first.rule_keys, second.rule_keys);

    fs::write(fx.project.path().join("a.txt"), "changed").unwrap();
    let third = fx.engine(resolver()).build(&[]).await.unwrap();
    assert_eq!(third.success_type(&t("//x:y")), Some(&SuccessType::BuiltLocally));
    assert_ne!(third.rule_keys, first.rule_keys);
  }

  #[tokio::test]
  async fn remote_hit_is_materialized_and_written_back() {
    let fx = Fixture::new();
    let remote = Arc::new(MemoryArtifactCache::new("remote", CacheMode::Remote));
    let resolver = || TestResolver::default().rule("//x:y", &[], &["a.txt"], "payload");

    let first = fx.engine(resolver()).with_cache(remote.clone()).build(&[]).await.unwrap();
    assert_eq!(first.success_type(&t("//x:y")), Some(&SuccessType::BuiltLocally));
    assert_eq!(remote.store_count(), 1);

    let fresh = Fixture::new();
    let local = Arc::new(MemoryArtifactCache::new("local", CacheMode::Local));
    let report = fresh
      .engine(resolver())
      .with_cache(remote.clone())
      .with_cache(local.clone())
      .build(&[])
      .await
      .unwrap();

    assert_eq!(
      report.success_type(&t("//x:y")),
      Some(&SuccessType::FetchedFromCache {
        source: "remote".to_string()
      })
    );
    assert_eq!(fresh.executor.total(), 0);
    assert_eq!(
      fs::read_to_string(fresh.out.path().join("x/__y__/out.txt")).unwrap(),
      "payload"
    );
    assert_eq!(local.fetch_count(), 1, "local cache is consulted first");
    assert!(local.contains(&report.rule_keys[&t("//x:y")]));
    assert_eq!(report.network.downloads_started, 1);
    assert_eq!(report.network.artifacts_downloaded, 1);
    assert_eq!(report.network.bytes_downloaded, "payload".len() as u64);
  }

  #[tokio::test]
  #[traced_test]
  async fn unavailable_cache_degrades_to_miss() {
    let fx = Fixture::new();
    let engine = fx
      .engine(TestResolver::default().rule("//x:y", &[], &[], "ok"))
      .with_cache(Arc::new(BrokenCache));

    let report = engine.build(&[]).await.unwrap();
    assert_eq!(report.success_type(&t("//x:y")), Some(&SuccessType::BuiltLocally));
    assert!(logs_contain("cache unavailable, treating as miss"));
    assert!(logs_contain("failed to store artifact"));
  }

  #[tokio::test]
  async fn cancelled_before_start_marks_everything_cancelled() {
    let fx = Fixture::new();
    fx.cancellation.cancel();
    let engine = fx.engine(
      TestResolver::default()
        .rule("//x:a", &["//x:b"], &[], "a")
        .rule("//x:b", &[], &[], "b"),
    );

    let report = engine.build(&[]).await.unwrap();
    assert_eq!(report.cancelled().len(), 2);
    assert!(report.failures().is_empty());
    assert_eq!(fx.executor.total(), 0);
  }

  #[tokio::test]
  async fn cancellation_stops_scheduling_dependents() {
    let fx = Fixture::new();
    let engine = fx.engine(
      TestResolver::default()
        .rule("//x:a", &["//x:b"], &[], "a")
        .rule("//x:b", &[], &[], "cancel"),
    );

    let report = engine.build(&[]).await.unwrap();
    assert!(report.outcome(&t("//x:b")).unwrap().is_success(), "in-flight node finishes");
    assert_eq!(report.outcome(&t("//x:a")), Some(&NodeOutcome::Cancelled));
    assert_eq!(fx.executor.runs("//x:a"), 0);
  }

  #[tokio::test]
  async fn unknown_target_is_rejected_before_building() {
    let fx = Fixture::new();
    let engine = fx.engine(TestResolver::default().rule("//x:y", &[], &[], "ok"));
    assert_eq!(
      engine.build(&[t("//x:nope")]).await.unwrap_err(),
      BuildError::UnknownTarget(t("//x:nope"))
    );
  }

  #[tokio::test]
  async fn counters_record_outcomes() {
    let fx = Fixture::new();
    let engine = fx.engine(
      TestResolver::default()
        .rule("//x:ok", &[], &[], "ok")
        .rule("//x:bad", &[], &[], "fail"),
    );
    engine.build(&[]).await.unwrap();

    let snapshots = engine.context().counters.flush_all();
    let value = |name: &str| {
      snapshots
        .iter()
        .find(|s| s.info.name == name)
        .map(|s| s.value.clone())
    };
    assert_eq!(value("rules_built"), Some(crate::counters::CounterValue::Integer { value: 1 }));
    assert_eq!(value("rules_failed"), Some(crate::counters::CounterValue::Integer { value: 1 }));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn remote_requests_respect_concurrency_limit() {
    let fx = Fixture::new();
    let remote = Arc::new(SlowRemote::default());
    let resolver = TestResolver::default()
      .rule("//r:a", &[], &[], "a")
      .rule("//r:b", &[], &[], "b")
      .rule("//r:c", &[], &[], "c")
      .rule("//r:d", &[], &[], "d");
    let config = BuildConfig::new(fx.project.path(), fx.out.path())
      .with_jobs(4)
      .with_remote_concurrency(1);
    let engine = BuildEngine::new(Arc::new(resolver), config, BuildContext::new(RuleKeyConfiguration::new("s", "v")))
      .unwrap()
      .with_executor(fx.executor.clone())
      .with_cache(remote.clone());

    let report = engine.build(&[]).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.network.downloads_started, 4);
    assert_eq!(remote.peak.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn repeated_builds_reuse_registered_counters() {
    let fx = Fixture::new();
    let engine = fx.engine(TestResolver::default().rule("//x:ok", &[], &[], "ok"));
    let registered = engine.context().counters.len();

    engine.build(&[]).await.unwrap();
    engine.build(&[]).await.unwrap();
    engine.build(&[]).await.unwrap();

    assert_eq!(engine.context().counters.len(), registered);
    let snapshots = engine.context().counters.flush_all();
    let built = snapshots.iter().find(|s| s.info.name == "rules_built").map(|s| s.value.clone());
    let matching = snapshots.iter().find(|s| s.info.name == "rules_matching").map(|s| s.value.clone());
    assert_eq!(built, Some(crate::counters::CounterValue::Integer { value: 1 }));
    assert_eq!(matching, Some(crate::counters::CounterValue::Integer { value: 2 }));
  }
}
