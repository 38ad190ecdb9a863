use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::util::hash::ContentHash;

/// Inputs larger than this are keyed by reference. The default never does.
pub const DEFAULT_INPUT_SIZE_LIMIT: u64 = u64::MAX;

/// Decides whether, and how, the identity of the module implementing a rule
/// type contributes to that rule's key.
pub trait ModuleHashStrategy: Send + Sync {
  fn module_hash(&self, rule_type: &str) -> Option<ContentHash>;
}

/// Module identity never affects output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopModuleHashStrategy;

impl ModuleHashStrategy for NoopModuleHashStrategy {
  fn module_hash(&self, _rule_type: &str) -> Option<ContentHash> {
    None
  }
}

/// Folds a fixed per-rule-type hash into every key of that type.
#[derive(Debug, Default, Clone)]
pub struct DefaultModuleHashStrategy {
  hashes: HashMap<String, ContentHash>,
}

impl DefaultModuleHashStrategy {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_module(mut self, rule_type: impl Into<String>, hash: ContentHash) -> Self {
    self.hashes.insert(rule_type.into(), hash);
    self
  }
}

impl ModuleHashStrategy for DefaultModuleHashStrategy {
  fn module_hash(&self, rule_type: &str) -> Option<ContentHash> {
    self.hashes.get(rule_type).copied()
  }
}

/// Build-scoped inputs shared by every rule key computed in one build.
///
/// Constructed once at build start and never mutated afterwards.
#[derive(Clone)]
pub struct RuleKeyConfiguration {
  pub seed: String,
  pub build_version: String,
  pub input_size_limit: u64,
  pub module_hash: Arc<dyn ModuleHashStrategy>,
}

impl RuleKeyConfiguration {
  pub fn new(seed: impl Into<String>, build_version: impl Into<String>) -> Self {
    Self {
      seed: seed.into(),
      build_version: build_version.into(),
      input_size_limit: DEFAULT_INPUT_SIZE_LIMIT,
      module_hash: Arc::new(NoopModuleHashStrategy),
    }
  }

  pub fn with_input_size_limit(mut self, limit: u64) -> Self {
    self.input_size_limit = limit;
    self
  }

  pub fn with_module_hash(mut self, strategy: impl ModuleHashStrategy + 'static) -> Self {
    self.module_hash = Arc::new(strategy);
    self
  }
}

impl fmt::Debug for RuleKeyConfiguration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RuleKeyConfiguration")
      .field("seed", &self.seed)
      .field("build_version", &self.build_version)
      .field("input_size_limit", &self.input_size_limit)
      .finish_non_exhaustive()
  }
}
