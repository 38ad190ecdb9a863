use std::sync::Arc;

use tracing::debug;

use crate::compute::{ComputeEnv, ComputeError, Computation};
use crate::target::BuildTarget;
use crate::util::BoxFuture;

use super::factory::RuleKeyFactory;
use super::fields::KeyedRule;
use super::types::{RuleKey, RuleKeyError};

/// Looks up the rule that defines a target.
pub trait RuleIndex: Send + Sync {
  fn keyed_rule(&self, target: &BuildTarget) -> Result<Arc<dyn KeyedRule>, RuleKeyError>;
}

/// Computes rule keys bottom-up: every key-contributing dependency is a
/// preliminary dependency, so its key is known before the dependent's is built.
pub struct RuleKeyComputation<I: ?Sized> {
  index: Arc<I>,
  factory: RuleKeyFactory,
}

impl<I: RuleIndex + ?Sized> RuleKeyComputation<I> {
  pub fn new(index: Arc<I>, factory: RuleKeyFactory) -> Self {
    Self { index, factory }
  }

  pub fn factory(&self) -> &RuleKeyFactory {
    &self.factory
  }

  fn rule(&self, target: &BuildTarget) -> Result<Arc<dyn KeyedRule>, ComputeError> {
    self
      .index
      .keyed_rule(target)
      .map_err(|e| ComputeError::msg(e.to_string()))
  }
}

impl<I: RuleIndex + ?Sized + 'static> Computation for RuleKeyComputation<I> {
  type Key = BuildTarget;
  type Output = RuleKey;

  fn preliminary_deps(&self, target: &BuildTarget) -> Result<Vec<BuildTarget>, ComputeError> {
    Ok(self.rule(target)?.key_dependencies())
  }

  fn compute(&self, target: BuildTarget, env: ComputeEnv<Self>) -> BoxFuture<'_, Result<RuleKey, ComputeError>> {
    Box::pin(async move {
      let rule = self.rule(&target)?;
      let key = self
        .factory
        .build(rule.as_ref(), &|dep| env.dep(dep).cloned())
        .map_err(|e| ComputeError::msg(e.to_string()))?;
      debug!(target = %target, rule_key = %key, "computed rule key");
      Ok(key)
    })
  }
}
