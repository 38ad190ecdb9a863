use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{BuildEngineAction, BuildError, BuildRule, RuleResolver};
use crate::rulekey::{KeyedRule, RuleIndex, RuleKeyError};
use crate::target::BuildTarget;

use super::types::ManifestRule;

/// Serves build-file rules to the build engine and the rule-key engine.
#[derive(Debug, Clone, Default)]
pub struct ManifestResolver {
  order: Vec<BuildTarget>,
  rules: HashMap<BuildTarget, Arc<ManifestRule>>,
}

impl ManifestResolver {
  pub fn new(rules: impl IntoIterator<Item = Arc<ManifestRule>>) -> Self {
    let mut resolver = Self::default();
    for rule in rules {
      let target = rule.target().clone();
      if resolver.rules.insert(target.clone(), rule).is_none() {
        resolver.order.push(target);
      }
    }
    resolver
  }

  fn rule(&self, target: &BuildTarget) -> Option<&Arc<ManifestRule>> {
    self.rules.get(target)
  }
}

impl RuleIndex for ManifestResolver {
  fn keyed_rule(&self, target: &BuildTarget) -> Result<Arc<dyn KeyedRule>, RuleKeyError> {
    match self.rule(target) {
      Some(rule) => Ok(rule.clone()),
      None => Err(RuleKeyError::UnknownTarget(target.clone())),
    }
  }
}

impl RuleResolver for ManifestResolver {
  /// Dependencies cover declared deps and the producers of binary tools.
  fn actions(&self) -> Vec<BuildEngineAction> {
    self
      .order
      .iter()
      .filter_map(|target| self.rule(target))
      .map(|rule| BuildEngineAction {
        target: rule.target().clone(),
        deps: rule.key_dependencies(),
      })
      .collect()
  }

  fn resolve(&self, action: &BuildEngineAction) -> Result<Arc<dyn BuildRule>, BuildError> {
    match self.rule(&action.target) {
      Some(rule) => Ok(rule.clone()),
      None => Err(BuildError::RuleResolution {
        target: action.target.clone(),
        message: "no rule in the build file".to_string(),
      }),
    }
  }
}
