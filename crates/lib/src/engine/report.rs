use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::RemoteDownloadStats;
use crate::rulekey::RuleKey;
use crate::target::BuildTarget;

use super::types::{BuildError, NodeOutcome, SuccessType};

/// Everything one build produced, per target.
#[derive(Debug, Clone)]
pub struct BuildReport {
  pub build_id: String,
  pub outcomes: BTreeMap<BuildTarget, NodeOutcome>,
  /// Every rule key that was computed, failed nodes included.
  pub rule_keys: BTreeMap<BuildTarget, RuleKey>,
  pub network: RemoteDownloadStats,
  pub elapsed: Duration,
}

impl BuildReport {
  /// True when every node reached `Done`.
  pub fn is_success(&self) -> bool {
    self.outcomes.values().all(NodeOutcome::is_success)
  }

  /// Every failed node with the failure that started it.
  pub fn failures(&self) -> Vec<(&BuildTarget, &BuildError)> {
    self
      .outcomes
      .iter()
      .filter_map(|(target, outcome)| match outcome {
        NodeOutcome::Failed(err) => Some((target, err.root_cause())),
        _ => None,
      })
      .collect()
  }

  pub fn cancelled(&self) -> Vec<&BuildTarget> {
    self
      .outcomes
      .iter()
      .filter(|(_, outcome)| matches!(outcome, NodeOutcome::Cancelled))
      .map(|(target, _)| target)
      .collect()
  }

  pub fn outcome(&self, target: &BuildTarget) -> Option<&NodeOutcome> {
    self.outcomes.get(target)
  }

  pub fn success_type(&self, target: &BuildTarget) -> Option<&SuccessType> {
    match self.outcomes.get(target)? {
      NodeOutcome::Success { success, .. } => Some(success),
      _ => None,
    }
  }

  /// Successful nodes per `SuccessType` label.
  pub fn success_counts(&self) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for outcome in self.outcomes.values() {
      if let NodeOutcome::Success { success, .. } = outcome {
        *counts.entry(success.label()).or_insert(0) += 1;
      }
    }
    counts
  }

  /// `<target> <key>` then one indented line per logged contribution.
  pub fn rule_key_log_lines(&self) -> Vec<String> {
    let mut lines = Vec::new();
    for (target, key) in &self.rule_keys {
      lines.push(format!("{target} {key}"));
      if let Some(log) = key.log() {
        lines.extend(log.lines().map(|line| format!("  {line}")));
      }
    }
    lines
  }
}
