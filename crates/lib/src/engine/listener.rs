use crate::target::BuildTarget;

use super::types::NodeState;

/// Observes node state transitions. Called from worker tasks, so
/// implementations must be cheap and thread-safe.
pub trait BuildListener: Send + Sync {
  fn on_state_change(&self, target: &BuildTarget, state: &NodeState);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl BuildListener for NoopListener {
  fn on_state_change(&self, _target: &BuildTarget, _state: &NodeState) {}
}
