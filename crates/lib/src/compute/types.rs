//! Keys, computations, composed results and errors for the graph engine.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use thiserror::Error;

use crate::util::BoxFuture;

use super::engine::ComputeEnv;

/// Identifier for a unit of memoized computation.
///
/// Equal keys always resolve to the same cached result within one engine.
pub trait ComputeKey: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static {}

impl<T> ComputeKey for T where T: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static {}

/// A memoizable transformation from keys to results.
///
/// `preliminary_deps` are declared upfront and fully resolved before `compute`
/// runs; their results are available through [`ComputeEnv::dep`]. Anything
/// else can be discovered while computing via [`ComputeEnv::request`].
pub trait Computation: Send + Sync + Sized + 'static {
  type Key: ComputeKey;
  type Output: Clone + Send + Sync + 'static;

  fn preliminary_deps(&self, _key: &Self::Key) -> Result<Vec<Self::Key>, ComputeError> {
    Ok(Vec::new())
  }

  fn compute(&self, key: Self::Key, env: ComputeEnv<Self>) -> BoxFuture<'_, Result<Self::Output, ComputeError>>;
}

/// Errors produced by the graph engine.
///
/// Results (including failures) are memoized and handed to every waiter, so
/// the error is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
  /// The keys form a cycle. `path` starts and ends with the same key.
  #[error("cyclic dependency: {}", .path.join(" -> "))]
  CyclicDependency { path: Vec<String> },

  /// The computation for `key` failed. When a failure travels through
  /// dependents the innermost failing key is kept.
  #[error("computation failed for {key}: {cause}")]
  ComputationFailed {
    key: String,
    #[source]
    cause: Arc<ComputeError>,
  },

  /// A failure raised by a computation itself.
  #[error("{0}")]
  Message(String),

  #[error("computation cancelled")]
  Cancelled,
}

impl ComputeError {
  pub fn msg(message: impl Into<String>) -> Self {
    ComputeError::Message(message.into())
  }

  /// Tag an error with the key whose evaluation produced it.
  ///
  /// Cycles and already-tagged failures pass through untouched so the root
  /// cause survives propagation.
  pub(crate) fn tag(self, key: &impl fmt::Display) -> Self {
    match self {
      ComputeError::Message(_) => ComputeError::ComputationFailed {
        key: key.to_string(),
        cause: Arc::new(self),
      },
      other => other,
    }
  }

  /// The key at the root of a failure, if tagged.
  pub fn root_key(&self) -> Option<&str> {
    match self {
      ComputeError::ComputationFailed { key, .. } => Some(key),
      _ => None,
    }
  }
}

/// An ordered mapping from sub-keys to their results.
///
/// Iteration order is the order in which the sub-keys were requested.
#[derive(Debug, Clone)]
pub struct ComposedResult<K, V> {
  entries: Vec<(K, V)>,
  index: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone, V> ComposedResult<K, V> {
  pub fn new() -> Self {
    Self {
      entries: Vec::new(),
      index: HashMap::new(),
    }
  }

  pub(crate) fn push(&mut self, key: K, value: V) {
    if self.index.contains_key(&key) {
      return;
    }
    self.index.insert(key.clone(), self.entries.len());
    self.entries.push((key, value));
  }

  pub fn get(&self, key: &K) -> Option<&V> {
    self.index.get(key).map(|&i| &self.entries[i].1)
  }

  pub fn contains_key(&self, key: &K) -> bool {
    self.index.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
    self.entries.iter().map(|(k, v)| (k, v))
  }

  pub fn keys(&self) -> impl Iterator<Item = &K> {
    self.entries.iter().map(|(k, _)| k)
  }

  pub fn values(&self) -> impl Iterator<Item = &V> {
    self.entries.iter().map(|(_, v)| v)
  }

  pub fn into_entries(self) -> Vec<(K, V)> {
    self.entries
  }
}

impl<K: Eq + Hash + Clone, V> Default for ComposedResult<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn composed_result_keeps_insertion_order() {
    let mut composed = ComposedResult::new();
    composed.push("z", 1);
    composed.push("a", 2);
    composed.push("m", 3);

    assert_eq!(composed.keys().copied().collect::<Vec<_>>(), vec!["z", "a", "m"]);
    assert_eq!(composed.get(&"a"), Some(&2));
    assert_eq!(composed.len(), 3);
  }

  #[test]
  fn composed_result_ignores_duplicate_keys() {
    let mut composed = ComposedResult::new();
    composed.push("a", 1);
    composed.push("a", 99);

    assert_eq!(composed.len(), 1);
    assert_eq!(composed.get(&"a"), Some(&1));
  }

  #[test]
  fn tagging_preserves_root_cause() {
    let inner = ComputeError::msg("disk on fire").tag(&"//leaf:a");
    assert_eq!(inner.root_key(), Some("//leaf:a"));

    let outer = inner.tag(&"//root:b");
    assert_eq!(outer.root_key(), Some("//leaf:a"));
    assert!(outer.to_string().contains("disk on fire"));
  }

  #[test]
  fn cycle_error_lists_path() {
    let err = ComputeError::CyclicDependency {
      path: vec!["A".into(), "B".into(), "A".into()],
    };
    assert_eq!(err.to_string(), "cyclic dependency: A -> B -> A");
    assert_eq!(err.clone().tag(&"C").to_string(), err.to_string());
  }
}
