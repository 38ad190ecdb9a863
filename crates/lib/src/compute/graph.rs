//! Dependency edges recorded while computations run.
//!
//! Edges point from a dependent to the key it requested. The same edges serve
//! cycle detection (a new edge must not close a loop back to its requester)
//! and invalidation (walking reverse edges to every transitive dependent).

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{ComputeError, ComputeKey};

#[derive(Debug)]
pub(crate) struct DependencyGraph<K> {
  forward: HashMap<K, Vec<K>>,
  reverse: HashMap<K, Vec<K>>,
}

impl<K: ComputeKey> DependencyGraph<K> {
  pub(crate) fn new() -> Self {
    Self {
      forward: HashMap::new(),
      reverse: HashMap::new(),
    }
  }

  /// Record `from -> to`.
  ///
  /// With `check_cycle`, the edge is refused when `to` can already reach
  /// `from`; the error names every key on the loop.
  pub(crate) fn record(&mut self, from: &K, to: &K, check_cycle: bool) -> Result<(), ComputeError> {
    if check_cycle {
      if from == to {
        return Err(ComputeError::CyclicDependency {
          path: vec![from.to_string(), to.to_string()],
        });
      }
      if let Some(path) = self.path(to, from) {
        let mut cycle = Vec::with_capacity(path.len() + 1);
        cycle.push(from.to_string());
        cycle.extend(path.iter().map(ToString::to_string));
        return Err(ComputeError::CyclicDependency { path: cycle });
      }
    }

    let deps = self.forward.entry(from.clone()).or_default();
    if !deps.contains(to) {
      deps.push(to.clone());
      self.reverse.entry(to.clone()).or_default().push(from.clone());
    }
    Ok(())
  }

  /// Breadth-first path from `start` to `goal`, both inclusive.
  fn path(&self, start: &K, goal: &K) -> Option<Vec<K>> {
    let mut parents: HashMap<&K, &K> = HashMap::new();
    let mut seen: HashSet<&K> = HashSet::from([start]);
    let mut queue: VecDeque<&K> = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
      if node == goal {
        let mut path = vec![node.clone()];
        let mut cursor = node;
        while let Some(&parent) = parents.get(cursor) {
          path.push(parent.clone());
          cursor = parent;
        }
        path.reverse();
        return Some(path);
      }
      for next in self.forward.get(node).into_iter().flatten() {
        if seen.insert(next) {
          parents.insert(next, node);
          queue.push_back(next);
        }
      }
    }
    None
  }

  pub(crate) fn dependencies(&self, key: &K) -> Vec<K> {
    self.forward.get(key).cloned().unwrap_or_default()
  }

  pub(crate) fn dependents(&self, key: &K) -> Vec<K> {
    self.reverse.get(key).cloned().unwrap_or_default()
  }

  /// `key` followed by everything that transitively depends on it.
  pub(crate) fn transitive_dependents(&self, key: &K) -> Vec<K> {
    let mut out = vec![key.clone()];
    let mut seen: HashSet<K> = HashSet::from([key.clone()]);
    let mut cursor = 0;
    while cursor < out.len() {
      for dependent in self.reverse.get(&out[cursor]).into_iter().flatten() {
        if seen.insert(dependent.clone()) {
          out.push(dependent.clone());
        }
      }
      cursor += 1;
    }
    out
  }

  /// Forget the outgoing edges of `key`; it will re-record them when recomputed.
  pub(crate) fn clear_outgoing(&mut self, key: &K) {
    if let Some(deps) = self.forward.remove(key) {
      for dep in deps {
        if let Some(back) = self.reverse.get_mut(&dep) {
          back.retain(|k| k != key);
        }
      }
    }
  }
}
