//! Action graph for dependency ordering and parallel planning.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::target::BuildTarget;

use super::types::{BuildEngineAction, BuildError};

/// A DAG of build actions. Edges run from a dependency to its dependent.
#[derive(Debug)]
pub struct ActionGraph {
  graph: DiGraph<BuildTarget, ()>,
  nodes: HashMap<BuildTarget, NodeIndex>,
  actions: HashMap<BuildTarget, BuildEngineAction>,
}

impl ActionGraph {
  /// Build the graph, rejecting duplicate targets, unknown dependencies and
  /// cycles.
  pub fn new(actions: Vec<BuildEngineAction>) -> Result<Self, BuildError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    let mut by_target = HashMap::new();

    for action in actions {
      if nodes.contains_key(&action.target) {
        return Err(BuildError::DuplicateAction(action.target));
      }
      let idx = graph.add_node(action.target.clone());
      nodes.insert(action.target.clone(), idx);
      by_target.insert(action.target.clone(), action);
    }

    for action in by_target.values() {
      let dependent = nodes[&action.target];
      for dep in &action.deps {
        let Some(&dep_idx) = nodes.get(dep) else {
          return Err(BuildError::UnknownDependency {
            target: action.target.clone(),
            dependency: dep.clone(),
          });
        };
        graph.update_edge(dep_idx, dependent, ());
      }
    }

    let dag = Self {
      graph,
      nodes,
      actions: by_target,
    };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), BuildError> {
    match toposort(&self.graph, None) {
      Ok(_) => Ok(()),
      Err(cycle) => Err(BuildError::CyclicDependency {
        path: self.cycle_through(cycle.node_id()),
      }),
    }
  }

  /// A closed path of targets through `start`, listed dependent first.
  fn cycle_through(&self, start: NodeIndex) -> Vec<String> {
    let component: HashSet<NodeIndex> = tarjan_scc(&self.graph)
      .into_iter()
      .find(|scc| scc.contains(&start))
      .map(|scc| scc.into_iter().collect())
      .unwrap_or_default();

    // Walk dependent -> dependency, which is the incoming direction.
    let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
      for next in self.graph.neighbors_directed(current, Direction::Incoming) {
        if !component.contains(&next) {
          continue;
        }
        if next == start {
          let mut path = vec![start];
          let mut node = current;
          while node != start {
            path.push(node);
            node = previous[&node];
          }
          path.reverse();
          path.insert(0, start);
          return path.into_iter().map(|idx| self.graph[idx].to_string()).collect();
        }
        if let std::collections::hash_map::Entry::Vacant(e) = previous.entry(next) {
          e.insert(current);
          queue.push_back(next);
        }
      }
    }

    vec![self.graph[start].to_string(), self.graph[start].to_string()]
  }

  pub fn contains(&self, target: &BuildTarget) -> bool {
    self.nodes.contains_key(target)
  }

  pub fn action(&self, target: &BuildTarget) -> Option<&BuildEngineAction> {
    self.actions.get(target)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Every target, dependencies before dependents.
  pub fn topological_order(&self) -> Vec<BuildTarget> {
    toposort(&self.graph, None)
      .map(|order| order.into_iter().map(|idx| self.graph[idx].clone()).collect())
      .unwrap_or_default()
  }

  /// Targets grouped into levels: every dependency of a target sits in an
  /// earlier level, so each level can run in parallel. Targets inside a
  /// level are sorted.
  pub fn waves(&self) -> Vec<Vec<BuildTarget>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[idx] == 0).copied().collect();
      if ready.is_empty() {
        break;
      }

      for idx in &ready {
        remaining.remove(idx);
        for dependent in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<BuildTarget> = ready.into_iter().map(|idx| self.graph[idx].clone()).collect();
      wave.sort();
      waves.push(wave);
    }

    waves
  }

  /// Direct dependencies of `target`.
  pub fn dependencies(&self, target: &BuildTarget) -> Vec<BuildTarget> {
    self.neighbors(target, Direction::Incoming)
  }

  /// Direct dependents of `target`.
  pub fn dependents(&self, target: &BuildTarget) -> Vec<BuildTarget> {
    self.neighbors(target, Direction::Outgoing)
  }

  fn neighbors(&self, target: &BuildTarget, direction: Direction) -> Vec<BuildTarget> {
    let Some(&idx) = self.nodes.get(target) else {
      return Vec::new();
    };
    let mut out: Vec<BuildTarget> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out
  }

  /// `targets` plus everything they depend on, transitively.
  pub fn closure(&self, targets: &[BuildTarget]) -> Vec<BuildTarget> {
    let mut seen = HashSet::new();
    let mut stack: Vec<NodeIndex> = targets.iter().filter_map(|t| self.nodes.get(t).copied()).collect();
    while let Some(idx) = stack.pop() {
      if seen.insert(idx) {
        stack.extend(self.graph.neighbors_directed(idx, Direction::Incoming));
      }
    }
    let mut out: Vec<BuildTarget> = seen.into_iter().map(|idx| self.graph[idx].clone()).collect();
    out.sort();
    out
  }

  /// Every target in declaration-independent sorted order.
  pub fn targets(&self) -> Vec<BuildTarget> {
    let mut out: Vec<BuildTarget> = self.nodes.keys().cloned().collect();
    out.sort();
    out
  }
}
