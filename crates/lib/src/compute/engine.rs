//! Memoizing, concurrent evaluator for [`Computation`]s.
//!
//! Every key owns one [`OnceCell`]. The first caller to reach it runs the
//! computation; everyone else awaits the same cell and receives a clone of the
//! memoized result, success or failure.
//!
//! Before a computation awaits another key, the edge is recorded in a shared
//! [`DependencyGraph`]. An edge that would close a loop is refused with
//! [`ComputeError::CyclicDependency`], so a cycle fails instead of leaving
//! two cells waiting on each other forever.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::util::{BoxFuture, ScopedRwLock};

use super::graph::DependencyGraph;
use super::types::{ComposedResult, ComputeError, Computation};

type Memo<C> = Arc<OnceCell<Result<<C as Computation>::Output, ComputeError>>>;

struct Inner<C: Computation> {
  computation: C,
  memo: ScopedRwLock<HashMap<C::Key, Memo<C>>>,
  edges: ScopedRwLock<DependencyGraph<C::Key>>,
  evaluations: AtomicUsize,
}

/// Shared handle to a memoized computation graph. Cloning is cheap.
pub struct GraphEngine<C: Computation> {
  inner: Arc<Inner<C>>,
}

impl<C: Computation> Clone for GraphEngine<C> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<C: Computation> GraphEngine<C> {
  pub fn new(computation: C) -> Self {
    Self {
      inner: Arc::new(Inner {
        computation,
        memo: ScopedRwLock::new(HashMap::new()),
        edges: ScopedRwLock::new(DependencyGraph::new()),
        evaluations: AtomicUsize::new(0),
      }),
    }
  }

  pub fn computation(&self) -> &C {
    &self.inner.computation
  }

  /// Compute (or fetch the memoized result for) `key`.
  pub async fn compute(&self, key: C::Key) -> Result<C::Output, ComputeError> {
    self.request(None, key).await
  }

  /// Compute every key and return their results in request order.
  ///
  /// Duplicates are collapsed. All sub-keys are driven to completion; if any
  /// failed, the error of the earliest failing key (in request order) wins.
  pub async fn compose(
    &self,
    keys: impl IntoIterator<Item = C::Key>,
  ) -> Result<ComposedResult<C::Key, C::Output>, ComputeError> {
    self.compose_from(None, keys.into_iter().collect()).await
  }

  /// Memoized result for `key`, if its computation has finished.
  pub fn peek(&self, key: &C::Key) -> Option<Result<C::Output, ComputeError>> {
    self
      .inner
      .memo
      .with_read(|memo| memo.get(key).and_then(|cell| cell.get().cloned()))
  }

  /// Keys `key` requested while it was computed.
  pub fn dependencies(&self, key: &C::Key) -> Vec<C::Key> {
    self.inner.edges.with_read(|edges| edges.dependencies(key))
  }

  /// Keys that requested `key`.
  pub fn dependents(&self, key: &C::Key) -> Vec<C::Key> {
    self.inner.edges.with_read(|edges| edges.dependents(key))
  }

  /// Drop the memoized results of `key` and of everything that transitively
  /// depends on it. Returns the affected keys, `key` first.
  ///
  /// Must not race with an in-flight computation of an affected key.
  pub fn invalidate(&self, key: &C::Key) -> Vec<C::Key> {
    let affected = self.inner.edges.with_write(|edges| {
      let affected = edges.transitive_dependents(key);
      for k in &affected {
        edges.clear_outgoing(k);
      }
      affected
    });
    self.inner.memo.with_write(|memo| {
      for k in &affected {
        memo.remove(k);
      }
    });
    debug!(key = %key, invalidated = affected.len(), "invalidated memoized results");
    affected
  }

  /// How many times the computation function has been entered.
  pub fn computed_count(&self) -> usize {
    self.inner.evaluations.load(Ordering::Relaxed)
  }

  fn cell(&self, key: &C::Key) -> Memo<C> {
    if let Some(cell) = self.inner.memo.with_read(|memo| memo.get(key).cloned()) {
      return cell;
    }
    self
      .inner
      .memo
      .with_write(|memo| Arc::clone(memo.entry(key.clone()).or_default()))
  }

  fn request(&self, from: Option<C::Key>, key: C::Key) -> BoxFuture<'static, Result<C::Output, ComputeError>> {
    let engine = self.clone();
    Box::pin(async move {
      let cell = engine.cell(&key);

      if let Some(from) = &from {
        let settled = cell.initialized();
        engine.inner.edges.with_write(|edges| edges.record(from, &key, !settled))?;
      }

      cell
        .get_or_init(|| engine.evaluate(key.clone()))
        .await
        .clone()
    })
  }

  async fn evaluate(&self, key: C::Key) -> Result<C::Output, ComputeError> {
    let preliminary = self.inner.computation.preliminary_deps(&key).map_err(|e| e.tag(&key))?;
    let deps = if preliminary.is_empty() {
      ComposedResult::new()
    } else {
      trace!(key = %key, count = preliminary.len(), "resolving preliminary dependencies");
      self.compose_from(Some(key.clone()), preliminary).await?
    };

    self.inner.evaluations.fetch_add(1, Ordering::Relaxed);
    trace!(key = %key, "computing");

    let env = ComputeEnv {
      engine: self.clone(),
      key: key.clone(),
      deps,
    };
    self
      .inner
      .computation
      .compute(key.clone(), env)
      .await
      .map_err(|e| e.tag(&key))
  }

  async fn compose_from(
    &self,
    from: Option<C::Key>,
    keys: Vec<C::Key>,
  ) -> Result<ComposedResult<C::Key, C::Output>, ComputeError> {
    let mut seen = HashSet::new();
    let keys: Vec<C::Key> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();

    let mut results: Vec<Option<Result<C::Output, ComputeError>>> = vec![None; keys.len()];
    if let [only] = keys.as_slice() {
      results[0] = Some(self.request(from, only.clone()).await);
    } else {
      let mut set = JoinSet::new();
      for (index, key) in keys.iter().enumerate() {
        let fut = self.request(from.clone(), key.clone());
        set.spawn(async move { (index, fut.await) });
      }
      while let Some(joined) = set.join_next().await {
        match joined {
          Ok((index, result)) => results[index] = Some(result),
          Err(e) if e.is_cancelled() => return Err(ComputeError::Cancelled),
          Err(e) => return Err(ComputeError::msg(format!("computation task aborted: {e}"))),
        }
      }
    }

    let mut composed = ComposedResult::new();
    for (key, result) in keys.into_iter().zip(results) {
      match result {
        Some(Ok(value)) => composed.push(key, value),
        Some(Err(e)) => return Err(e),
        None => return Err(ComputeError::msg(format!("no result recorded for {key}"))),
      }
    }
    Ok(composed)
  }
}

/// Handle passed to [`Computation::compute`].
///
/// Gives access to resolved preliminary dependencies and lets the computation
/// request further keys; each request is recorded as a dependency edge.
pub struct ComputeEnv<C: Computation> {
  engine: GraphEngine<C>,
  key: C::Key,
  deps: ComposedResult<C::Key, C::Output>,
}

impl<C: Computation> ComputeEnv<C> {
  pub fn key(&self) -> &C::Key {
    &self.key
  }

  /// Result of a preliminary dependency.
  pub fn dep(&self, key: &C::Key) -> Option<&C::Output> {
    self.deps.get(key)
  }

  pub fn deps(&self) -> &ComposedResult<C::Key, C::Output> {
    &self.deps
  }

  /// Discover and compute a dependency while computing.
  pub async fn request(&self, key: C::Key) -> Result<C::Output, ComputeError> {
    self.engine.request(Some(self.key.clone()), key).await
  }

  /// Discover and compute several dependencies at once.
  pub async fn request_all(
    &self,
    keys: impl IntoIterator<Item = C::Key>,
  ) -> Result<ComposedResult<C::Key, C::Output>, ComputeError> {
    self
      .engine
      .compose_from(Some(self.key.clone()), keys.into_iter().collect())
      .await
  }
}
