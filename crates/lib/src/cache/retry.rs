use std::sync::Arc;

use tracing::debug;

use crate::rulekey::RuleKey;
use crate::util::BoxFuture;

use super::types::{Artifact, ArtifactCache, CacheError, CacheMode, CacheResult};

/// Retries failed operations on an inner cache.
///
/// Hits and misses return immediately. Once every attempt has failed, the
/// messages of all attempts are reported together.
pub struct RetryingArtifactCache {
  inner: Arc<dyn ArtifactCache>,
  attempts: usize,
}

impl RetryingArtifactCache {
  pub fn new(inner: Arc<dyn ArtifactCache>, attempts: usize) -> Self {
    Self {
      inner,
      attempts: attempts.max(1),
    }
  }
}

impl ArtifactCache for RetryingArtifactCache {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn mode(&self) -> CacheMode {
    self.inner.mode()
  }

  fn fetch<'a>(&'a self, key: &'a RuleKey) -> BoxFuture<'a, CacheResult> {
    Box::pin(async move {
      let mut messages = Vec::new();
      for attempt in 1..=self.attempts {
        match self.inner.fetch(key).await {
          CacheResult::Error(message) => {
            debug!(cache = self.inner.name(), rule_key = %key, attempt, error = %message, "cache fetch failed");
            messages.push(message);
          }
          result => return result,
        }
      }
      CacheResult::Error(format!(
        "{} attempts failed: {}",
        self.attempts,
        messages.join("; ")
      ))
    })
  }

  fn store<'a>(&'a self, key: &'a RuleKey, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), CacheError>> {
    Box::pin(async move {
      let mut messages = Vec::new();
      for attempt in 1..=self.attempts {
        match self.inner.store(key, artifact).await {
          Ok(()) => return Ok(()),
          Err(e) => {
            debug!(cache = self.inner.name(), rule_key = %key, attempt, error = %e, "cache store failed");
            messages.push(e.to_string());
          }
        }
      }
      Err(CacheError::Exhausted {
        attempts: self.attempts,
        messages,
      })
    })
  }
}
