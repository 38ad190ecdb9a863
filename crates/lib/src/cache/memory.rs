use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::rulekey::RuleKey;
use crate::util::{BoxFuture, ScopedRwLock};

use super::types::{Artifact, ArtifactCache, CacheError, CacheMode, CacheResult};

/// In-process artifact store. Counts every fetch and store it serves.
#[derive(Debug)]
pub struct MemoryArtifactCache {
  name: String,
  mode: CacheMode,
  entries: ScopedRwLock<HashMap<RuleKey, Artifact>>,
  fetches: AtomicUsize,
  stores: AtomicUsize,
}

impl MemoryArtifactCache {
  pub fn new(name: impl Into<String>, mode: CacheMode) -> Self {
    Self {
      name: name.into(),
      mode,
      entries: ScopedRwLock::default(),
      fetches: AtomicUsize::new(0),
      stores: AtomicUsize::new(0),
    }
  }

  pub fn insert(&self, key: RuleKey, artifact: Artifact) {
    self.entries.with_write(|e| e.insert(key, artifact));
  }

  pub fn contains(&self, key: &RuleKey) -> bool {
    self.entries.with_read(|e| e.contains_key(key))
  }

  pub fn len(&self) -> usize {
    self.entries.with_read(HashMap::len)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn fetch_count(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  pub fn store_count(&self) -> usize {
    self.stores.load(Ordering::SeqCst)
  }
}

impl ArtifactCache for MemoryArtifactCache {
  fn name(&self) -> &str {
    &self.name
  }

  fn mode(&self) -> CacheMode {
    self.mode
  }

  fn fetch<'a>(&'a self, key: &'a RuleKey) -> BoxFuture<'a, CacheResult> {
    Box::pin(async move {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      match self.entries.with_read(|e| e.get(key).cloned()) {
        Some(artifact) => CacheResult::Hit {
          artifact,
          source: self.name.clone(),
        },
        None => CacheResult::Miss,
      }
    })
  }

  fn store<'a>(&'a self, key: &'a RuleKey, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), CacheError>> {
    Box::pin(async move {
      self.stores.fetch_add(1, Ordering::SeqCst);
      self.insert(key.clone(), artifact.clone());
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::target::BuildTarget;

  #[tokio::test]
  async fn counts_fetches_and_stores() {
    let cache = MemoryArtifactCache::new("mem", CacheMode::Remote);
    let key = RuleKey::from_digest([9; 32]);
    let artifact = Artifact::new(BuildTarget::parse("//x:y").unwrap()).with_file("a", "b");

    assert_eq!(cache.fetch(&key).await, CacheResult::Miss);
    cache.store(&key, &artifact).await.unwrap();
    assert!(matches!(cache.fetch(&key).await, CacheResult::Hit { ref source, .. } if source == "mem"));

    assert_eq!(cache.fetch_count(), 2);
    assert_eq!(cache.store_count(), 1);
    assert_eq!(cache.mode(), CacheMode::Remote);
    assert!(cache.contains(&key));
  }
}
