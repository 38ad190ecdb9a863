//! Per-build memo of input file hashes and metadata.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::trace;

use crate::util::ScopedRwLock;
use crate::util::hash::{ContentHash, hash_directory, hash_file};

use super::types::RuleKeyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
  pub size: u64,
  /// Nanoseconds relative to the Unix epoch; negative before it.
  pub mtime_nanos: i128,
  pub is_dir: bool,
}

/// Input paths are relative to `root`. Each path is read from disk at most
/// once per cache; call [`FileHashCache::invalidate`] after changing it.
#[derive(Debug)]
pub struct FileHashCache {
  root: PathBuf,
  stats: ScopedRwLock<HashMap<PathBuf, FileStat>>,
  hashes: ScopedRwLock<HashMap<PathBuf, ContentHash>>,
}

impl FileHashCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      stats: ScopedRwLock::default(),
      hashes: ScopedRwLock::default(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn stat(&self, rel: &Path) -> Result<FileStat, RuleKeyError> {
    if let Some(stat) = self.stats.with_read(|m| m.get(rel).copied()) {
      return Ok(stat);
    }

    let path = self.root.join(rel);
    let meta = fs::metadata(&path).map_err(|source| RuleKeyError::Stat {
      path: path.clone(),
      source,
    })?;
    let mtime_nanos = meta
      .modified()
      .ok()
      .map(|t| match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
      })
      .unwrap_or(0);
    let stat = FileStat {
      size: if meta.is_dir() { 0 } else { meta.len() },
      mtime_nanos,
      is_dir: meta.is_dir(),
    };

    self.stats.with_write(|m| m.insert(rel.to_path_buf(), stat));
    Ok(stat)
  }

  /// Content hash of a file, or the tree hash of a directory.
  pub fn content_hash(&self, rel: &Path) -> Result<ContentHash, RuleKeyError> {
    if let Some(hash) = self.hashes.with_read(|m| m.get(rel).copied()) {
      return Ok(hash);
    }

    let path = self.root.join(rel);
    let hash = if self.stat(rel)?.is_dir {
      hash_directory(&path, &[])?
    } else {
      hash_file(&path)?
    };
    trace!(path = %rel.display(), hash = %hash, "hashed input");

    self.hashes.with_write(|m| m.insert(rel.to_path_buf(), hash));
    Ok(hash)
  }

  pub fn invalidate(&self, rel: &Path) {
    self.stats.with_write(|m| m.remove(rel));
    self.hashes.with_write(|m| m.remove(rel));
  }
}
