use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::rulekey::RuleKey;
use crate::target::BuildTarget;
use crate::util::BoxFuture;
use crate::util::hash::{ContentHash, hash_bytes, relative_slash_path};

/// The outputs of one rule, keyed by slash-separated path relative to the
/// rule's output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
  pub target: BuildTarget,
  pub files: BTreeMap<String, Vec<u8>>,
}

impl Artifact {
  pub fn new(target: BuildTarget) -> Self {
    Self {
      target,
      files: BTreeMap::new(),
    }
  }

  pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
    self.files.insert(path.into(), contents.into());
    self
  }

  /// Total bytes across all files.
  pub fn size(&self) -> u64 {
    self.files.values().map(|f| f.len() as u64).sum()
  }

  /// Deterministic hash over every path and its contents.
  pub fn output_hash(&self) -> ContentHash {
    let mut hasher = Sha256::new();
    for (path, contents) in &self.files {
      hasher.update(format!("F:{}:{}\n", path, hash_bytes(contents)).as_bytes());
    }
    ContentHash(hasher.finalize().into())
  }

  /// Read every regular file under `dir`, skipping names in `exclude`.
  pub fn collect(target: BuildTarget, dir: &Path, exclude: &[&str]) -> io::Result<Self> {
    let mut artifact = Self::new(target);
    let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
      e.depth() == 0 || e.file_name().to_str().map(|n| !exclude.contains(&n)).unwrap_or(true)
    });
    for entry in walker {
      let entry = entry.map_err(io::Error::other)?;
      if entry.file_type().is_file() {
        let rel = relative_slash_path(dir, entry.path());
        artifact.files.insert(rel, fs::read(entry.path())?);
      }
    }
    Ok(artifact)
  }

  /// Write the files into `dir`, which is emptied first.
  pub fn materialize(&self, dir: &Path) -> io::Result<()> {
    if dir.exists() {
      fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    for (rel, contents) in &self.files {
      let path = join_slash_path(dir, rel)?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::write(&path, contents)?;
    }
    Ok(())
  }
}

/// Join a slash path onto `base`, refusing anything that would escape it.
pub(crate) fn join_slash_path(base: &Path, rel: &str) -> io::Result<PathBuf> {
  let mut path = base.to_path_buf();
  for part in rel.split('/') {
    if part.is_empty() || part == "." || part == ".." || part.contains('\\') || part.contains(':') {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid artifact path: {rel}"),
      ));
    }
    path.push(part);
  }
  Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  Local,
  Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResult {
  Hit { artifact: Artifact, source: String },
  Miss,
  /// The backend could not answer. Callers treat this as a miss.
  Error(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache I/O error at {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to encode cache entry: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("cache request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("cache returned HTTP {status} for {url}")]
  Status { url: String, status: u16 },

  #[error("cache gave up after {attempts} attempts: {}", .messages.join("; "))]
  Exhausted { attempts: usize, messages: Vec<String> },
}

impl CacheError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
    CacheError::Io {
      path: path.into(),
      source,
    }
  }
}

/// Artifact store addressed by rule key.
pub trait ArtifactCache: Send + Sync {
  /// Short name reported as the hit source.
  fn name(&self) -> &str;

  fn mode(&self) -> CacheMode;

  fn fetch<'a>(&'a self, key: &'a RuleKey) -> BoxFuture<'a, CacheResult>;

  fn store<'a>(&'a self, key: &'a RuleKey, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), CacheError>>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn target() -> BuildTarget {
    BuildTarget::parse("//x:y").unwrap()
  }

  #[test]
  fn size_and_hash_cover_all_files() {
    let a = Artifact::new(target()).with_file("out.txt", "hello").with_file("sub/b", "xy");
    assert_eq!(a.size(), 7);

    let b = Artifact::new(target()).with_file("out.txt", "hello").with_file("sub/b", "xz");
    assert_ne!(a.output_hash(), b.output_hash());

    let renamed = Artifact::new(target()).with_file("out2.txt", "hello").with_file("sub/b", "xy");
    assert_ne!(a.output_hash(), renamed.output_hash());
  }

  #[test]
  fn collect_then_materialize_reproduces_tree() {
    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("sub")).unwrap();
    fs::write(src.path().join("out.txt"), "hello").unwrap();
    fs::write(src.path().join("sub/nested.txt"), "nested").unwrap();
    fs::write(src.path().join(".quarry-complete"), "{}").unwrap();

    let artifact = Artifact::collect(target(), src.path(), &[".quarry-complete"]).unwrap();
    assert_eq!(artifact.files.keys().collect::<Vec<_>>(), vec!["out.txt", "sub/nested.txt"]);

    let dst = TempDir::new().unwrap();
    let out = dst.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("stale"), "old").unwrap();

    artifact.materialize(&out).unwrap();
    assert_eq!(fs::read_to_string(out.join("sub/nested.txt")).unwrap(), "nested");
    assert!(!out.join("stale").exists());
  }

  #[test]
  fn escaping_paths_are_refused() {
    let dir = Path::new("/out");
    assert!(join_slash_path(dir, "../etc/passwd").is_err());
    assert!(join_slash_path(dir, "a//b").is_err());
    assert!(join_slash_path(dir, "a/b").is_ok());
  }
}
