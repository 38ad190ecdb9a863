//! Local on-disk artifact cache.
//!
//! Layout: `<root>/<shard>/<rulekey>/` holding `files/...` and an
//! `artifact.json` manifest. Entries are assembled in a staging directory
//! next to their final location, the manifest is written last, and the
//! staging directory is renamed into place. A reader that finds a manifest
//! therefore finds a complete entry; anything else is treated as a miss and
//! removed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rulekey::RuleKey;
use crate::target::BuildTarget;
use crate::util::BoxFuture;
use crate::util::hash::ContentHash;

use super::types::{Artifact, ArtifactCache, CacheError, CacheMode, CacheResult, join_slash_path};

const MANIFEST_FILE: &str = "artifact.json";
const FILES_DIR: &str = "files";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Serialize, Deserialize)]
struct EntryManifest {
  version: u32,
  target: BuildTarget,
  rule_key: RuleKey,
  output_hash: ContentHash,
  files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DirArtifactCache {
  root: PathBuf,
}

impl DirArtifactCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn entry_dir(&self, key: &RuleKey) -> PathBuf {
    self.root.join(key.shard()).join(key.to_hex())
  }

  /// Remove every entry. Non-entry files in the root (such as the lock) stay.
  pub fn clear(&self) -> Result<usize, CacheError> {
    let mut removed = 0;
    let Ok(shards) = fs::read_dir(&self.root) else {
      return Ok(0);
    };
    for shard in shards {
      let shard = shard.map_err(|e| CacheError::io(&self.root, e))?;
      let path = shard.path();
      if !path.is_dir() {
        continue;
      }
      removed += fs::read_dir(&path).map(|entries| entries.count()).unwrap_or(0);
      fs::remove_dir_all(&path).map_err(|e| CacheError::io(&path, e))?;
    }
    debug!(root = %self.root.display(), removed, "cleared local cache");
    Ok(removed)
  }

  fn read_entry(&self, key: &RuleKey, dir: &Path) -> Result<Artifact, String> {
    let content = fs::read_to_string(dir.join(MANIFEST_FILE)).map_err(|e| e.to_string())?;
    let manifest: EntryManifest = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    if manifest.rule_key != *key {
      return Err(format!("manifest is for rule key {}", manifest.rule_key));
    }

    let files_dir = dir.join(FILES_DIR);
    let mut artifact = Artifact::new(manifest.target);
    for rel in manifest.files {
      let path = join_slash_path(&files_dir, &rel).map_err(|e| e.to_string())?;
      let contents = fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))?;
      artifact.files.insert(rel, contents);
    }

    if artifact.output_hash() != manifest.output_hash {
      return Err("output hash mismatch".to_string());
    }
    Ok(artifact)
  }

  fn write_entry(&self, key: &RuleKey, artifact: &Artifact) -> Result<(), CacheError> {
    let dir = self.entry_dir(key);
    if dir.join(MANIFEST_FILE).exists() {
      return Ok(());
    }

    let shard = self.root.join(key.shard());
    fs::create_dir_all(&shard).map_err(|e| CacheError::io(&shard, e))?;
    let staging = tempfile::Builder::new()
      .prefix(STAGING_PREFIX)
      .tempdir_in(&shard)
      .map_err(|e| CacheError::io(&shard, e))?;

    let files_dir = staging.path().join(FILES_DIR);
    for (rel, contents) in &artifact.files {
      let path = join_slash_path(&files_dir, rel).map_err(|e| CacheError::io(&files_dir, e))?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
      }
      fs::write(&path, contents).map_err(|e| CacheError::io(&path, e))?;
    }

    let manifest = EntryManifest {
      version: 1,
      target: artifact.target.clone(),
      rule_key: key.clone(),
      output_hash: artifact.output_hash(),
      files: artifact.files.keys().cloned().collect(),
    };
    let manifest_path = staging.path().join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?).map_err(|e| CacheError::io(&manifest_path, e))?;

    if let Err(e) = fs::rename(staging.path(), &dir) {
      // Lost a race with another writer of the same key.
      if dir.join(MANIFEST_FILE).exists() {
        return Ok(());
      }
      if dir.exists() {
        fs::remove_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        fs::rename(staging.path(), &dir).map_err(|e| CacheError::io(&dir, e))?;
      } else {
        return Err(CacheError::io(&dir, e));
      }
    }

    debug!(rule_key = %key, target = %artifact.target, bytes = artifact.size(), "stored artifact");
    Ok(())
  }
}

impl ArtifactCache for DirArtifactCache {
  fn name(&self) -> &str {
    "dir"
  }

  fn mode(&self) -> CacheMode {
    CacheMode::Local
  }

  fn fetch<'a>(&'a self, key: &'a RuleKey) -> BoxFuture<'a, CacheResult> {
    Box::pin(async move {
      let dir = self.entry_dir(key);
      if !dir.exists() {
        return CacheResult::Miss;
      }

      match self.read_entry(key, &dir) {
        Ok(artifact) => CacheResult::Hit {
          artifact,
          source: self.name().to_string(),
        },
        Err(reason) => {
          warn!(rule_key = %key, reason = %reason, "corrupt cache entry, removing");
          if let Err(e) = fs::remove_dir_all(&dir) {
            return CacheResult::Error(format!("failed to remove corrupt entry {}: {e}", dir.display()));
          }
          CacheResult::Miss
        }
      }
    })
  }

  fn store<'a>(&'a self, key: &'a RuleKey, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), CacheError>> {
    Box::pin(async move { self.write_entry(key, artifact) })
  }
}
