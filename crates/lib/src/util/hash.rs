//! Content hashing for rule keys, artifacts and output verification.
//!
//! Everything here is SHA-256:
//! - `hash_bytes()`: arbitrary bytes
//! - `hash_file()`: streaming hash of a single file
//! - `hash_directory()`: deterministic hash of a directory tree

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A full SHA-256 digest of some content.
///
/// Displayed and serialized as 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl From<ContentHash> for String {
  fn from(hash: ContentHash) -> Self {
    hash.to_hex()
  }
}

impl TryFrom<String> for ContentHash {
  type Error = hex::FromHexError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(value, &mut out)?;
    Ok(ContentHash(out))
  }
}

/// Error while hashing files on disk.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
  #[error("failed to walk directory {path}: {message}")]
  WalkDir { path: String, message: String },

  #[error("failed to read file {path}: {source}")]
  ReadFile {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to read symlink {path}: {source}")]
  ReadSymlink {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(Sha256::digest(data).into())
}

/// Hash a file's contents without loading it into memory.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let read_err = |source| HashError::ReadFile {
    path: path.display().to_string(),
    source,
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let n = file.read(&mut buffer).map_err(read_err)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(ContentHash(hasher.finalize().into()))
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers relative paths, file contents, directory structure and
/// symlink targets. Timestamps and permissions are ignored. Entries whose file
/// name appears in `exclude` are skipped together with everything below them.
pub fn hash_directory(root: &Path, exclude: &[&str]) -> Result<ContentHash, HashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
    e.depth() == 0
      || e
        .file_name()
        .to_str()
        .map(|name| !exclude.contains(&name))
        .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| HashError::WalkDir {
      path: root.display().to_string(),
      message: e.to_string(),
    })?;
    if entry.depth() == 0 {
      continue;
    }

    let path = entry.path();
    let rel = relative_slash_path(root, path);

    let file_type = entry.file_type();
    let line = if file_type.is_symlink() {
      let target = fs::read_link(path).map_err(|source| HashError::ReadSymlink {
        path: path.display().to_string(),
        source,
      })?;
      format!("L:{}:{}", rel, hash_bytes(target.to_string_lossy().as_bytes()))
    } else if file_type.is_file() {
      format!("F:{}:{}", rel, hash_file(path)?)
    } else if file_type.is_dir() {
      format!("D:{}", rel)
    } else {
      // sockets, devices
      continue;
    };

    entries.push((rel, line));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, line) in entries {
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hasher.finalize().into()))
}

/// Render `path` relative to `root` with forward slashes, so the same tree
/// hashes identically on every platform.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
  let rel = path.strip_prefix(root).unwrap_or(path);
  rel
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}
