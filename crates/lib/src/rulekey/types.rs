use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::target::BuildTarget;
use crate::util::hash::HashError;

/// Content digest identifying a rule's complete, transitive definition.
///
/// Equality and hashing consider only the digest. The optional log records
/// what went into it and is carried along for diagnostics.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RuleKey {
  digest: [u8; 32],
  log: Option<Arc<RuleKeyLog>>,
}

impl RuleKey {
  pub fn from_digest(digest: [u8; 32]) -> Self {
    Self { digest, log: None }
  }

  pub(crate) fn with_log(mut self, log: RuleKeyLog) -> Self {
    self.log = Some(Arc::new(log));
    self
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.digest
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.digest)
  }

  /// First two hex characters, used to shard cache directories.
  pub fn shard(&self) -> String {
    hex::encode(&self.digest[..1])
  }

  pub fn log(&self) -> Option<&RuleKeyLog> {
    self.log.as_deref()
  }
}

impl PartialEq for RuleKey {
  fn eq(&self, other: &Self) -> bool {
    self.digest == other.digest
  }
}

impl Eq for RuleKey {}

impl std::hash::Hash for RuleKey {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.digest.hash(state);
  }
}

impl fmt::Debug for RuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "RuleKey({})", self.to_hex())
  }
}

impl fmt::Display for RuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl From<RuleKey> for String {
  fn from(key: RuleKey) -> Self {
    key.to_hex()
  }
}

impl TryFrom<String> for RuleKey {
  type Error = hex::FromHexError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    let mut digest = [0u8; 32];
    hex::decode_to_slice(value, &mut digest)?;
    Ok(Self::from_digest(digest))
  }
}

/// Ordered `(field, contribution)` pairs that produced a rule key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleKeyLog {
  entries: Vec<(String, String)>,
}

impl RuleKeyLog {
  pub(crate) fn push(&mut self, name: impl Into<String>, contribution: impl Into<String>) {
    self.entries.push((name.into(), contribution.into()));
  }

  pub fn entries(&self) -> &[(String, String)] {
    &self.entries
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, c)| c.as_str())
  }

  pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
    self.entries.iter().map(|(n, c)| format!("{n}={c}"))
  }
}

#[derive(Debug, Error)]
pub enum RuleKeyError {
  #[error("{target}: dependency {dependency} has no rule key")]
  MissingDependencyKey { target: BuildTarget, dependency: BuildTarget },

  #[error("{target}: file input {} must be relative to the project root", .path.display())]
  NonRelativePath { target: BuildTarget, path: PathBuf },

  #[error("{target}: field '{field}' declared as {expected} but holds {found}")]
  FieldKind {
    target: BuildTarget,
    field: &'static str,
    expected: &'static str,
    found: &'static str,
  },

  #[error("failed to stat {}: {source}", .path.display())]
  Stat {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("no rule for target {0}")]
  UnknownTarget(BuildTarget),
}
