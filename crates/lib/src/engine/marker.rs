//! Completion marker inside each output dir.
//!
//! The marker is written last, after every output file. It records the rule
//! key the outputs belong to and a hash of the outputs, so a later build can
//! reuse the directory only when both still match.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rulekey::RuleKey;
use crate::step::TMP_DIR_NAME;
use crate::util::hash::{ContentHash, hash_directory};

use super::types::BuildError;

pub const COMPLETE_MARKER: &str = ".quarry-complete";

/// Names never treated as outputs.
pub const OUTPUT_EXCLUSIONS: &[&str] = &[COMPLETE_MARKER, TMP_DIR_NAME];

const MARKER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMarker {
  pub version: u32,
  pub target: String,
  pub rule_key: RuleKey,
  pub output_hash: ContentHash,
}

/// Hash `dir` and record it under `rule_key`.
pub fn write_marker(dir: &Path, target: &str, rule_key: &RuleKey) -> Result<OutputMarker, BuildError> {
  let output_hash = hash_directory(dir, OUTPUT_EXCLUSIONS).map_err(|e| BuildError::io(dir, e))?;
  let marker = OutputMarker {
    version: MARKER_VERSION,
    target: target.to_string(),
    rule_key: rule_key.clone(),
    output_hash,
  };
  let content = serde_json::to_string(&marker).map_err(|e| BuildError::io(dir, e))?;
  let path = dir.join(COMPLETE_MARKER);
  std::fs::write(&path, format!("{content}\n")).map_err(|e| BuildError::io(&path, e))?;
  Ok(marker)
}

/// `None` when there is no readable marker.
pub fn read_marker(dir: &Path) -> Option<OutputMarker> {
  let content = std::fs::read_to_string(dir.join(COMPLETE_MARKER)).ok()?;
  match serde_json::from_str(&content) {
    Ok(marker) => Some(marker),
    Err(e) => {
      debug!(path = ?dir, error = %e, "unreadable completion marker");
      None
    }
  }
}

/// True when `dir` holds complete, untouched outputs for `rule_key`.
pub fn matches_rule_key(dir: &Path, rule_key: &RuleKey) -> bool {
  let Some(marker) = read_marker(dir) else {
    return false;
  };
  if marker.version != MARKER_VERSION || marker.rule_key != *rule_key {
    debug!(path = ?dir, recorded = %marker.rule_key, current = %rule_key, "rule key changed");
    return false;
  }

  match hash_directory(dir, OUTPUT_EXCLUSIONS) {
    Ok(current) if current == marker.output_hash => true,
    Ok(current) => {
      warn!(
        path = ?dir,
        expected = %marker.output_hash,
        actual = %current,
        "outputs modified since they were built, will rebuild"
      );
      false
    }
    Err(e) => {
      warn!(path = ?dir, error = %e, "failed to hash outputs, will rebuild");
      false
    }
  }
}
