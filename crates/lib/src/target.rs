//! Build target names of the form `//package:name`.

use std::fmt;
use std::path::PathBuf;

/// Wraps the rule name in the last segment of an output path. Package
/// segments may not start with it, so no output dir nests inside another.
const OUTPUT_NAME_AFFIX: &str = "__";
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid target '{target}': {reason}")]
pub struct TargetParseError {
  pub target: String,
  pub reason: &'static str,
}

/// A fully qualified build target.
///
/// The package may be empty (`//:root`). Targets order by package, then name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BuildTarget {
  package: String,
  name: String,
}

impl BuildTarget {
  pub fn parse(s: &str) -> Result<Self, TargetParseError> {
    let invalid = |reason| TargetParseError {
      target: s.to_string(),
      reason,
    };

    let rest = s.strip_prefix("//").ok_or_else(|| invalid("must start with '//'"))?;
    let (package, name) = rest.split_once(':').ok_or_else(|| invalid("missing ':'"))?;

    if name.is_empty() {
      return Err(invalid("empty rule name"));
    }
    if name.contains([':', '/', '\\']) {
      return Err(invalid("rule name must not contain ':', '/' or '\\'"));
    }
    if name == "." || name == ".." {
      return Err(invalid("rule name must not be '.' or '..'"));
    }
    if package.starts_with('/') || package.ends_with('/') || package.contains("//") || package.contains('\\') {
      return Err(invalid("malformed package path"));
    }
    if package.split('/').any(|part| part == "." || part == "..") {
      return Err(invalid("package must not contain '.' or '..'"));
    }
    if package.split('/').any(|part| part.starts_with(OUTPUT_NAME_AFFIX)) {
      return Err(invalid("package segments must not start with '__'"));
    }
    if s.chars().any(char::is_whitespace) {
      return Err(invalid("whitespace is not allowed"));
    }

    Ok(Self {
      package: package.to_string(),
      name: name.to_string(),
    })
  }

  pub fn package(&self) -> &str {
    &self.package
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Relative directory that holds this target's outputs:
  /// `package/__name__`.
  ///
  /// Every component is a plain name, and the output dirs of two distinct
  /// targets never contain one another: `//a:b` lands in `a/__b__` while
  /// `//a/b:c` lands in `a/b/__c__`.
  pub fn output_path(&self) -> PathBuf {
    let mut path = PathBuf::new();
    for part in self.package.split('/').filter(|p| !p.is_empty()) {
      path.push(part);
    }
    path.push(format!("{OUTPUT_NAME_AFFIX}{}{OUTPUT_NAME_AFFIX}", self.name));
    path
  }
}

impl fmt::Display for BuildTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "//{}:{}", self.package, self.name)
  }
}

impl FromStr for BuildTarget {
  type Err = TargetParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl From<BuildTarget> for String {
  fn from(target: BuildTarget) -> Self {
    target.to_string()
  }
}

impl TryFrom<String> for BuildTarget {
  type Error = TargetParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}
