use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::engine::BuildRule;
use crate::rulekey::{DescribedRule, Field, FieldDescriptor, FieldKind, FieldValue, KeyedRule, Tool, described_fields};
use crate::step::Step;
use crate::target::BuildTarget;

use super::resolver::ManifestResolver;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read build file {}: {source}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid build file {}: {source}", .path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("target {0} is declared more than once")]
  DuplicateTarget(BuildTarget),

  #[error("{target}: rule type must not be empty")]
  EmptyType { target: BuildTarget },

  #[error("{target}: source {path} must be a relative path inside the project")]
  InvalidSource { target: BuildTarget, path: String },

  #[error("{target}: tool name {name:?} must be non-empty and use only letters, digits and '_'")]
  InvalidToolName { target: BuildTarget, name: String },
}

/// One rule as written in the build file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDef {
  pub name: BuildTarget,
  #[serde(rename = "type")]
  pub rule_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub srcs: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deps: Option<Vec<BuildTarget>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tools: Option<BTreeMap<String, Tool>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub args: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub steps: Option<Vec<Step>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBuildFile {
  rules: Vec<RuleDef>,
}

/// A validated rule, ready for keying and building.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRule {
  def: RuleDef,
}

impl ManifestRule {
  pub fn def(&self) -> &RuleDef {
    &self.def
  }

  fn validate(&self) -> Result<(), ManifestError> {
    let target = &self.def.name;
    if self.def.rule_type.trim().is_empty() {
      return Err(ManifestError::EmptyType { target: target.clone() });
    }
    for src in self.def.srcs.iter().flatten() {
      if !is_project_relative(src) {
        return Err(ManifestError::InvalidSource {
          target: target.clone(),
          path: src.clone(),
        });
      }
    }
    for name in self.def.tools.iter().flat_map(BTreeMap::keys) {
      if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ManifestError::InvalidToolName {
          target: target.clone(),
          name: name.clone(),
        });
      }
    }
    Ok(())
  }
}

fn is_project_relative(path: &str) -> bool {
  !path.is_empty()
    && Path::new(path)
      .components()
      .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn list_value<T>(items: &Option<Vec<T>>, f: impl Fn(&T) -> FieldValue) -> FieldValue {
  match items {
    Some(items) => FieldValue::List(items.iter().map(f).collect()),
    None => FieldValue::Absent,
  }
}

fn step_value(step: &Step) -> FieldValue {
  let mut map = BTreeMap::new();
  match step {
    Step::Cmd { cmd, env, cwd } => {
      map.insert("kind".to_string(), FieldValue::String("cmd".to_string()));
      map.insert("cmd".to_string(), FieldValue::String(cmd.clone()));
      map.insert(
        "env".to_string(),
        FieldValue::Map(env.iter().map(|(k, v)| (k.clone(), FieldValue::String(v.clone()))).collect()),
      );
      map.insert(
        "cwd".to_string(),
        cwd.clone().map(FieldValue::String).unwrap_or(FieldValue::Absent),
      );
    }
    Step::WriteFile { path, content } => {
      map.insert("kind".to_string(), FieldValue::String("write_file".to_string()));
      map.insert("path".to_string(), FieldValue::String(path.clone()));
      map.insert("content".to_string(), FieldValue::String(content.clone()));
    }
  }
  FieldValue::Map(map)
}

impl DescribedRule for ManifestRule {
  fn field_descriptors() -> &'static [FieldDescriptor<Self>] {
    const FIELDS: &[FieldDescriptor<ManifestRule>] = &[
      FieldDescriptor {
        name: "type",
        kind: FieldKind::Value,
        accessor: |r| FieldValue::String(r.def.rule_type.clone()),
      },
      FieldDescriptor {
        name: "srcs",
        kind: FieldKind::File,
        accessor: |r| list_value(&r.def.srcs, |s| FieldValue::File(PathBuf::from(s))),
      },
      FieldDescriptor {
        name: "deps",
        kind: FieldKind::Buildable,
        accessor: |r| list_value(&r.def.deps, |d| FieldValue::Buildable(d.clone())),
      },
      FieldDescriptor {
        name: "tools",
        kind: FieldKind::Tool,
        accessor: |r| match &r.def.tools {
          Some(tools) => FieldValue::Map(
            tools
              .iter()
              .map(|(name, tool)| (name.clone(), FieldValue::Tool(tool.clone())))
              .collect(),
          ),
          None => FieldValue::Absent,
        },
      },
      FieldDescriptor {
        name: "args",
        kind: FieldKind::Value,
        accessor: |r| r.def.args.clone().map(FieldValue::from).unwrap_or(FieldValue::Absent),
      },
      FieldDescriptor {
        name: "steps",
        kind: FieldKind::Value,
        accessor: |r| list_value(&r.def.steps, step_value),
      },
    ];
    FIELDS
  }
}

impl KeyedRule for ManifestRule {
  fn target(&self) -> &BuildTarget {
    &self.def.name
  }

  fn rule_type(&self) -> &str {
    &self.def.rule_type
  }

  fn key_fields(&self) -> Vec<Field> {
    described_fields(self)
  }
}

impl BuildRule for ManifestRule {
  fn steps(&self) -> &[Step] {
    self.def.steps.as_deref().unwrap_or_default()
  }

  fn tools(&self) -> BTreeMap<String, Tool> {
    self.def.tools.clone().unwrap_or_default()
  }
}

/// A loaded and validated build file.
#[derive(Debug, Clone)]
pub struct BuildFile {
  project_root: PathBuf,
  rules: Vec<Arc<ManifestRule>>,
}

impl BuildFile {
  /// Read `path`; its directory becomes the project root.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let parent = match path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent,
      _ => Path::new("."),
    };
    let project_root = dunce::canonicalize(parent).map_err(|source| ManifestError::Read {
      path: parent.to_path_buf(),
      source,
    })?;
    let file = Self::parse(&content, project_root).map_err(|err| match err {
      ManifestError::Parse { source, .. } => ManifestError::Parse {
        path: path.to_path_buf(),
        source,
      },
      other => other,
    })?;
    debug!(path = ?path, rules = file.rules.len(), "loaded build file");
    Ok(file)
  }

  pub fn parse(content: &str, project_root: impl Into<PathBuf>) -> Result<Self, ManifestError> {
    let raw: RawBuildFile = serde_json::from_str(content).map_err(|source| ManifestError::Parse {
      path: PathBuf::from("<memory>"),
      source,
    })?;

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(raw.rules.len());
    for def in raw.rules {
      if !seen.insert(def.name.clone()) {
        return Err(ManifestError::DuplicateTarget(def.name));
      }
      let rule = ManifestRule { def };
      rule.validate()?;
      rules.push(Arc::new(rule));
    }

    Ok(Self {
      project_root: project_root.into(),
      rules,
    })
  }

  pub fn project_root(&self) -> &Path {
    &self.project_root
  }

  /// Rules in file order.
  pub fn rules(&self) -> &[Arc<ManifestRule>] {
    &self.rules
  }

  pub fn rule(&self, target: &BuildTarget) -> Option<&Arc<ManifestRule>> {
    self.rules.iter().find(|r| r.target() == target)
  }

  pub fn resolver(&self) -> ManifestResolver {
    ManifestResolver::new(self.rules.iter().cloned())
  }
}
