//! How rules describe the inputs that make up their key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::target::BuildTarget;

/// A tool a rule runs.
///
/// `Binary` is produced by another rule in the graph, so its rule key feeds
/// into the dependent's key. `System` lives on the host and is identified by
/// its path and declared version only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tool {
  Binary { target: BuildTarget, path: String },
  System { path: PathBuf, version: String },
}

impl Tool {
  /// The command that invokes this tool once its producer has been built.
  pub fn command_prefix(&self, output_root: &Path) -> PathBuf {
    match self {
      Tool::Binary { target, path } => output_root.join(target.output_path()).join(path),
      Tool::System { path, .. } => path.clone(),
    }
  }

  pub fn producer(&self) -> Option<&BuildTarget> {
    match self {
      Tool::Binary { target, .. } => Some(target),
      Tool::System { .. } => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
  Value,
  File,
  Buildable,
  Tool,
}

impl FieldKind {
  pub fn as_str(self) -> &'static str {
    match self {
      FieldKind::Value => "value",
      FieldKind::File => "file",
      FieldKind::Buildable => "buildable",
      FieldKind::Tool => "tool",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
  Absent,
  Bool(bool),
  Number(serde_json::Number),
  String(String),
  List(Vec<FieldValue>),
  Map(BTreeMap<String, FieldValue>),
  /// Relative to the project root.
  File(PathBuf),
  Buildable(BuildTarget),
  Tool(Tool),
}

impl FieldValue {
  pub fn type_name(&self) -> &'static str {
    match self {
      FieldValue::Absent => "absent",
      FieldValue::Bool(_) => "bool",
      FieldValue::Number(_) => "number",
      FieldValue::String(_) => "string",
      FieldValue::List(_) => "list",
      FieldValue::Map(_) => "map",
      FieldValue::File(_) => "file",
      FieldValue::Buildable(_) => "buildable",
      FieldValue::Tool(_) => "tool",
    }
  }

  /// Whether this value may appear in a field declared as `kind`.
  ///
  /// Containers are checked element-wise; `Absent` fits everywhere.
  pub fn fits(&self, kind: FieldKind) -> bool {
    match self {
      FieldValue::Absent => true,
      FieldValue::List(items) => items.iter().all(|v| v.fits(kind)),
      FieldValue::Map(entries) => entries.values().all(|v| v.fits(kind)),
      FieldValue::File(_) => kind == FieldKind::File,
      FieldValue::Buildable(_) => kind == FieldKind::Buildable,
      FieldValue::Tool(_) => kind == FieldKind::Tool,
      FieldValue::Bool(_) | FieldValue::Number(_) | FieldValue::String(_) => kind == FieldKind::Value,
    }
  }

  /// Append every target this value references, depth first.
  pub fn collect_targets(&self, out: &mut Vec<BuildTarget>) {
    match self {
      FieldValue::Buildable(target) => out.push(target.clone()),
      FieldValue::Tool(tool) => out.extend(tool.producer().cloned()),
      FieldValue::List(items) => items.iter().for_each(|v| v.collect_targets(out)),
      FieldValue::Map(entries) => entries.values().for_each(|v| v.collect_targets(out)),
      _ => {}
    }
  }
}

impl From<serde_json::Value> for FieldValue {
  fn from(value: serde_json::Value) -> Self {
    match value {
      serde_json::Value::Null => FieldValue::Absent,
      serde_json::Value::Bool(b) => FieldValue::Bool(b),
      serde_json::Value::Number(n) => FieldValue::Number(n),
      serde_json::Value::String(s) => FieldValue::String(s),
      serde_json::Value::Array(items) => FieldValue::List(items.into_iter().map(Into::into).collect()),
      serde_json::Value::Object(map) => FieldValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
    }
  }
}

/// One key-contributing field of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
  pub name: &'static str,
  pub kind: FieldKind,
  pub value: FieldValue,
}

/// A rule as seen by the rule-key engine.
pub trait KeyedRule: Send + Sync {
  fn target(&self) -> &BuildTarget;

  fn rule_type(&self) -> &str;

  /// Key-contributing fields, in declaration order. Order is significant.
  fn key_fields(&self) -> Vec<Field>;

  /// Targets whose rule keys this rule's key depends on, deduplicated.
  fn key_dependencies(&self) -> Vec<BuildTarget> {
    let mut targets = Vec::new();
    for field in self.key_fields() {
      field.value.collect_targets(&mut targets);
    }
    let mut seen = std::collections::HashSet::new();
    targets.retain(|t| seen.insert(t.clone()));
    targets
  }
}

/// Statically declared field: name, kind and how to read it.
pub struct FieldDescriptor<R> {
  pub name: &'static str,
  pub kind: FieldKind,
  pub accessor: fn(&R) -> FieldValue,
}

/// Rules that declare their key fields up front as a static table.
pub trait DescribedRule: Sized + 'static {
  fn field_descriptors() -> &'static [FieldDescriptor<Self>];
}

/// Read every declared field of `rule` in table order.
pub fn described_fields<R: DescribedRule>(rule: &R) -> Vec<Field> {
  R::field_descriptors()
    .iter()
    .map(|d| Field {
      name: d.name,
      kind: d.kind,
      value: (d.accessor)(rule),
    })
    .collect()
}
