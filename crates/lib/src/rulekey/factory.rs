//! Rule key derivation.
//!
//! A key is built by feeding a typed hasher, in this order:
//! 1. the configuration seed and build version
//! 2. the rule type's module hash, when the strategy provides one
//! 3. every key field in declaration order
//!
//! Dependencies contribute their own rule key, never their contents. File
//! inputs contribute their content hash when at most `input_size_limit` bytes
//! and a `(path, size, mtime)` reference otherwise, so editing an oversized
//! input in place without touching its mtime does not change the key.

use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use crate::target::BuildTarget;
use crate::util::hash::relative_slash_path;

use super::config::RuleKeyConfiguration;
use super::fields::{FieldValue, KeyedRule, Tool};
use super::file_hash::FileHashCache;
use super::hasher::{ContainerKind, CountingRuleKeyHasher, RuleKeyHasher, Sha256RuleKeyHasher, WrapperKind};
use super::types::{RuleKey, RuleKeyError, RuleKeyLog};

#[derive(Debug, Clone)]
pub struct RuleKeyFactory {
  config: Arc<RuleKeyConfiguration>,
  files: Arc<FileHashCache>,
  diagnostics: bool,
}

impl RuleKeyFactory {
  pub fn new(config: Arc<RuleKeyConfiguration>, files: Arc<FileHashCache>) -> Self {
    Self {
      config,
      files,
      diagnostics: false,
    }
  }

  /// Retain a [`RuleKeyLog`] on every key built.
  pub fn with_diagnostics(mut self, enabled: bool) -> Self {
    self.diagnostics = enabled;
    self
  }

  pub fn config(&self) -> &RuleKeyConfiguration {
    &self.config
  }

  pub fn files(&self) -> &FileHashCache {
    &self.files
  }

  /// Derive the key of `rule`. `dep_key` must know the key of every target
  /// listed by [`KeyedRule::key_dependencies`].
  pub fn build(
    &self,
    rule: &dyn KeyedRule,
    dep_key: &dyn Fn(&BuildTarget) -> Option<RuleKey>,
  ) -> Result<RuleKey, RuleKeyError> {
    let mut builder = KeyBuilder {
      hasher: CountingRuleKeyHasher::new(Sha256RuleKeyHasher::new()),
      log: self.diagnostics.then(RuleKeyLog::default),
      target: rule.target(),
      factory: self,
      dep_key,
    };

    builder.hasher.put_key(".seed");
    builder.hasher.put_string(&self.config.seed);
    builder.record(".seed", &self.config.seed);
    builder.hasher.put_key(".version");
    builder.hasher.put_string(&self.config.build_version);
    builder.record(".version", &self.config.build_version);

    if let Some(module) = self.config.module_hash.module_hash(rule.rule_type()) {
      builder.hasher.put_key(".module");
      builder.hasher.put_bytes(module.as_bytes());
      builder.record(".module", &module.to_hex());
    }

    for field in rule.key_fields() {
      if !field.value.fits(field.kind) {
        return Err(RuleKeyError::FieldKind {
          target: rule.target().clone(),
          field: field.name,
          expected: field.kind.as_str(),
          found: field.value.type_name(),
        });
      }
      builder.hasher.put_key(field.name);
      let contribution = builder.fold(&field.value)?;
      builder.record(field.name, &contribution);
    }

    let puts = builder.hasher.count();
    let log = builder.log.take();
    let key = RuleKey::from_digest(builder.hasher.finish());
    trace!(target = %rule.target(), rule_key = %key, puts, "built rule key");

    Ok(match log {
      Some(log) => key.with_log(log),
      None => key,
    })
  }
}

struct KeyBuilder<'a, H> {
  hasher: H,
  log: Option<RuleKeyLog>,
  target: &'a BuildTarget,
  factory: &'a RuleKeyFactory,
  dep_key: &'a dyn Fn(&BuildTarget) -> Option<RuleKey>,
}

impl<H: RuleKeyHasher> KeyBuilder<'_, H> {
  fn record(&mut self, name: &str, contribution: &str) {
    if let Some(log) = &mut self.log {
      log.push(name, contribution);
    }
  }

  fn dependency_key(&self, dependency: &BuildTarget) -> Result<RuleKey, RuleKeyError> {
    (self.dep_key)(dependency).ok_or_else(|| RuleKeyError::MissingDependencyKey {
      target: self.target.clone(),
      dependency: dependency.clone(),
    })
  }

  /// Feed one value to the hasher and describe what it contributed.
  fn fold(&mut self, value: &FieldValue) -> Result<String, RuleKeyError> {
    Ok(match value {
      FieldValue::Absent => {
        self.hasher.put_null();
        "null".to_string()
      }
      FieldValue::Bool(b) => {
        self.hasher.put_bool(*b);
        b.to_string()
      }
      FieldValue::Number(n) => {
        self.hasher.put_number(n);
        n.to_string()
      }
      FieldValue::String(s) => {
        self.hasher.put_string(s);
        format!("{s:?}")
      }
      FieldValue::List(items) => {
        self.hasher.put_container(ContainerKind::List, items.len());
        let parts = items.iter().map(|v| self.fold(v)).collect::<Result<Vec<_>, _>>()?;
        format!("[{}]", parts.join(", "))
      }
      FieldValue::Map(entries) => {
        self.hasher.put_container(ContainerKind::Map, entries.len());
        let mut parts = Vec::with_capacity(entries.len());
        for (k, v) in entries {
          self.hasher.put_string(k);
          parts.push(format!("{k:?}: {}", self.fold(v)?));
        }
        format!("{{{}}}", parts.join(", "))
      }
      FieldValue::File(path) => self.fold_file(path)?,
      FieldValue::Buildable(dependency) => {
        let key = self.dependency_key(dependency)?;
        self.hasher.put_wrapper(WrapperKind::BuildRule);
        self.hasher.put_rule_key(&key);
        format!("{dependency}@{key}")
      }
      FieldValue::Tool(Tool::Binary { target, path }) => {
        let key = self.dependency_key(target)?;
        self.hasher.put_wrapper(WrapperKind::Tool);
        self.hasher.put_rule_key(&key);
        self.hasher.put_string(path);
        format!("tool {target}/{path}@{key}")
      }
      FieldValue::Tool(Tool::System { path, version }) => {
        let path = path.display().to_string();
        self.hasher.put_wrapper(WrapperKind::Tool);
        self.hasher.put_string(&path);
        self.hasher.put_string(version);
        format!("system {path} {version}")
      }
    })
  }

  fn fold_file(&mut self, path: &Path) -> Result<String, RuleKeyError> {
    if path.has_root() {
      return Err(RuleKeyError::NonRelativePath {
        target: self.target.clone(),
        path: path.to_path_buf(),
      });
    }

    let files = &self.factory.files;
    let name = relative_slash_path(Path::new(""), path);
    let stat = files.stat(path)?;

    if stat.is_dir || stat.size <= self.factory.config.input_size_limit {
      let hash = files.content_hash(path)?;
      self.hasher.put_path(&name, &hash);
      Ok(format!("{name}:{hash}"))
    } else {
      self.hasher.put_non_hashing_path(&name, stat.size, stat.mtime_nanos);
      Ok(format!("{name}@size={},mtime={}", stat.size, stat.mtime_nanos))
    }
  }
}
