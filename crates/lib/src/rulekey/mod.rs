//! Rule keys: stable content digests of a rule's full transitive definition.
//!
//! A rule key covers the configuration seed and build version, the rule's
//! declared fields, file contents (or references, past the size limit) and
//! the rule keys of everything it depends on. Equal keys mean the outputs are
//! interchangeable, which is what makes the artifact caches safe to share.

mod computation;
mod config;
mod factory;
mod fields;
mod file_hash;
mod hasher;
mod types;

pub use computation::{RuleIndex, RuleKeyComputation};
pub use config::{
  DEFAULT_INPUT_SIZE_LIMIT, DefaultModuleHashStrategy, ModuleHashStrategy, NoopModuleHashStrategy,
  RuleKeyConfiguration,
};
pub use factory::RuleKeyFactory;
pub use fields::{DescribedRule, Field, FieldDescriptor, FieldKind, FieldValue, KeyedRule, Tool, described_fields};
pub use file_hash::{FileHashCache, FileStat};
pub use hasher::{ContainerKind, CountingRuleKeyHasher, RuleKeyHasher, Sha256RuleKeyHasher, WrapperKind};
pub use types::{RuleKey, RuleKeyError, RuleKeyLog};
