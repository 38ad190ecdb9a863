//! JSON build files.
//!
//! A build file lists rules under `rules`; each rule names a target, a rule
//! type, its sources, dependencies, tools, free-form arguments and the steps
//! that produce its outputs. The directory holding the file is the project
//! root that every source path is relative to.

mod resolver;
mod types;

pub use resolver::ManifestResolver;
pub use types::{BuildFile, ManifestError, ManifestRule, RuleDef};
