//! Build engine: turns resolved rules into outputs.
//!
//! Per node the state machine is
//! `Pending -> ResolvingDeps -> CacheCheck -> {Done | Executing -> Done | Failed}`,
//! with `Failed` and `Cancelled` reachable from any non-terminal state when a
//! dependency fails or the build is interrupted.

mod build;
mod graph;
mod listener;
mod marker;
mod report;
mod types;

pub use build::BuildEngine;
pub use graph::ActionGraph;
pub use listener::{BuildListener, NoopListener};
pub use marker::{COMPLETE_MARKER, OutputMarker, read_marker};
pub use report::BuildReport;
pub use types::{
  BuildConfig, BuildContext, BuildEngineAction, BuildError, BuildRule, NodeOutcome, NodeState, RuleResolver,
  SuccessType,
};
