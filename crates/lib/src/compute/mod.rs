//! Generic memoized computation graph.
//!
//! A [`Computation`] maps keys to results; [`GraphEngine`] evaluates it with
//! at-most-once semantics per key, concurrent composition of sub-keys, and
//! cycle detection over dynamically discovered dependencies.

mod engine;
mod graph;
mod types;

pub use engine::{ComputeEnv, GraphEngine};
pub use types::{ComposedResult, ComputeError, ComputeKey, Computation};
