//! quarry-lib: the core of the quarry build tool.
//!
//! - [`compute`]: a generic, memoizing, concurrent computation graph
//! - [`rulekey`]: content-hash rule keys derived from a rule's full definition
//! - [`engine`]: the scheduler that checks caches by rule key and runs steps
//! - [`cache`]: local and remote artifact stores
//! - [`manifest`]: JSON build files
//! - [`step`]: the execution boundary
//! - [`counters`]: build telemetry

pub mod cache;
pub mod compute;
pub mod counters;
pub mod engine;
pub mod manifest;
pub mod rulekey;
pub mod step;
pub mod target;
pub mod util;
