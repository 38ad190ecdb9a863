//! Shared utilities.
//!
//! Content hashing, the scoped read/write lock, the cancellation flag and
//! the boxed future alias.

pub mod hash;
pub mod sync;

pub use sync::{BoxFuture, CancellationFlag, ScopedRwLock};
