//! Artifact caches keyed by rule key.
//!
//! The build engine consults caches in the order given: local ones first,
//! then remote ones. Backend failures surface as [`CacheResult::Error`] and
//! are treated as misses by the engine.

mod dir;
mod http;
mod lock;
mod memory;
mod retry;
mod stats;
mod types;

pub use dir::DirArtifactCache;
pub use http::{HttpArtifactCache, WireArtifact};
pub use lock::{CacheLock, CacheLockError, LockMetadata, LockMode};
pub use memory::MemoryArtifactCache;
pub use retry::RetryingArtifactCache;
pub use stats::{NetworkStats, RemoteDownloadStats};
pub use types::{Artifact, ArtifactCache, CacheError, CacheMode, CacheResult};
pub(crate) use types::join_slash_path;
