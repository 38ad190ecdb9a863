use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Remote download telemetry, safe to update from any worker.
#[derive(Debug, Default)]
pub struct NetworkStats {
  downloads_started: AtomicU64,
  artifacts_downloaded: AtomicU64,
  bytes_downloaded: AtomicU64,
  download_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteDownloadStats {
  pub downloads_started: u64,
  pub artifacts_downloaded: u64,
  pub bytes_downloaded: u64,
  pub download_time: Duration,
}

impl NetworkStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn download_started(&self) {
    self.downloads_started.fetch_add(1, Ordering::Relaxed);
  }

  /// Count a finished remote request; `bytes` is `Some` on a hit.
  pub fn download_finished(&self, bytes: Option<u64>, elapsed: Duration) {
    if let Some(bytes) = bytes {
      self.artifacts_downloaded.fetch_add(1, Ordering::Relaxed);
      self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }
    let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    self.download_micros.fetch_add(micros, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> RemoteDownloadStats {
    RemoteDownloadStats {
      downloads_started: self.downloads_started.load(Ordering::Relaxed),
      artifacts_downloaded: self.artifacts_downloaded.load(Ordering::Relaxed),
      bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
      download_time: Duration::from_micros(self.download_micros.load(Ordering::Relaxed)),
    }
  }
}
