//! Lock and future helpers shared by the engine, caches and counters.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A boxed, sendable future. Used where async trait methods must stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read/write lock whose guards are always released, including on error paths.
///
/// Readers share access, writers are exclusive. A panic while a guard is held
/// does not poison the lock for everyone else: the data is handed out as-is,
/// because every structure stored here is valid after each individual write.
#[derive(Debug, Default)]
pub struct ScopedRwLock<T> {
  inner: RwLock<T>,
}

impl<T> ScopedRwLock<T> {
  pub fn new(value: T) -> Self {
    Self {
      inner: RwLock::new(value),
    }
  }

  pub fn read(&self) -> RwLockReadGuard<'_, T> {
    self.inner.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn write(&self) -> RwLockWriteGuard<'_, T> {
    self.inner.write().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run `f` with shared access. The guard is dropped before returning.
  pub fn with_read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
    let guard = self.read();
    f(&guard)
  }

  /// Run `f` with exclusive access. The guard is dropped before returning.
  pub fn with_write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = self.write();
    f(&mut guard)
  }

  pub fn into_inner(self) -> T {
    self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Build-wide interrupt. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
  cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}
