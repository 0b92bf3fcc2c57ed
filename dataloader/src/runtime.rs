use std::{future::Future, pin::Pin};

/// A type-erased, sendable unit of work handed to a `TaskSpawner`.
pub type SpawnedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A trait for spawning a future onto an asynchronous runtime.
///
/// The tick scheduler never runs futures itself; it wraps them for tracking
/// and hands them to the spawner it was built with.
pub trait TaskSpawner: Send + Sync + 'static {
  /// Spawns a type-erased future.
  fn spawn(&self, future: SpawnedTask);
}

#[cfg(feature = "tokio")]
#[derive(Clone)]
pub struct TokioSpawner(tokio::runtime::Handle);

#[cfg(feature = "tokio")]
impl TokioSpawner {
  /// Creates a spawner that uses the current Tokio runtime context.
  /// Panics if called outside of a Tokio runtime.
  pub fn new() -> Self {
    Self(tokio::runtime::Handle::current())
  }

  /// Creates a spawner bound to an explicit runtime handle.
  pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
    Self(handle)
  }

  /// Like `new`, but returns `None` instead of panicking outside a runtime.
  pub fn try_current() -> Option<Self> {
    tokio::runtime::Handle::try_current().ok().map(Self)
  }
}

#[cfg(feature = "tokio")]
impl TaskSpawner for TokioSpawner {
  fn spawn(&self, future: SpawnedTask) {
    self.0.spawn(future);
  }
}
