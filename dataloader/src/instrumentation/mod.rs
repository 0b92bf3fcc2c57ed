//! Lifecycle observers for loads and batches.

mod chain;
mod logging;

pub use logging::LoggingInstrumentation;
pub(crate) use chain::InstrumentationChain;

use crate::batch_fn::{KeyContext, SharedBatchFn};
use crate::cell::LoadResult;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// State an observer attaches to one batch. Only the observer that created it
/// ever sees it.
pub type ObserverState = dyn Any + Send + Sync;

/// Invoked exactly once with the final outcome of a load that began with
/// `Instrumentation::begin_load`, along with the observer's batch state.
pub type OnCompleteLoad<V, E> = Box<dyn FnOnce(&LoadResult<V, E>, Option<&Arc<ObserverState>>) + Send>;

/// A trait for observing the lifecycle of loads and batches.
///
/// All methods have no-op defaults. Implementations are called from many
/// tasks at once and must not block. A panic inside any hook is caught,
/// logged and otherwise ignored; it never affects a load's result.
pub trait Instrumentation<K, V, E>: Send + Sync + 'static {
  /// Called once when a batch is opened. The returned state is handed back to
  /// this observer, and only this observer, by every other hook for the batch.
  fn create_batch_state(&self) -> Option<Arc<ObserverState>> {
    None
  }

  /// Called once for every load that missed the cache, after its key joined a
  /// batch. The returned callback runs once the load resolves.
  fn begin_load(
    &self,
    _key: &K,
    _key_context: Option<&KeyContext>,
    _batch_state: Option<&Arc<ObserverState>>,
  ) -> Option<OnCompleteLoad<V, E>> {
    None
  }

  /// Called once for every entry actually inserted into a batch.
  fn on_add_batch_entry(
    &self,
    _key: &K,
    _key_context: Option<&KeyContext>,
    _batch_state: Option<&Arc<ObserverState>>,
  ) {
  }

  /// Returns the fetch function to use for a batch, possibly wrapping `load`.
  fn instrument_batch_load(
    &self,
    load: SharedBatchFn<K, V, E>,
    _batch_state: Option<&Arc<ObserverState>>,
  ) -> SharedBatchFn<K, V, E> {
    load
  }
}

/// The composite per-batch state: one slot per registered observer, plus the
/// bookkeeping the loader itself keeps for a batch.
pub struct BatchState {
  id: u64,
  created_at: Instant,
  considered: AtomicUsize,
  observers: Vec<Option<Arc<ObserverState>>>,
}

impl BatchState {
  pub(crate) fn new(id: u64, observers: Vec<Option<Arc<ObserverState>>>) -> Self {
    Self {
      id,
      created_at: Instant::now(),
      considered: AtomicUsize::new(0),
      observers,
    }
  }

  /// A loader-unique, increasing batch number.
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn created_at(&self) -> Instant {
    self.created_at
  }

  pub(crate) fn observer(&self, index: usize) -> Option<&Arc<ObserverState>> {
    self.observers.get(index).and_then(|s| s.as_ref())
  }

  /// Records a cache hit that joined a pending entry of this batch.
  pub(crate) fn record_considered(&self) {
    self.considered.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn considered(&self) -> usize {
    self.considered.load(Ordering::Relaxed)
  }
}

impl fmt::Debug for BatchState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BatchState")
      .field("id", &self.id)
      .field("considered", &self.considered())
      .field("observers", &self.observers.len())
      .finish()
  }
}
