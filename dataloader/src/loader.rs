use crate::batch::{BatchEntry, DispatchShared};
use crate::batch_fn::{BatchFn, KeyContext};
use crate::builder::DataLoaderBuilder;
use crate::cache::{KeyedCache, Lookup};
use crate::cell::LoadResult;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::options::DispatchMode;
use crate::scheduler::TickScheduler;
use crate::strategy::Dispatcher;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::future::join_all;

/// Maps a caller-facing key to the key results are cached under.
pub type CacheKeyFn<K, C> = Arc<dyn Fn(&K) -> C + Send + Sync>;

/// The shared core behind every clone of a `DataLoader`.
pub(crate) struct LoaderShared<K, V, E, C> {
  pub(crate) name: Arc<str>,
  pub(crate) cache: Arc<KeyedCache<C, V, E>>,
  pub(crate) cache_key_fn: CacheKeyFn<K, C>,
  pub(crate) dispatch: Arc<DispatchShared<K, V, E>>,
  pub(crate) dispatcher: Dispatcher<K, V, E>,
  pub(crate) metrics: Arc<Metrics>,
  pub(crate) scheduler: TickScheduler,
}

/// A batching, de-duplicating loader.
///
/// Concurrent loads of keys that map to the same cache key share one fetch.
/// Distinct keys requested while other tracked work is still running are
/// coalesced into batches, which are fetched once the loader's
/// [`TickScheduler`] observes that all tracked work has parked.
///
/// Loads must run inside tasks spawned through the loader's scheduler for
/// their keys to be coalesced with each other; a load from anywhere else
/// still works but is flushed as soon as nothing tracked is running.
///
/// Cloning a loader is cheap; all clones share the same cache and batches.
pub struct DataLoader<K, V, E, C = K> {
  pub(crate) shared: Arc<LoaderShared<K, V, E, C>>,
}

impl<K, V, E, C> Clone for DataLoader<K, V, E, C> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<K, V, E> DataLoader<K, V, E, K>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  /// Starts building a loader around `batch_fn`.
  pub fn builder(batch_fn: impl BatchFn<K, V, E>) -> DataLoaderBuilder<K, V, E, K> {
    DataLoaderBuilder::new(batch_fn)
  }
}

impl<K, V, E, C> DataLoader<K, V, E, C>
where
  K: Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Send + Sync + 'static,
  C: Eq + Hash + Send + Sync + 'static,
{
  /// Loads the value for `key`.
  ///
  /// Fails with the fetch function's error if this key (or its whole batch)
  /// failed. A whole-batch failure evicts the key, so a later load retries.
  pub async fn load(&self, key: K) -> LoadResult<V, E> {
    self.load_with_context(key, None).await
  }

  /// Like `load`, forwarding `key_context` to the fetch function. The context
  /// plays no part in caching; a cache hit ignores it.
  pub async fn load_with_context(
    &self,
    key: K,
    key_context: Option<KeyContext>,
  ) -> LoadResult<V, E> {
    let shared = &self.shared;
    let cache_key = (shared.cache_key_fn)(&key);

    let cell = match shared.cache.get_or_create(cache_key) {
      Lookup::Hit { cell, fuzzy } => {
        shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
        if fuzzy {
          shared.metrics.fuzzy_hits.fetch_add(1, Ordering::Relaxed);
        }
        if cell.is_pending() {
          if let Some(state) = cell.try_batch_state() {
            state.record_considered();
          }
        }
        return cell.result().await;
      }
      Lookup::Created(cell) => cell,
    };

    shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
    shared.dispatcher.schedule_result(BatchEntry {
      key: key.clone(),
      key_context: key_context.clone(),
      cell: cell.clone(),
    });

    if !shared.dispatch.instrumentation.is_empty() {
      let state = cell.batch_state().await;
      let completion = shared
        .dispatch
        .instrumentation
        .begin_load(&key, key_context.as_ref(), state);
      // Attached to the cell, so it fires even if this caller stops waiting.
      cell.on_resolve(move |result| completion.complete(result));
    }

    cell.result().await
  }

  /// Loads every key concurrently. Results are in the same order as `keys`.
  pub async fn load_many<I>(&self, keys: I) -> Vec<LoadResult<V, E>>
  where
    I: IntoIterator<Item = K>,
  {
    join_all(keys.into_iter().map(|key| self.load(key))).await
  }

  /// Like `load_many`, pairing each key with the context at the same index.
  /// Keys beyond the end of `key_contexts` load without a context.
  pub async fn load_many_with_contexts<I>(
    &self,
    keys: I,
    key_contexts: Vec<Option<KeyContext>>,
  ) -> Vec<LoadResult<V, E>>
  where
    I: IntoIterator<Item = K>,
  {
    let mut contexts = key_contexts.into_iter();
    let loads = keys
      .into_iter()
      .map(|key| self.load_with_context(key, contexts.next().flatten()))
      .collect::<Vec<_>>();
    join_all(loads).await
  }

  /// Removes the cached result for `key`. Returns `true` if there was one.
  ///
  /// Callers already waiting on the removed entry still receive its result.
  pub fn clear(&self, key: &K) -> bool {
    let removed = self.shared.cache.remove(&(self.shared.cache_key_fn)(key));
    if removed {
      self.shared.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
    }
    removed
  }

  /// Removes every cached result, returning how many were removed.
  pub fn clear_all(&self) -> usize {
    let removed = self.shared.cache.clear();
    self
      .shared
      .metrics
      .invalidations
      .fetch_add(removed as u64, Ordering::Relaxed);
    tracing::debug!(loader = %self.shared.name, removed, "Cleared loader cache.");
    removed
  }

  /// The number of cached entries, pending or resolved.
  pub fn cached_entries(&self) -> usize {
    self.shared.cache.len()
  }

  pub fn dispatch_mode(&self) -> DispatchMode {
    self.shared.dispatcher.mode()
  }
}

impl<K, V, E, C> DataLoader<K, V, E, C> {
  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// The scheduler this loader dispatches batches on. Spawn work through it
  /// so that loads from that work are coalesced.
  pub fn scheduler(&self) -> &TickScheduler {
    &self.shared.scheduler
  }

  /// Returns a point-in-time snapshot of the loader's metrics.
  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }
}

impl<K, V, E, C> fmt::Debug for DataLoader<K, V, E, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DataLoader")
      .field("name", &self.shared.name)
      .field("scheduler", &self.shared.scheduler)
      .field("metrics", &self.shared.metrics.snapshot())
      .finish_non_exhaustive()
  }
}
