use crate::batch::{DispatchShared, FailedDispatchFn};
use crate::batch_fn::{BatchFn, SharedBatchFn};
use crate::cache::{CacheKeyMatchFn, KeyedCache};
use crate::cell::ResultCell;
use crate::error::BuildError;
use crate::instrumentation::{Instrumentation, InstrumentationChain};
use crate::loader::{CacheKeyFn, DataLoader, LoaderShared};
use crate::metrics::Metrics;
use crate::options::{DispatchMode, LoaderOptions};
use crate::scheduler::TickScheduler;
use crate::strategy::Dispatcher;
use crate::TaskSpawner;

use core::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A builder for creating `DataLoader` instances.
pub struct DataLoaderBuilder<K, V, E, C = K> {
  batch_fn: SharedBatchFn<K, V, E>,
  options: LoaderOptions,
  cache_key_fn: CacheKeyFn<K, C>,
  cache_key_match_fn: Option<CacheKeyMatchFn<C>>,
  instrumentation: Vec<Arc<dyn Instrumentation<K, V, E>>>,
  scheduler: Option<TickScheduler>,
  spawner: Option<Arc<dyn TaskSpawner>>,
}

impl<K, V, E, C> fmt::Debug for DataLoaderBuilder<K, V, E, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DataLoaderBuilder")
      .field("options", &self.options)
      .field("has_cache_key_match_fn", &self.cache_key_match_fn.is_some())
      .field("instrumentation", &self.instrumentation.len())
      .field("has_scheduler", &self.scheduler.is_some())
      .field("has_spawner", &self.spawner.is_some())
      .finish_non_exhaustive()
  }
}

// --- Default Constructor ---
impl<K, V, E> DataLoaderBuilder<K, V, E, K>
where
  K: Clone + Send + Sync + 'static,
{
  /// Creates a builder with default settings, caching by the key itself.
  pub fn new(batch_fn: impl BatchFn<K, V, E>) -> Self {
    Self {
      batch_fn: Arc::new(batch_fn),
      options: LoaderOptions::default(),
      cache_key_fn: Arc::new(|key: &K| key.clone()),
      cache_key_match_fn: None,
      instrumentation: Vec::new(),
      scheduler: None,
      spawner: None,
    }
  }
}

// --- General Configuration Methods ---
impl<K, V, E, C> DataLoaderBuilder<K, V, E, C> {
  /// Sets the name reported in logs, metrics and tick metadata.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.options.name = name.into();
    self
  }

  /// Sets the maximum number of keys per batch. Defaults to 1000.
  pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
    self.options.max_batch_size = max_batch_size;
    self
  }

  pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
    self.options.dispatch_mode = mode;
    self
  }

  /// Sets how many existing entries a cache-key match function is offered
  /// per lookup. Defaults to 128.
  pub fn fuzzy_match_sample(mut self, sample: usize) -> Self {
    self.options.fuzzy_match_sample = sample;
    self
  }

  /// Sets the number of cache shards.
  pub fn shards(mut self, shards: usize) -> Self {
    // Ensure shards is at least 1 and a power of two for fast bitwise ANDing.
    self.options.shards = shards.max(1).next_power_of_two();
    self
  }

  /// Replaces every plain-data setting at once.
  pub fn options(mut self, options: LoaderOptions) -> Self {
    self.options = options;
    self
  }

  /// Sets an equivalence predicate `(new, existing)` over cache keys. A
  /// lookup binds to the first sampled existing entry it accepts.
  pub fn cache_key_match_fn<F>(mut self, f: F) -> Self
  where
    F: Fn(&C, &C) -> bool + Send + Sync + 'static,
  {
    self.cache_key_match_fn = Some(Arc::new(f));
    self
  }

  /// Registers an observer. Observers are called in registration order.
  pub fn instrumentation<I>(mut self, instrumentation: I) -> Self
  where
    I: Instrumentation<K, V, E>,
  {
    self.instrumentation.push(Arc::new(instrumentation));
    self
  }

  /// Dispatches on an existing scheduler. Loaders that share a scheduler
  /// share its ticks, so loads made while resolving another loader's batch
  /// are coalesced too.
  pub fn scheduler(mut self, scheduler: TickScheduler) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  /// Creates a dedicated scheduler on `spawner`. Ignored if `scheduler` is set.
  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  /// Caches results under `f(key)` instead of the key itself.
  ///
  /// Any cache-key match function set so far is discarded, since it was
  /// written for the previous cache-key type.
  pub fn cache_key_fn<C2, F>(self, f: F) -> DataLoaderBuilder<K, V, E, C2>
  where
    F: Fn(&K) -> C2 + Send + Sync + 'static,
  {
    DataLoaderBuilder {
      batch_fn: self.batch_fn,
      options: self.options,
      cache_key_fn: Arc::new(f),
      cache_key_match_fn: None,
      instrumentation: self.instrumentation,
      scheduler: self.scheduler,
      spawner: self.spawner,
    }
  }
}

// --- Build Methods ---
impl<K, V, E, C> DataLoaderBuilder<K, V, E, C>
where
  K: Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Send + Sync + 'static,
  C: Eq + Hash + Send + Sync + 'static,
{
  /// Builds the loader.
  ///
  /// Without an explicit scheduler or spawner, the `tokio` feature creates a
  /// scheduler on the current Tokio runtime.
  pub fn build(self) -> Result<DataLoader<K, V, E, C>, BuildError> {
    self.options.validate()?;
    let scheduler = self.resolve_scheduler()?;

    let name: Arc<str> = Arc::from(self.options.name.as_str());
    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(KeyedCache::new(
      self.options.shards.max(1).next_power_of_two(),
      self.cache_key_match_fn,
      self.options.fuzzy_match_sample,
    ));

    // Evicts the keys of a batch that failed as a whole, so they are retried.
    let on_failed: FailedDispatchFn<K, V, E> = {
      let cache = cache.clone();
      let cache_key_fn = self.cache_key_fn.clone();
      let metrics = metrics.clone();
      Arc::new(move |keys: &[K], cells: &[Arc<ResultCell<V, E>>]| {
        let evicted = keys
          .iter()
          .zip(cells)
          .filter(|(key, cell)| cache.evict_cell(&cache_key_fn(key), cell))
          .count();
        metrics
          .invalidations
          .fetch_add(evicted as u64, Ordering::Relaxed);
      })
    };

    let dispatch = Arc::new(DispatchShared {
      name: name.clone(),
      fetch: self.batch_fn,
      instrumentation: InstrumentationChain::new(self.instrumentation),
      metrics: metrics.clone(),
      on_failed,
    });
    let dispatcher = Dispatcher::new(
      self.options.dispatch_mode,
      self.options.max_batch_size,
      dispatch.clone(),
      scheduler.clone(),
    );

    tracing::debug!(
      loader = %name,
      mode = ?self.options.dispatch_mode,
      max_batch_size = self.options.max_batch_size,
      scheduler = scheduler.name(),
      "Built data loader."
    );

    Ok(DataLoader {
      shared: Arc::new(LoaderShared {
        name,
        cache,
        cache_key_fn: self.cache_key_fn,
        dispatch,
        dispatcher,
        metrics,
        scheduler,
      }),
    })
  }

  fn resolve_scheduler(&self) -> Result<TickScheduler, BuildError> {
    if let Some(scheduler) = &self.scheduler {
      return Ok(scheduler.clone());
    }
    let name = format!("{}-scheduler", self.options.name);
    if let Some(spawner) = &self.spawner {
      return Ok(TickScheduler::named(name, spawner.clone()));
    }

    #[cfg(feature = "tokio")]
    {
      if let Some(spawner) = crate::runtime::TokioSpawner::try_current() {
        return Ok(TickScheduler::named(name, Arc::new(spawner)));
      }
    }
    Err(BuildError::SpawnerRequired)
  }
}
