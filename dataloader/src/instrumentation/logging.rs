use super::{Instrumentation, ObserverState, OnCompleteLoad};
use crate::batch_fn::{BatchEnvironment, BatchFn, FetchResult, KeyContext, SharedBatchFn};
use crate::cell::LoadResult;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt};

/// An observer that reports batch sizes and latencies through `tracing`.
///
/// Each batch is logged at `debug` once its fetch finishes, with the time it
/// spent waiting to be scheduled and the time its fetch took. Individual
/// loads are logged at `trace`.
#[derive(Debug, Clone)]
pub struct LoggingInstrumentation {
  name: Arc<str>,
}

impl LoggingInstrumentation {
  pub fn new(name: impl Into<Arc<str>>) -> Self {
    Self { name: name.into() }
  }
}

impl Default for LoggingInstrumentation {
  fn default() -> Self {
    Self::new("dataloader")
  }
}

struct BatchStats {
  opened_at: Instant,
  entries: AtomicUsize,
}

fn stats(state: Option<&Arc<ObserverState>>) -> Option<&BatchStats> {
  state.and_then(|s| s.downcast_ref::<BatchStats>())
}

/// The fetch function wrapper that times one batch.
struct Timed<K, V, E> {
  name: Arc<str>,
  opened_at: Option<Instant>,
  inner: SharedBatchFn<K, V, E>,
}

impl<K, V, E> BatchFn<K, V, E> for Timed<K, V, E>
where
  K: Send + 'static,
  V: Send + 'static,
  E: Send + 'static,
{
  fn load(&self, keys: Vec<K>, env: BatchEnvironment) -> BoxFuture<'static, FetchResult<V, E>> {
    let started = Instant::now();
    let batch_size = keys.len();
    let total_keys = env.total_key_count;
    let tick = env.dispatch_context.tick().map(|t| t.index);
    let scheduled_us = self
      .opened_at
      .map(|opened| started.duration_since(opened).as_micros() as u64);
    let name = self.name.clone();
    let fetch = self.inner.load(keys, env);

    async move {
      let result = fetch.await;
      let failed = match &result {
        Ok(values) => values.iter().filter(|v| v.is_err()).count(),
        Err(_) => batch_size,
      };
      tracing::debug!(
        loader = %name,
        batch_size,
        total_keys,
        tick,
        scheduled_us,
        fetch_us = started.elapsed().as_micros() as u64,
        failed,
        "Batch fetch finished."
      );
      result
    }
    .boxed()
  }
}

impl<K, V, E> Instrumentation<K, V, E> for LoggingInstrumentation
where
  K: Send + 'static,
  V: Send + 'static,
  E: Send + 'static,
{
  fn create_batch_state(&self) -> Option<Arc<ObserverState>> {
    Some(Arc::new(BatchStats {
      opened_at: Instant::now(),
      entries: AtomicUsize::new(0),
    }))
  }

  fn begin_load(
    &self,
    _key: &K,
    _key_context: Option<&KeyContext>,
    _batch_state: Option<&Arc<ObserverState>>,
  ) -> Option<OnCompleteLoad<V, E>> {
    let name = self.name.clone();
    let began = Instant::now();
    Some(Box::new(move |result: &LoadResult<V, E>, _state: Option<&Arc<ObserverState>>| {
      tracing::trace!(
        loader = %name,
        ok = result.is_ok(),
        latency_us = began.elapsed().as_micros() as u64,
        "Load completed."
      );
    }))
  }

  fn on_add_batch_entry(
    &self,
    _key: &K,
    _key_context: Option<&KeyContext>,
    batch_state: Option<&Arc<ObserverState>>,
  ) {
    if let Some(stats) = stats(batch_state) {
      stats.entries.fetch_add(1, Ordering::Relaxed);
    }
  }

  fn instrument_batch_load(
    &self,
    load: SharedBatchFn<K, V, E>,
    batch_state: Option<&Arc<ObserverState>>,
  ) -> SharedBatchFn<K, V, E> {
    let opened_at = stats(batch_state).map(|s| s.opened_at);
    if let Some(stats) = stats(batch_state) {
      tracing::trace!(
        loader = %self.name,
        entries = stats.entries.load(Ordering::Relaxed),
        "Instrumenting batch fetch."
      );
    }
    Arc::new(Timed {
      name: self.name.clone(),
      opened_at,
      inner: load,
    })
  }
}
