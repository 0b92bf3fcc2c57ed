use crate::batch_fn::{BatchEnvironment, DispatchContext, KeyContext, SharedBatchFn};
use crate::cell::ResultCell;
use crate::error::{panic_message, LoadError};
use crate::instrumentation::{BatchState, InstrumentationChain};
use crate::metrics::Metrics;

use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

/// Called with the keys and cells of a batch that failed as a whole, before
/// any of its waiters are woken.
pub(crate) type FailedDispatchFn<K, V, E> = Arc<dyn Fn(&[K], &[Arc<ResultCell<V, E>>]) + Send + Sync>;

/// Everything a batch needs from its loader in order to dispatch itself.
pub(crate) struct DispatchShared<K, V, E> {
  pub(crate) name: Arc<str>,
  pub(crate) fetch: SharedBatchFn<K, V, E>,
  pub(crate) instrumentation: InstrumentationChain<K, V, E>,
  pub(crate) metrics: Arc<Metrics>,
  pub(crate) on_failed: FailedDispatchFn<K, V, E>,
}

/// One pending load: the key, its caller-supplied context and the cell the
/// result will be written to.
pub(crate) struct BatchEntry<K, V, E> {
  pub(crate) key: K,
  pub(crate) key_context: Option<KeyContext>,
  pub(crate) cell: Arc<ResultCell<V, E>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
  Open,
  Dispatching,
  Dispatched,
}

struct BatchInner<K, V, E> {
  entries: Vec<BatchEntry<K, V, E>>,
  phase: Phase,
}

/// A size-bounded group of entries that is fetched with a single call.
///
/// A batch accepts entries only while it is open and below capacity. It is
/// dispatched at most once; the phase flip and entry adds are serialized by
/// the batch's own mutex.
pub(crate) struct Batch<K, V, E> {
  inner: Mutex<BatchInner<K, V, E>>,
  max_size: usize,
  state: Arc<BatchState>,
  shared: Arc<DispatchShared<K, V, E>>,
}

impl<K, V, E> Batch<K, V, E>
where
  K: Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  pub(crate) fn new(id: u64, max_size: usize, shared: Arc<DispatchShared<K, V, E>>) -> Self {
    Self {
      inner: Mutex::new(BatchInner {
        entries: Vec::with_capacity(max_size.min(64)),
        phase: Phase::Open,
      }),
      max_size,
      state: shared.instrumentation.create_batch_state(id),
      shared,
    }
  }

  pub(crate) fn id(&self) -> u64 {
    self.state.id()
  }

  pub(crate) fn phase(&self) -> Phase {
    self.inner.lock().phase
  }

  pub(crate) fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  /// Creates a batch of size one that already holds `entry`.
  pub(crate) fn single(id: u64, shared: Arc<DispatchShared<K, V, E>>, entry: BatchEntry<K, V, E>) -> Self {
    let batch = Self::new(id, 1, shared);
    batch.push(&mut batch.inner.lock(), entry);
    batch
  }

  /// Adds `entry` if the batch is still open and has room. A rejected entry
  /// is handed back so the caller can place it in a fresh batch.
  pub(crate) fn add(&self, entry: BatchEntry<K, V, E>) -> Result<(), BatchEntry<K, V, E>> {
    let mut inner = self.inner.lock();
    if inner.phase != Phase::Open || inner.entries.len() >= self.max_size {
      return Err(entry);
    }
    self.push(&mut inner, entry);
    Ok(())
  }

  fn push(&self, inner: &mut BatchInner<K, V, E>, entry: BatchEntry<K, V, E>) {
    entry.cell.assign_batch_state(self.state.clone());
    self
      .shared
      .instrumentation
      .on_add_batch_entry(&entry.key, entry.key_context.as_ref(), &self.state);
    inner.entries.push(entry);
    tracing::trace!(
      loader = %self.shared.name,
      batch = self.state.id(),
      size = inner.entries.len(),
      "Added entry to batch."
    );
  }

  /// Closes the batch and returns the future that fetches and resolves it.
  ///
  /// The phase flip happens before this returns, so no entry can be added
  /// once `dispatch` has been called. Calling it again is a no-op.
  pub(crate) fn dispatch(self: &Arc<Self>, context: DispatchContext) -> BoxFuture<'static, ()> {
    let (pending, key_contexts) = {
      let mut inner = self.inner.lock();
      if inner.phase != Phase::Open {
        return future::ready(()).boxed();
      }
      if inner.entries.is_empty() {
        inner.phase = Phase::Dispatched;
        return future::ready(()).boxed();
      }
      inner.phase = Phase::Dispatching;
      let entries = mem::take(&mut inner.entries);
      let mut key_contexts = Vec::with_capacity(entries.len());
      let mut pending = InFlight {
        keys: Vec::with_capacity(entries.len()),
        cells: Vec::with_capacity(entries.len()),
        shared: self.shared.clone(),
      };
      for entry in entries {
        pending.keys.push(entry.key);
        key_contexts.push(entry.key_context);
        pending.cells.push(entry.cell);
      }
      (pending, key_contexts)
    };

    // Dropping the future before it resolves drops `pending`, which fails and
    // evicts the batch.
    let batch = self.clone();
    async move {
      batch.fetch_and_resolve(pending, key_contexts, context).await;
      batch.inner.lock().phase = Phase::Dispatched;
    }
    .boxed()
  }

  async fn fetch_and_resolve(
    &self,
    mut pending: InFlight<K, V, E>,
    key_contexts: Vec<Option<KeyContext>>,
    context: DispatchContext,
  ) {
    let size = pending.cells.len();
    let env = BatchEnvironment {
      key_contexts,
      total_key_count: size + self.state.considered(),
      dispatch_context: context,
    };
    tracing::debug!(
      loader = %self.shared.name,
      batch = self.state.id(),
      size,
      total_keys = env.total_key_count,
      tick = env.dispatch_context.tick().map(|t| t.index),
      "Dispatching batch."
    );
    self.shared.metrics.record_dispatch(size);

    let fetch = self
      .shared
      .instrumentation
      .instrument_batch_load(self.shared.fetch.clone(), &self.state);
    let keys = pending.keys.clone();
    let outcome = AssertUnwindSafe(async move { fetch.load(keys, env).await })
      .catch_unwind()
      .await;

    match outcome {
      Ok(Ok(values)) => {
        if values.len() != size {
          tracing::warn!(
            loader = %self.shared.name,
            batch = self.state.id(),
            expected = size,
            received = values.len(),
            "Fetch function returned a result list of the wrong length."
          );
        }
        let mut values = values.into_iter();
        for cell in &pending.cells {
          match values.next() {
            Some(Ok(value)) => cell.complete(Arc::new(value)),
            Some(Err(e)) => cell.fail(LoadError::Fetch(Arc::new(e))),
            None => cell.fail(LoadError::MissingValue),
          };
        }
      }
      Ok(Err(e)) => {
        tracing::warn!(
          loader = %self.shared.name,
          batch = self.state.id(),
          size,
          "Batch fetch failed; evicting its keys."
        );
        pending.fail_all(LoadError::Dispatch(Arc::new(e)));
      }
      Err(payload) => {
        let message = panic_message(payload.as_ref());
        tracing::warn!(
          loader = %self.shared.name,
          batch = self.state.id(),
          size,
          panic = %message,
          "Batch fetch panicked; evicting its keys."
        );
        pending.fail_all(LoadError::Panicked(message));
      }
    }
  }
}

impl<K, V, E> Drop for Batch<K, V, E> {
  fn drop(&mut self) {
    let inner = self.inner.get_mut();
    if inner.phase != Phase::Open || inner.entries.is_empty() {
      return;
    }
    tracing::debug!(
      loader = %self.shared.name,
      batch = self.state.id(),
      size = inner.entries.len(),
      "Dropping undispatched batch."
    );
    let mut abandoned = InFlight {
      keys: Vec::with_capacity(inner.entries.len()),
      cells: Vec::with_capacity(inner.entries.len()),
      shared: self.shared.clone(),
    };
    for entry in inner.entries.drain(..) {
      abandoned.keys.push(entry.key);
      abandoned.cells.push(entry.cell);
    }
    // `InFlight`'s drop fails the cells and reports the keys.
  }
}

/// The keys and cells of a batch whose fetch has started but not resolved.
///
/// If it is dropped with any cell still pending (the fetch future was
/// cancelled or never polled, or the batch was never dispatched), those cells
/// fail with `LoadError::Abandoned` and the batch is reported as failed.
struct InFlight<K, V, E> {
  keys: Vec<K>,
  cells: Vec<Arc<ResultCell<V, E>>>,
  shared: Arc<DispatchShared<K, V, E>>,
}

impl<K, V, E> InFlight<K, V, E> {
  fn fail_all(&mut self, error: LoadError<E>) {
    // Evict first, so a waiter that retries on wake-up misses the cache.
    (self.shared.on_failed)(&self.keys, &self.cells);
    self.shared.metrics.record_failed_dispatch(self.cells.len());
    for cell in &self.cells {
      cell.fail(error.clone());
    }
  }
}

impl<K, V, E> Drop for InFlight<K, V, E> {
  fn drop(&mut self) {
    if self.cells.iter().any(|c| c.is_pending()) {
      self.fail_all(LoadError::Abandoned);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::sync::atomic::{AtomicUsize, Ordering};

  use parking_lot::Mutex as PlMutex;

  type Shared = Arc<DispatchShared<u32, String, String>>;

  fn shared<F>(fetch: F, failed: Arc<PlMutex<Vec<u32>>>) -> Shared
  where
    F: crate::batch_fn::BatchFn<u32, String, String>,
  {
    Arc::new(DispatchShared {
      name: Arc::from("test"),
      fetch: Arc::new(fetch),
      instrumentation: InstrumentationChain::new(Vec::new()),
      metrics: Arc::new(Metrics::new()),
      on_failed: Arc::new(move |keys: &[u32], _cells: &[Arc<ResultCell<String, String>>]| {
        failed.lock().extend_from_slice(keys)
      }),
    })
  }

  fn entry(key: u32) -> (BatchEntry<u32, String, String>, Arc<ResultCell<String, String>>) {
    let cell = Arc::new(ResultCell::new());
    (
      BatchEntry {
        key,
        key_context: None,
        cell: cell.clone(),
      },
      cell,
    )
  }

  fn echo(calls: Arc<AtomicUsize>) -> impl crate::batch_fn::BatchFn<u32, String, String> {
    move |keys: Vec<u32>, _env: BatchEnvironment| {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        Ok::<_, String>(
          keys
            .into_iter()
            .map(|k| Ok::<_, String>(format!("v{k}")))
            .collect::<Vec<_>>(),
        )
      }
    }
  }

  #[tokio::test]
  async fn rejects_entries_past_capacity_and_after_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let batch = Arc::new(Batch::new(1, 2, shared(echo(calls.clone()), Default::default())));

    assert!(batch.add(entry(1).0).is_ok());
    assert!(batch.add(entry(2).0).is_ok());
    let rejected = batch.add(entry(3).0).unwrap_err();
    assert_eq!(rejected.key, 3);

    let fut = batch.dispatch(DispatchContext::Immediate);
    assert_eq!(batch.phase(), Phase::Dispatching);
    assert_eq!(batch.add(entry(4).0).unwrap_err().key, 4);
    fut.await;
    assert_eq!(batch.phase(), Phase::Dispatched);

    // A second dispatch is a no-op.
    batch.dispatch(DispatchContext::Immediate).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn short_result_list_fails_trailing_entries() {
    let fetch = |_keys: Vec<u32>, _env: BatchEnvironment| async move {
      Ok::<_, String>(vec![Ok::<_, String>("only".to_string())])
    };
    let batch = Arc::new(Batch::new(1, 10, shared(fetch, Default::default())));
    let (a, cell_a) = entry(1);
    let (b, cell_b) = entry(2);
    batch.add(a).ok();
    batch.add(b).ok();
    batch.dispatch(DispatchContext::Immediate).await;

    assert_eq!(*cell_a.result().await.unwrap(), "only");
    assert!(matches!(cell_b.result().await, Err(LoadError::MissingValue)));
  }

  #[tokio::test]
  async fn whole_batch_failure_fails_every_entry_and_reports_keys() {
    let failed = Arc::new(PlMutex::new(Vec::new()));
    let fetch = |_keys: Vec<u32>, _env: BatchEnvironment| async move {
      Err::<Vec<Result<String, String>>, _>("io".to_string())
    };
    let batch = Arc::new(Batch::new(1, 10, shared(fetch, failed.clone())));
    let (a, cell_a) = entry(1);
    let (b, cell_b) = entry(2);
    batch.add(a).ok();
    batch.add(b).ok();
    batch.dispatch(DispatchContext::Immediate).await;

    for cell in [cell_a, cell_b] {
      let err = cell.result().await.unwrap_err();
      assert!(matches!(err, LoadError::Dispatch(_)));
      assert_eq!(err.fetch_error().unwrap(), "io");
    }
    assert_eq!(*failed.lock(), vec![1, 2]);
  }

  #[tokio::test]
  async fn panicking_fetch_is_a_batch_failure() {
    let failed = Arc::new(PlMutex::new(Vec::new()));
    let fetch = |_keys: Vec<u32>, _env: BatchEnvironment| async move {
      if true {
        panic!("fetch exploded");
      }
      Ok::<Vec<Result<String, String>>, String>(Vec::new())
    };
    let batch = Arc::new(Batch::new(1, 10, shared(fetch, failed.clone())));
    let (a, cell) = entry(9);
    batch.add(a).ok();
    batch.dispatch(DispatchContext::Immediate).await;

    match cell.result().await {
      Err(LoadError::Panicked(msg)) => assert_eq!(&*msg, "fetch exploded"),
      other => panic!("unexpected outcome: {:?}", other.map(|v| v.to_string())),
    }
    assert_eq!(*failed.lock(), vec![9]);
  }

  #[tokio::test]
  async fn dropping_an_open_batch_abandons_its_entries() {
    let failed = Arc::new(PlMutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let batch = Batch::new(1, 10, shared(echo(calls.clone()), failed.clone()));
    let (a, cell) = entry(5);
    batch.add(a).ok();
    assert_eq!(batch.len(), 1);
    drop(batch);

    assert!(matches!(cell.result().await, Err(LoadError::Abandoned)));
    assert_eq!(*failed.lock(), vec![5]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn dropping_an_unpolled_dispatch_abandons_its_entries() {
    let failed = Arc::new(PlMutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let batch = Arc::new(Batch::new(1, 10, shared(echo(calls.clone()), failed.clone())));
    let (a, cell) = entry(6);
    batch.add(a).ok();

    // 1. The dispatch future is dropped without ever being polled.
    drop(batch.dispatch(DispatchContext::Immediate));

    // 2. The entry fails and is reported, and the fetch never runs.
    assert!(matches!(cell.result().await, Err(LoadError::Abandoned)));
    assert_eq!(*failed.lock(), vec![6]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(batch.phase(), Phase::Dispatching);
  }

  #[tokio::test]
  async fn single_batch_holds_its_entry_and_is_full() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (a, cell) = entry(8);
    let batch = Arc::new(Batch::single(3, shared(echo(calls.clone()), Default::default()), a));

    // 1. The entry is in place and sees the batch's state, with no room left.
    assert_eq!(batch.len(), 1);
    assert_eq!(cell.try_batch_state().map(|s| s.id()), Some(3));
    assert_eq!(batch.add(entry(9).0).unwrap_err().key, 9);

    // 2. Dispatch fetches it on its own.
    batch.dispatch(DispatchContext::Immediate).await;
    assert_eq!(*cell.result().await.unwrap(), "v8");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
