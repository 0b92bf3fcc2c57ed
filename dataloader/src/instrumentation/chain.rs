use super::{BatchState, Instrumentation, OnCompleteLoad};
use crate::batch_fn::{KeyContext, SharedBatchFn};
use crate::cell::LoadResult;
use crate::error::panic_message;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Runs `hook` for one observer, swallowing and logging a panic.
fn isolate<T>(hook: &'static str, observer: usize, f: impl FnOnce() -> T) -> Option<T> {
  match panic::catch_unwind(AssertUnwindSafe(f)) {
    Ok(value) => Some(value),
    Err(payload) => {
      tracing::warn!(
        hook,
        observer,
        panic = %panic_message(payload.as_ref()),
        "Instrumentation hook panicked; skipping observer."
      );
      None
    }
  }
}

/// Fans every lifecycle event out to a list of observers, in registration
/// order, isolating each observer from the others' panics.
pub(crate) struct InstrumentationChain<K, V, E> {
  observers: Vec<Arc<dyn Instrumentation<K, V, E>>>,
}

impl<K, V, E> InstrumentationChain<K, V, E>
where
  K: 'static,
  V: 'static,
  E: 'static,
{
  pub(crate) fn new(observers: Vec<Arc<dyn Instrumentation<K, V, E>>>) -> Self {
    Self { observers }
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.observers.is_empty()
  }

  /// Builds the composite state for a new batch.
  pub(crate) fn create_batch_state(&self, batch_id: u64) -> Arc<BatchState> {
    let states = self
      .observers
      .iter()
      .enumerate()
      .map(|(i, obs)| isolate("create_batch_state", i, || obs.create_batch_state()).flatten())
      .collect();
    Arc::new(BatchState::new(batch_id, states))
  }

  pub(crate) fn on_add_batch_entry(
    &self,
    key: &K,
    key_context: Option<&KeyContext>,
    state: &BatchState,
  ) {
    for (i, obs) in self.observers.iter().enumerate() {
      isolate("on_add_batch_entry", i, || {
        obs.on_add_batch_entry(key, key_context, state.observer(i))
      });
    }
  }

  pub(crate) fn begin_load(
    &self,
    key: &K,
    key_context: Option<&KeyContext>,
    state: Arc<BatchState>,
  ) -> LoadCompletion<V, E> {
    let callbacks = self
      .observers
      .iter()
      .enumerate()
      .filter_map(|(i, obs)| {
        isolate("begin_load", i, || obs.begin_load(key, key_context, state.observer(i)))
          .flatten()
          .map(|cb| (i, cb))
      })
      .collect();
    LoadCompletion { state, callbacks }
  }

  /// Wraps `load` with every observer's instrumentation. The first observer
  /// wraps the real fetch function; each later one wraps the result so far.
  pub(crate) fn instrument_batch_load(
    &self,
    load: SharedBatchFn<K, V, E>,
    state: &BatchState,
  ) -> SharedBatchFn<K, V, E> {
    self.observers.iter().enumerate().fold(load, |load, (i, obs)| {
      let fallback = load.clone();
      isolate("instrument_batch_load", i, || {
        obs.instrument_batch_load(load, state.observer(i))
      })
      .unwrap_or(fallback)
    })
  }
}

/// The completion callbacks collected by `begin_load` for one load.
pub(crate) struct LoadCompletion<V, E> {
  state: Arc<BatchState>,
  callbacks: Vec<(usize, OnCompleteLoad<V, E>)>,
}

impl<V, E> LoadCompletion<V, E> {
  pub(crate) fn complete(self, result: &LoadResult<V, E>) {
    for (i, callback) in self.callbacks {
      let state = self.state.observer(i);
      isolate("on_complete_load", i, move || callback(result, state));
    }
  }
}
