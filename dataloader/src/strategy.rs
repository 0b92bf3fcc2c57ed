use crate::batch::{Batch, BatchEntry, DispatchShared};
use crate::batch_fn::DispatchContext;
use crate::options::DispatchMode;
use crate::scheduler::TickScheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// How entries become batches and when those batches are fetched.
pub(crate) enum DispatchStrategy<K, V, E> {
  /// Coalesce entries into the current batch; fetch it on the next tick.
  Batched {
    max_batch_size: usize,
    current: Mutex<Option<Arc<Batch<K, V, E>>>>,
  },
  /// Fetch every entry on its own, right away.
  Immediate,
}

/// Places pending loads into batches according to a `DispatchStrategy`.
pub(crate) struct Dispatcher<K, V, E> {
  shared: Arc<DispatchShared<K, V, E>>,
  scheduler: TickScheduler,
  next_batch_id: AtomicU64,
  strategy: DispatchStrategy<K, V, E>,
}

fn same_batch<K, V, E>(a: &Option<Arc<Batch<K, V, E>>>, b: &Option<Arc<Batch<K, V, E>>>) -> bool {
  match (a, b) {
    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
    (None, None) => true,
    _ => false,
  }
}

impl<K, V, E> Dispatcher<K, V, E>
where
  K: Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  pub(crate) fn new(
    mode: DispatchMode,
    max_batch_size: usize,
    shared: Arc<DispatchShared<K, V, E>>,
    scheduler: TickScheduler,
  ) -> Self {
    let strategy = match mode {
      DispatchMode::Batched => DispatchStrategy::Batched {
        max_batch_size,
        current: Mutex::new(None),
      },
      DispatchMode::Immediate => DispatchStrategy::Immediate,
    };
    Self {
      shared,
      scheduler,
      next_batch_id: AtomicU64::new(1),
      strategy,
    }
  }

  pub(crate) fn mode(&self) -> DispatchMode {
    match self.strategy {
      DispatchStrategy::Batched { .. } => DispatchMode::Batched,
      DispatchStrategy::Immediate => DispatchMode::Immediate,
    }
  }

  fn new_batch(&self, max_size: usize) -> Arc<Batch<K, V, E>> {
    let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
    Arc::new(Batch::new(id, max_size, self.shared.clone()))
  }

  /// Hands `entry` to a batch. Never drops it: a rejected add is retried
  /// against a freshly created batch until one accepts it.
  pub(crate) fn schedule_result(&self, entry: BatchEntry<K, V, E>) {
    match &self.strategy {
      DispatchStrategy::Batched {
        max_batch_size,
        current,
      } => self.schedule_batched(entry, *max_batch_size, current),
      DispatchStrategy::Immediate => self.schedule_immediate(entry),
    }
  }

  fn schedule_batched(
    &self,
    mut entry: BatchEntry<K, V, E>,
    max_batch_size: usize,
    current: &Mutex<Option<Arc<Batch<K, V, E>>>>,
  ) {
    loop {
      let snapshot = current.lock().clone();
      if let Some(batch) = &snapshot {
        match batch.add(entry) {
          Ok(()) => return,
          Err(rejected) => entry = rejected,
        }
      }

      // Install a fresh batch only if nobody replaced the one we just saw.
      let fresh = {
        let mut slot = current.lock();
        if !same_batch(&slot, &snapshot) {
          continue;
        }
        let fresh = self.new_batch(max_batch_size);
        *slot = Some(fresh.clone());
        fresh
      };
      tracing::trace!(
        loader = %self.shared.name,
        batch = fresh.id(),
        "Opened batch."
      );

      let added = fresh.add(entry);
      let pending = fresh.clone();
      self
        .scheduler
        .next_tick(move |tick| pending.dispatch(DispatchContext::Tick(tick)));

      match added {
        Ok(()) => return,
        Err(rejected) => entry = rejected,
      }
    }
  }

  fn schedule_immediate(&self, entry: BatchEntry<K, V, E>) {
    let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
    let batch = Arc::new(Batch::single(id, self.shared.clone(), entry));
    self
      .scheduler
      .spawn_detached(batch.dispatch(DispatchContext::Immediate));
  }
}
