//! Quiescence-driven tick scheduling.
//!
//! A [`TickScheduler`] tracks every task spawned through it. When no tracked
//! task is scheduled or running, the system is *quiescent*: the scheduler
//! then runs every callback registered through [`TickScheduler::next_tick`]
//! as one numbered tick. Batched loaders use this to dispatch a batch only
//! after all work that could still add keys to it has parked.

mod tracked;

use crate::error::panic_message;
use crate::runtime::TaskSpawner;
use crate::task::flusher::{FlushRequest, Flusher};

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use fibre::mpsc;
use futures_util::future::{BoxFuture, FutureExt, RemoteHandle};
use parking_lot::Mutex;

pub(crate) use tracked::Tracked;

/// Requests beyond this many are dropped; any queued request already covers them.
const FLUSH_CHANNEL_CAPACITY: usize = 1024;

/// A callback waiting for the next tick.
type TickCallback = Box<dyn FnOnce(TickContext) -> BoxFuture<'static, ()> + Send>;

/// Identifies one tick of a scheduler.
#[derive(Debug, Clone)]
pub struct TickContext {
  /// 1 for the first tick that ran any callbacks, then 2, 3, ... with no gaps.
  pub index: u64,
  pub metadata: TickMetadata,
}

/// Diagnostic details about the flush that produced a tick.
#[derive(Debug, Clone)]
pub struct TickMetadata {
  pub scheduler_name: Arc<str>,
  /// Polls of tracked tasks since the previous tick.
  pub polls_since_last_tick: u64,
  /// Callbacks run by this tick.
  pub callback_count: usize,
  /// Time between the quiescence signal and the start of the flush.
  pub delay: Duration,
}

/// State shared by a scheduler, its tracked tasks and its flusher thread.
pub(crate) struct TickShared {
  name: Arc<str>,
  spawner: Arc<dyn TaskSpawner>,
  in_flight: CachePadded<AtomicUsize>,
  polls: CachePadded<AtomicU64>,
  tick: AtomicU64,
  callbacks: Mutex<Vec<TickCallback>>,
  flush_tx: mpsc::BoundedSender<FlushRequest>,
  _flusher: Flusher,
}

impl TickShared {
  pub(crate) fn enter(&self) {
    self.in_flight.fetch_add(1, Ordering::SeqCst);
  }

  pub(crate) fn leave(&self) {
    if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && !self.callbacks.lock().is_empty() {
      self.request_flush();
    }
  }

  pub(crate) fn record_poll(&self) {
    self.polls.fetch_add(1, Ordering::Relaxed);
  }

  fn request_flush(&self) {
    let _ = self.flush_tx.try_send(FlushRequest {
      requested_at: Instant::now(),
    });
  }

  fn spawn_tracked<F>(self: &Arc<Self>, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self
      .spawner
      .spawn(Box::pin(Tracked::new(self.clone(), future)));
  }

  /// Runs every pending callback as one tick, if the system is still quiescent.
  ///
  /// Called only from the flusher thread.
  pub(crate) fn flush(self: &Arc<Self>, request: FlushRequest) {
    // Hold a unit for the whole flush so quiescence can't be observed half way.
    self.enter();
    if self.in_flight.load(Ordering::SeqCst) == 1 {
      self.run_callbacks(request);
    }
    self.leave();
  }

  fn run_callbacks(self: &Arc<Self>, request: FlushRequest) {
    let callbacks = std::mem::take(&mut *self.callbacks.lock());
    if callbacks.is_empty() {
      return;
    }

    let context = TickContext {
      index: self.tick.fetch_add(1, Ordering::SeqCst) + 1,
      metadata: TickMetadata {
        scheduler_name: self.name.clone(),
        polls_since_last_tick: self.polls.swap(0, Ordering::Relaxed),
        callback_count: callbacks.len(),
        delay: request.requested_at.elapsed(),
      },
    };
    tracing::debug!(
      scheduler = %self.name,
      tick = context.index,
      callbacks = context.metadata.callback_count,
      delay_us = context.metadata.delay.as_micros() as u64,
      "Flushing tick."
    );

    for callback in callbacks {
      let ctx = context.clone();
      match panic::catch_unwind(AssertUnwindSafe(move || callback(ctx))) {
        Ok(future) => {
          let name = self.name.clone();
          let tick = context.index;
          self.spawn_tracked(AssertUnwindSafe(future).catch_unwind().map(move |res| {
            if let Err(payload) = res {
              tracing::warn!(
                scheduler = %name,
                tick,
                panic = %panic_message(payload.as_ref()),
                "Tick callback future panicked."
              );
            }
          }));
        }
        Err(payload) => {
          tracing::warn!(
            scheduler = %self.name,
            tick = context.index,
            panic = %panic_message(payload.as_ref()),
            "Tick callback panicked."
          );
        }
      }
    }
  }
}

/// A handle to a task spawned with [`TickScheduler::spawn`].
///
/// Awaiting the handle yields the task's output, resuming its panic if it
/// panicked. Dropping the handle detaches the task; it keeps running.
#[must_use = "dropping a TaskHandle detaches the task"]
pub struct TaskHandle<T> {
  inner: Option<RemoteHandle<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
  /// Stops the task at its next suspension point.
  pub fn cancel(mut self) {
    // Dropping a `RemoteHandle` without `forget` cancels the remote future.
    drop(self.inner.take());
  }
}

impl<T: Send + 'static> Future for TaskHandle<T> {
  type Output = T;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
    match self.get_mut().inner.as_mut() {
      Some(handle) => Pin::new(handle).poll(cx),
      None => Poll::Pending,
    }
  }
}

impl<T> Drop for TaskHandle<T> {
  fn drop(&mut self) {
    if let Some(handle) = self.inner.take() {
      handle.forget();
    }
  }
}

/// Spawns tracked tasks and runs tick callbacks whenever they all go idle.
///
/// Cloning a scheduler is cheap; every clone shares the same tick sequence.
#[derive(Clone)]
pub struct TickScheduler {
  shared: Arc<TickShared>,
}

impl TickScheduler {
  /// Creates a scheduler that spawns its tasks through `spawner`.
  pub fn new(spawner: Arc<dyn TaskSpawner>) -> Self {
    Self::named("tick-scheduler", spawner)
  }

  /// Like `new`, with a name that is reported in tick metadata and logs.
  pub fn named(name: impl Into<Arc<str>>, spawner: Arc<dyn TaskSpawner>) -> Self {
    let (tx, rx): (
      mpsc::BoundedSender<FlushRequest>,
      mpsc::BoundedReceiver<FlushRequest>,
    ) = mpsc::bounded(FLUSH_CHANNEL_CAPACITY);

    let shared = Arc::new_cyclic(|weak| TickShared {
      name: name.into(),
      spawner,
      in_flight: CachePadded::new(AtomicUsize::new(0)),
      polls: CachePadded::new(AtomicU64::new(0)),
      tick: AtomicU64::new(0),
      callbacks: Mutex::new(Vec::new()),
      flush_tx: tx,
      _flusher: Flusher::spawn(weak.clone(), rx),
    });
    Self { shared }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// Spawns `future` as a tracked task.
  pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    let (remote, handle) = future.remote_handle();
    self.shared.spawn_tracked(remote);
    TaskHandle {
      inner: Some(handle),
    }
  }

  /// Spawns a tracked task without a handle.
  pub fn spawn_detached<F>(&self, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.shared.spawn_tracked(future);
  }

  /// Registers `callback` to run on the next tick.
  ///
  /// The synchronous part of the callback runs on the scheduler's flusher
  /// thread, in registration order; the future it returns is spawned as a
  /// tracked task.
  pub fn next_tick<F>(&self, callback: F)
  where
    F: FnOnce(TickContext) -> BoxFuture<'static, ()> + Send + 'static,
  {
    self.shared.callbacks.lock().push(Box::new(callback));
    if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
      self.shared.request_flush();
    }
  }

  /// The index of the most recent tick, or 0 if none has run yet.
  pub fn current_tick(&self) -> u64 {
    self.shared.tick.load(Ordering::SeqCst)
  }

  /// The number of tracked tasks currently scheduled or running.
  pub fn in_flight(&self) -> usize {
    self.shared.in_flight.load(Ordering::SeqCst)
  }

  /// The number of callbacks waiting for the next tick.
  pub fn pending_callbacks(&self) -> usize {
    self.shared.callbacks.lock().len()
  }
}

impl fmt::Debug for TickScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TickScheduler")
      .field("name", &self.shared.name)
      .field("tick", &self.current_tick())
      .field("in_flight", &self.in_flight())
      .finish()
  }
}
