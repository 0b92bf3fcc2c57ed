use crate::error::LoadError;
use crate::instrumentation::BatchState;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// The outcome shared by every waiter of one key.
pub type LoadResult<V, E> = Result<Arc<V>, LoadError<E>>;

/// The internal, mutex-protected core of a `Slot`.
struct SlotInner<T> {
  value: Option<T>,
  waiters: Vec<Waker>,
}

/// A single-assignment value that can be awaited by many tasks at once.
///
/// The first `set` wins; every later attempt is a no-op that returns `false`.
pub(crate) struct Slot<T> {
  inner: Mutex<SlotInner<T>>,
}

impl<T: Clone> Slot<T> {
  pub(crate) fn new() -> Self {
    Self {
      inner: Mutex::new(SlotInner {
        value: None,
        waiters: Vec::new(),
      }),
    }
  }

  /// Stores `value` and wakes all waiters, unless a value is already present.
  pub(crate) fn set(&self, value: T) -> bool {
    self.set_then(value, |_| ())
  }

  /// Like `set`, running `f` on the stored value before any waiter is woken.
  pub(crate) fn set_then(&self, value: T, f: impl FnOnce(&T)) -> bool {
    let waiters = {
      let mut inner = self.inner.lock();
      if inner.value.is_some() {
        return false;
      }
      inner.value = Some(value.clone());
      std::mem::take(&mut inner.waiters)
    };
    f(&value);
    // Wake outside the lock so woken tasks don't immediately contend on it.
    for waker in waiters {
      waker.wake();
    }
    true
  }

  pub(crate) fn get(&self) -> Option<T> {
    self.inner.lock().value.clone()
  }

  pub(crate) fn is_set(&self) -> bool {
    self.inner.lock().value.is_some()
  }

  pub(crate) fn wait(&self) -> SlotFuture<'_, T> {
    SlotFuture { slot: self }
  }
}

/// The future returned by `Slot::wait`.
#[must_use = "futures do nothing unless you .await or poll them"]
pub(crate) struct SlotFuture<'a, T> {
  slot: &'a Slot<T>,
}

impl<'a, T: Clone> Future for SlotFuture<'a, T> {
  type Output = T;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.slot.inner.lock();
    if let Some(value) = &inner.value {
      return Poll::Ready(value.clone());
    }
    if !inner.waiters.iter().any(|w| w.will_wake(cx.waker())) {
      inner.waiters.push(cx.waker().clone());
    }
    Poll::Pending
  }
}

type ResolveListener<V, E> = Box<dyn FnOnce(&LoadResult<V, E>) + Send>;

/// The eventual value (or failure) for one cache key.
///
/// A cell is shared by the cache and by every caller waiting on the key.
/// Exactly one of `complete`/`fail` ever takes effect.
pub struct ResultCell<V, E> {
  result: Slot<LoadResult<V, E>>,
  batch_state: Slot<Arc<BatchState>>,
  listeners: Mutex<Vec<ResolveListener<V, E>>>,
}

impl<V, E> ResultCell<V, E> {
  pub(crate) fn new() -> Self {
    Self {
      result: Slot::new(),
      batch_state: Slot::new(),
      listeners: Mutex::new(Vec::new()),
    }
  }

  /// Resolves the cell with a value. Returns `false` if it was already resolved.
  pub fn complete(&self, value: Arc<V>) -> bool {
    self.resolve(Ok(value))
  }

  /// Resolves the cell with an error. Returns `false` if it was already resolved.
  pub fn fail(&self, error: LoadError<E>) -> bool {
    self.resolve(Err(error))
  }

  fn resolve(&self, result: LoadResult<V, E>) -> bool {
    // Listeners run before waiters wake, so a waiter sees their effects.
    self.result.set_then(result, |result| {
      let listeners = std::mem::take(&mut *self.listeners.lock());
      for listener in listeners {
        listener(result);
      }
    })
  }

  /// Runs `f` once the cell resolves, or right away if it already has.
  pub(crate) fn on_resolve<F>(&self, f: F)
  where
    F: FnOnce(&LoadResult<V, E>) + Send + 'static,
  {
    let mut listeners = self.listeners.lock();
    match self.result.get() {
      Some(result) => {
        drop(listeners);
        f(&result);
      }
      None => listeners.push(Box::new(f)),
    }
  }

  pub fn is_pending(&self) -> bool {
    !self.result.is_set()
  }

  pub fn is_failed(&self) -> bool {
    matches!(self.result.get(), Some(Err(_)))
  }

  /// Returns the outcome if the cell has been resolved.
  pub fn peek(&self) -> Option<LoadResult<V, E>> {
    self.result.get()
  }

  /// Waits for the cell to be resolved.
  pub async fn result(&self) -> LoadResult<V, E> {
    self.result.wait().await
  }

  /// Waits until the cell has been attached to a batch.
  pub(crate) async fn batch_state(&self) -> Arc<BatchState> {
    self.batch_state.wait().await
  }

  pub(crate) fn try_batch_state(&self) -> Option<Arc<BatchState>> {
    self.batch_state.get()
  }

  pub(crate) fn assign_batch_state(&self, state: Arc<BatchState>) -> bool {
    self.batch_state.set(state)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use futures_util::future::FutureExt;

  #[test]
  fn first_completion_wins() {
    let cell: ResultCell<i32, String> = ResultCell::new();
    assert!(cell.is_pending());
    assert!(cell.complete(Arc::new(1)));
    assert!(!cell.complete(Arc::new(2)));
    assert!(!cell.fail(LoadError::MissingValue));
    assert_eq!(*cell.peek().unwrap().unwrap(), 1);
    assert!(!cell.is_failed());
  }

  #[test]
  fn failure_is_observed_by_every_waiter() {
    let cell: Arc<ResultCell<i32, String>> = Arc::new(ResultCell::new());
    let mut first = Box::pin(cell.result());
    let mut second = Box::pin(cell.result());
    assert!(first.as_mut().now_or_never().is_none());

    cell.fail(LoadError::Fetch(Arc::new("boom".to_string())));
    assert!(cell.is_failed());

    let a = first.now_or_never().unwrap().unwrap_err();
    let b = second.as_mut().now_or_never().unwrap().unwrap_err();
    assert_eq!(a.fetch_error().unwrap(), "boom");
    assert_eq!(b.fetch_error().unwrap(), "boom");
  }

  #[test]
  fn listeners_fire_once_whenever_they_attach() {
    let cell: ResultCell<i32, String> = ResultCell::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let early = seen.clone();
    cell.on_resolve(move |r| early.lock().push(("early", *r.clone().unwrap())));
    cell.complete(Arc::new(3));
    let late = seen.clone();
    cell.on_resolve(move |r| late.lock().push(("late", *r.clone().unwrap())));
    cell.fail(LoadError::MissingValue);

    assert_eq!(*seen.lock(), vec![("early", 3), ("late", 3)]);
  }

  #[tokio::test]
  async fn waiters_are_woken_on_set() {
    let slot: Arc<Slot<u8>> = Arc::new(Slot::new());
    let waiter = tokio::spawn({
      let slot = slot.clone();
      async move { slot.wait().await }
    });
    tokio::task::yield_now().await;
    assert!(slot.set(7));
    assert!(!slot.set(8));
    assert_eq!(waiter.await.unwrap(), 7);
  }
}
