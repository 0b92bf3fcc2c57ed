use super::TickShared;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures_util::task::{waker, ArcWake};

/// Per-task bookkeeping shared between a `Tracked` future and its wakers.
///
/// A task holds exactly one in-flight unit from the moment it is spawned or
/// woken until the end of the poll that follows. `scheduled` records whether
/// that unit has been taken for the next poll.
struct TaskState {
  shared: Arc<TickShared>,
  scheduled: AtomicBool,
  done: AtomicBool,
}

impl TaskState {
  fn on_wake(&self) {
    if self.done.load(Ordering::SeqCst) {
      return;
    }
    if !self.scheduled.swap(true, Ordering::SeqCst) {
      self.shared.enter();
      // The task may have completed between the check above and the swap.
      if self.done.load(Ordering::SeqCst) && self.scheduled.swap(false, Ordering::SeqCst) {
        self.shared.leave();
      }
    }
  }

  fn finish(&self) {
    self.done.store(true, Ordering::SeqCst);
    if self.scheduled.swap(false, Ordering::SeqCst) {
      self.shared.leave();
    }
  }
}

/// The waker handed to a tracked future: records the wake-up, then forwards
/// it to the executor's waker.
struct TrackWaker {
  state: Arc<TaskState>,
  inner: Waker,
}

impl ArcWake for TrackWaker {
  fn wake_by_ref(arc_self: &Arc<Self>) {
    arc_self.state.on_wake();
    arc_self.inner.wake_by_ref();
  }
}

/// Releases the unit held for one poll, even if the poll panics.
struct PollGuard<'a> {
  state: &'a TaskState,
  ready: bool,
}

impl Drop for PollGuard<'_> {
  fn drop(&mut self) {
    if self.ready || std::thread::panicking() {
      self.state.finish();
    }
    self.state.shared.leave();
  }
}

/// A future whose scheduled and running time counts towards its scheduler's
/// in-flight total.
pub(crate) struct Tracked<F> {
  future: Pin<Box<F>>,
  state: Arc<TaskState>,
  // The wrapping waker is rebuilt only when the executor's waker changes.
  cached: Option<(Waker, Waker)>,
}

impl<F> Tracked<F> {
  /// Wraps `future`, taking its first in-flight unit immediately.
  pub(crate) fn new(shared: Arc<TickShared>, future: F) -> Self {
    shared.enter();
    Self {
      future: Box::pin(future),
      state: Arc::new(TaskState {
        shared,
        scheduled: AtomicBool::new(true),
        done: AtomicBool::new(false),
      }),
      cached: None,
    }
  }

  fn waker_for(&mut self, outer: &Waker) -> Waker {
    match &self.cached {
      Some((seen, ours)) if seen.will_wake(outer) => ours.clone(),
      _ => {
        let ours = waker(Arc::new(TrackWaker {
          state: self.state.clone(),
          inner: outer.clone(),
        }));
        self.cached = Some((outer.clone(), ours.clone()));
        ours
      }
    }
  }
}

impl<F: Future> Future for Tracked<F> {
  type Output = F::Output;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    // `Tracked` is `Unpin`: the inner future is boxed.
    let this = self.get_mut();
    let state = this.state.clone();
    if state.done.load(Ordering::SeqCst) {
      return Poll::Pending;
    }

    // Claim this poll's unit: either the one taken at spawn/wake time, or a
    // fresh one if the executor polled us without a wake.
    if !state.scheduled.swap(false, Ordering::SeqCst) {
      state.shared.enter();
    }
    state.shared.record_poll();
    let mut guard = PollGuard {
      state: &state,
      ready: false,
    };

    let waker = this.waker_for(cx.waker());
    let mut inner_cx = Context::from_waker(&waker);
    let poll = this.future.as_mut().poll(&mut inner_cx);
    guard.ready = poll.is_ready();
    drop(guard);
    poll
  }
}

impl<F> Drop for Tracked<F> {
  fn drop(&mut self) {
    // A task dropped while scheduled (e.g. its executor shut down) must give
    // back the unit it would have spent on its next poll.
    if !self.state.done.load(Ordering::SeqCst) {
      self.state.finish();
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::scheduler::TickScheduler;
  use crate::runtime::TokioSpawner;

  use std::sync::Arc;
  use std::time::Duration;

  use tokio::sync::oneshot;

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn unit_is_held_only_while_scheduled() {
    let scheduler = TickScheduler::new(Arc::new(TokioSpawner::new()));
    let (tx, rx) = oneshot::channel::<()>();
    let task = scheduler.spawn(async move {
      let _ = rx.await;
      7
    });

    // Once parked on the channel, the task no longer counts as in flight.
    let mut idle = false;
    for _ in 0..200 {
      if scheduler.in_flight() == 0 {
        idle = true;
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(idle, "parked task should not be in flight");

    tx.send(()).unwrap();
    assert_eq!(task.await, 7);
    for _ in 0..200 {
      if scheduler.in_flight() == 0 {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("completed task still in flight");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn panicking_task_releases_its_unit() {
    let scheduler = TickScheduler::new(Arc::new(TokioSpawner::new()));
    let handle = scheduler.spawn(async {
      panic!("boom");
    });
    drop(handle);
    for _ in 0..200 {
      if scheduler.in_flight() == 0 {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("panicked task still in flight");
  }
}
