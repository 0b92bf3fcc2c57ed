use crate::scheduler::TickShared;

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use fibre::mpsc;

/// A message sent to the flusher each time its scheduler goes quiescent.
pub(crate) struct FlushRequest {
  pub(crate) requested_at: Instant,
}

/// The background thread that turns quiescence signals into ticks.
pub(crate) struct Flusher {
  _handle: JoinHandle<()>,
}

impl Flusher {
  /// Spawns a new flusher thread.
  ///
  /// The thread holds only a weak reference to its scheduler. It exits once
  /// the scheduler is dropped, because that drops the only sender.
  pub(crate) fn spawn(
    shared: Weak<TickShared>,
    rx: mpsc::BoundedReceiver<FlushRequest>,
  ) -> Self {
    let handle = thread::spawn(move || {
      while let Ok(request) = rx.recv() {
        let Some(shared) = shared.upgrade() else {
          break;
        };
        shared.flush(request);
      }
      tracing::trace!("Flusher thread exiting.");
    });

    Self { _handle: handle }
  }
}
