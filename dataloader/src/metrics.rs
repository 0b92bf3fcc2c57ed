use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for a loader.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Lookups ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,
  pub(crate) fuzzy_hits: CachePadded<AtomicU64>,

  // --- Dispatch ---
  pub(crate) batches_dispatched: CachePadded<AtomicU64>,
  pub(crate) keys_dispatched: CachePadded<AtomicU64>,
  pub(crate) failed_dispatches: CachePadded<AtomicU64>,
  pub(crate) failed_keys: CachePadded<AtomicU64>,

  // --- Cache maintenance ---
  pub(crate) invalidations: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      fuzzy_hits: CachePadded::new(AtomicU64::new(0)),
      batches_dispatched: CachePadded::new(AtomicU64::new(0)),
      keys_dispatched: CachePadded::new(AtomicU64::new(0)),
      failed_dispatches: CachePadded::new(AtomicU64::new(0)),
      failed_keys: CachePadded::new(AtomicU64::new(0)),
      invalidations: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn record_dispatch(&self, keys: usize) {
    self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    self.keys_dispatched.fetch_add(keys as u64, Ordering::Relaxed);
  }

  pub(crate) fn record_failed_dispatch(&self, keys: usize) {
    self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
    self.failed_keys.fetch_add(keys as u64, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;
    let batches_dispatched = self.batches_dispatched.load(Ordering::Relaxed);
    let keys_dispatched = self.keys_dispatched.load(Ordering::Relaxed);

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      fuzzy_hits: self.fuzzy_hits.load(Ordering::Relaxed),
      batches_dispatched,
      keys_dispatched,
      mean_batch_size: if batches_dispatched == 0 {
        0.0
      } else {
        keys_dispatched as f64 / batches_dispatched as f64
      },
      failed_dispatches: self.failed_dispatches.load(Ordering::Relaxed),
      failed_keys: self.failed_keys.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of a loader's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Loads answered by an existing cache entry, pending or resolved.
  pub hits: u64,
  /// Loads that created a new cache entry and scheduled a fetch.
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// Hits that were found through the cache-key match function rather than
  /// an exact key lookup.
  pub fuzzy_hits: u64,
  /// The number of batches handed to the fetch function.
  pub batches_dispatched: u64,
  /// The total number of keys across all dispatched batches.
  pub keys_dispatched: u64,
  /// keys_dispatched / batches_dispatched.
  pub mean_batch_size: f64,
  /// Batches whose fetch returned an error or panicked as a whole.
  pub failed_dispatches: u64,
  /// Keys that were part of a failed batch.
  pub failed_keys: u64,
  /// Cache entries removed through `clear`, `clear_all` or failure eviction.
  pub invalidations: u64,
  /// The number of seconds the loader has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("fuzzy_hits", &self.fuzzy_hits)
      .field("batches_dispatched", &self.batches_dispatched)
      .field("keys_dispatched", &self.keys_dispatched)
      .field("mean_batch_size", &format!("{:.2}", self.mean_batch_size))
      .field("failed_dispatches", &self.failed_dispatches)
      .field("failed_keys", &self.failed_keys)
      .field("invalidations", &self.invalidations)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
