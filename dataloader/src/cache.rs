use crate::cell::ResultCell;

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

/// A caller-supplied equivalence predicate over cache keys: `(new, existing)`.
pub type CacheKeyMatchFn<C> = Arc<dyn Fn(&C, &C) -> bool + Send + Sync>;

type Shard<C, V, E> = Mutex<HashMap<C, Arc<ResultCell<V, E>>, ahash::RandomState>>;

fn hash_key<C: Hash, H: BuildHasher>(hasher: &H, key: &C) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

/// The outcome of `KeyedCache::get_or_create`.
pub(crate) enum Lookup<V, E> {
  /// An existing cell was found, by exact key or through the match function.
  Hit {
    cell: Arc<ResultCell<V, E>>,
    fuzzy: bool,
  },
  /// No cell existed; the caller installed this one and owns its scheduling.
  Created(Arc<ResultCell<V, E>>),
}

/// Maps cache keys to result cells, de-duplicating concurrent lookups.
///
/// The map is partitioned into independently locked shards. Get-or-create is
/// atomic within a shard, so exactly one caller ever installs the cell for a
/// given key.
pub(crate) struct KeyedCache<C, V, E> {
  shards: Box<[Shard<C, V, E>]>,
  hasher: ahash::RandomState,
  match_fn: Option<CacheKeyMatchFn<C>>,
  fuzzy_sample: usize,
}

impl<C, V, E> KeyedCache<C, V, E>
where
  C: Eq + Hash,
{
  /// `shards` must be a power of two.
  pub(crate) fn new(
    shards: usize,
    match_fn: Option<CacheKeyMatchFn<C>>,
    fuzzy_sample: usize,
  ) -> Self {
    let hasher = ahash::RandomState::new();
    let shards = (0..shards)
      .map(|_| Mutex::new(HashMap::with_hasher(hasher.clone())))
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Self {
      shards,
      hasher,
      match_fn,
      fuzzy_sample,
    }
  }

  fn shard_index(&self, key: &C) -> usize {
    hash_key(&self.hasher, key) as usize & (self.shards.len() - 1)
  }

  /// Returns the cell for `key`, installing a fresh one if none exists.
  ///
  /// With a match function configured, a miss on the exact key offers up to
  /// `fuzzy_sample` existing entries to it, starting at the key's own shard.
  /// That scan is not atomic with the install: two similar keys requested at
  /// the same time may both create cells.
  pub(crate) fn get_or_create(&self, key: C) -> Lookup<V, E> {
    let index = self.shard_index(&key);

    if let Some(matches) = &self.match_fn {
      let exact = self.shards[index].lock().get(&key).cloned();
      if let Some(cell) = exact {
        return Lookup::Hit { cell, fuzzy: false };
      }
      if let Some(cell) = self.scan(&key, index, matches.as_ref()) {
        return Lookup::Hit { cell, fuzzy: true };
      }
    }

    let mut shard = self.shards[index].lock();
    if let Some(cell) = shard.get(&key) {
      return Lookup::Hit {
        cell: cell.clone(),
        fuzzy: false,
      };
    }
    let cell = Arc::new(ResultCell::new());
    shard.insert(key, cell.clone());
    Lookup::Created(cell)
  }

  fn scan(
    &self,
    key: &C,
    start: usize,
    matches: &(dyn Fn(&C, &C) -> bool + Send + Sync),
  ) -> Option<Arc<ResultCell<V, E>>> {
    let mut budget = self.fuzzy_sample;
    for offset in 0..self.shards.len() {
      if budget == 0 {
        break;
      }
      let shard = self.shards[(start + offset) & (self.shards.len() - 1)].lock();
      for (existing, cell) in shard.iter().take(budget) {
        if matches(key, existing) {
          return Some(cell.clone());
        }
      }
      budget = budget.saturating_sub(shard.len());
    }
    None
  }

  /// Removes the entry for `key`. Returns `true` if one was present.
  pub(crate) fn remove(&self, key: &C) -> bool {
    self.shards[self.shard_index(key)].lock().remove(key).is_some()
  }

  /// Removes the entry for `key` only if it still holds `cell` and `cell` has
  /// not produced a value. A newer cell for the same key is left alone.
  pub(crate) fn evict_cell(&self, key: &C, cell: &Arc<ResultCell<V, E>>) -> bool {
    let mut shard = self.shards[self.shard_index(key)].lock();
    let evict = shard
      .get(key)
      .is_some_and(|cached| Arc::ptr_eq(cached, cell) && !matches!(cell.peek(), Some(Ok(_))));
    if evict {
      shard.remove(key);
    }
    evict
  }

  /// Empties every shard, returning the number of entries removed.
  pub(crate) fn clear(&self) -> usize {
    self
      .shards
      .iter()
      .map(|shard| {
        let mut shard = shard.lock();
        let len = shard.len();
        shard.clear();
        len
      })
      .sum()
  }

  pub(crate) fn len(&self) -> usize {
    self.shards.iter().map(|shard| shard.lock().len()).sum()
  }
}
