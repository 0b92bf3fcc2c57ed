//! The fetch contract between a loader and the data source behind it.

use crate::scheduler::TickContext;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

/// Opaque per-key data supplied by a caller and handed to the fetch function
/// alongside the key.
pub type KeyContext = Arc<dyn Any + Send + Sync>;

/// What a fetch function yields for a batch: either one result per key, in
/// key order, or an error that fails the whole batch.
pub type FetchResult<V, E> = Result<Vec<Result<V, E>>, E>;

/// A shared, type-erased fetch function.
pub type SharedBatchFn<K, V, E> = Arc<dyn BatchFn<K, V, E>>;

/// Describes how the batch being fetched was dispatched.
#[derive(Debug, Clone)]
pub enum DispatchContext {
  /// The key was dispatched on its own, as soon as it was requested.
  Immediate,
  /// The batch was dispatched by a tick scheduler once the system went idle.
  Tick(TickContext),
}

impl DispatchContext {
  pub fn tick(&self) -> Option<&TickContext> {
    match self {
      DispatchContext::Tick(tick) => Some(tick),
      DispatchContext::Immediate => None,
    }
  }
}

/// Everything a fetch function is told about the batch besides the keys.
#[derive(Debug, Clone)]
pub struct BatchEnvironment {
  /// Per-key contexts, aligned index-for-index with the keys.
  pub key_contexts: Vec<Option<KeyContext>>,
  /// The number of loads this batch satisfies: its own keys plus cache hits
  /// that joined one of its keys while it was still open.
  pub total_key_count: usize,
  pub dispatch_context: DispatchContext,
}

impl BatchEnvironment {
  /// Returns the context supplied for the key at `index`, downcast to `T`.
  pub fn key_context<T: Any + Send + Sync>(&self, index: usize) -> Option<&T> {
    self
      .key_contexts
      .get(index)
      .and_then(|ctx| ctx.as_ref())
      .and_then(|ctx| ctx.downcast_ref::<T>())
  }
}

/// A function that loads many keys at once.
///
/// Implementations must return exactly one result per key, in the order the
/// keys were given. Any closure of the form
/// `Fn(Vec<K>, BatchEnvironment) -> impl Future<Output = FetchResult<V, E>>`
/// implements this trait.
pub trait BatchFn<K, V, E>: Send + Sync + 'static {
  fn load(&self, keys: Vec<K>, env: BatchEnvironment) -> BoxFuture<'static, FetchResult<V, E>>;
}

impl<K, V, E, F, Fut> BatchFn<K, V, E> for F
where
  F: Fn(Vec<K>, BatchEnvironment) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = FetchResult<V, E>> + Send + 'static,
{
  fn load(&self, keys: Vec<K>, env: BatchEnvironment) -> BoxFuture<'static, FetchResult<V, E>> {
    (self)(keys, env).boxed()
  }
}

/// Adapts a fetch function that returns a map into one that returns a result
/// per key. Keys absent from the map load as `None`.
pub fn mapped<F>(f: F) -> MappedBatchFn<F> {
  MappedBatchFn { f }
}

/// Adapts a fetch function that returns plain values, in key order, into one
/// that returns a result per key. A short list fails the trailing keys with
/// `LoadError::MissingValue`.
pub fn values<F>(f: F) -> ValuesBatchFn<F> {
  ValuesBatchFn { f }
}

/// See [`mapped`].
pub struct MappedBatchFn<F> {
  f: F,
}

impl<K, V, E, S, F, Fut> BatchFn<K, Option<V>, E> for MappedBatchFn<F>
where
  K: Clone + Eq + Hash + Send + Sync + 'static,
  V: Send + 'static,
  E: Send + 'static,
  S: BuildHasher + Send + 'static,
  F: Fn(Vec<K>, BatchEnvironment) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<HashMap<K, V, S>, E>> + Send + 'static,
{
  fn load(
    &self,
    keys: Vec<K>,
    env: BatchEnvironment,
  ) -> BoxFuture<'static, FetchResult<Option<V>, E>> {
    let fetch = (self.f)(keys.clone(), env);
    async move {
      let mut found = fetch.await?;
      Ok(keys.iter().map(|key| Ok(found.remove(key))).collect())
    }
    .boxed()
  }
}

/// See [`values`].
pub struct ValuesBatchFn<F> {
  f: F,
}

impl<K, V, E, F, Fut> BatchFn<K, V, E> for ValuesBatchFn<F>
where
  V: Send + 'static,
  E: Send + 'static,
  F: Fn(Vec<K>, BatchEnvironment) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Vec<V>, E>> + Send + 'static,
{
  fn load(&self, keys: Vec<K>, env: BatchEnvironment) -> BoxFuture<'static, FetchResult<V, E>> {
    let fetch = (self.f)(keys, env);
    async move { Ok(fetch.await?.into_iter().map(Ok).collect()) }.boxed()
  }
}
