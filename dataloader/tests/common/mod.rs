#![allow(dead_code)]

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fibre_dataloader::{BatchEnvironment, DataLoader, DataLoaderBuilder, FetchResult};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl fmt::Display for TestError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "test error: {}", self.0)
  }
}

impl std::error::Error for TestError {}

/// A fetch function that records every batch it is called with.
///
/// Each key `k` loads as `"v{k}"`. Keys listed in `key_errors` fail
/// individually; while `fail_batches` is set, whole batches fail.
#[derive(Clone, Default)]
pub struct Recorder {
  batches: Arc<Mutex<Vec<Vec<u32>>>>,
  envs: Arc<Mutex<Vec<BatchEnvironment>>>,
  calls: Arc<AtomicUsize>,
  pub fail_batches: Arc<AtomicBool>,
  pub key_errors: Arc<Mutex<Vec<u32>>>,
}

impl Recorder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn batches(&self) -> Vec<Vec<u32>> {
    self.batches.lock().clone()
  }

  pub fn envs(&self) -> Vec<BatchEnvironment> {
    self.envs.lock().clone()
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn fetch(&self, keys: Vec<u32>, env: BatchEnvironment) -> FetchResult<String, TestError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.batches.lock().push(keys.clone());
    self.envs.lock().push(env);
    if self.fail_batches.load(Ordering::SeqCst) {
      return Err(TestError("batch".to_string()));
    }
    let key_errors = self.key_errors.lock().clone();
    Ok(
      keys
        .into_iter()
        .map(|k| {
          if key_errors.contains(&k) {
            Err(TestError(format!("key {k}")))
          } else {
            Ok(format!("v{k}"))
          }
        })
        .collect(),
    )
  }

  pub fn builder(&self) -> DataLoaderBuilder<u32, String, TestError> {
    let recorder = self.clone();
    DataLoader::builder(move |keys: Vec<u32>, env: BatchEnvironment| {
      let result = recorder.fetch(keys, env);
      async move { result }
    })
  }

  pub fn loader(&self, max_batch_size: usize) -> DataLoader<u32, String, TestError> {
    self
      .builder()
      .max_batch_size(max_batch_size)
      .build()
      .unwrap()
  }
}

/// Runs `future` as a task tracked by `loader`'s scheduler, so the loads it
/// makes are coalesced, and waits for its output.
pub async fn tracked<K, V, E, C, F>(loader: &DataLoader<K, V, E, C>, future: F) -> F::Output
where
  F: Future + Send + 'static,
  F::Output: Send + 'static,
{
  loader.scheduler().spawn(future).await
}

/// Sorts each batch and the list of batches, for order-insensitive checks.
pub fn normalized(mut batches: Vec<Vec<u32>>) -> Vec<Vec<u32>> {
  for batch in &mut batches {
    batch.sort_unstable();
  }
  batches.sort();
  batches
}
