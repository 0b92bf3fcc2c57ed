mod common;

use common::{tracked, Recorder, TestError};
use fibre_dataloader::runtime::SpawnedTask;
use fibre_dataloader::{BatchEnvironment, DataLoader, DispatchMode, LoadError, TaskSpawner};

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_failure_fails_every_key_and_evicts() {
  let fail = Arc::new(AtomicBool::new(true));
  let loader = DataLoader::builder({
    let fail = fail.clone();
    move |keys: Vec<&'static str>, _env: BatchEnvironment| {
      let fail = fail.swap(false, Ordering::SeqCst);
      async move {
        if fail {
          return Err(io::Error::new(io::ErrorKind::ConnectionReset, "backend went away"));
        }
        let values: Vec<Result<usize, io::Error>> = keys.into_iter().map(|k| Ok(k.len())).collect();
        Ok(values)
      }
    }
  })
  .build()
  .unwrap();

  // 1. Both keys of the failing batch see the batch error.
  let results = tracked(&loader, {
    let loader = loader.clone();
    async move { loader.load_many(["a", "bb"]).await }
  })
  .await;
  for result in &results {
    let err = result.as_ref().unwrap_err();
    assert!(matches!(err, LoadError::Dispatch(_)));
    assert!(err.is_batch_failure());
    assert_eq!(err.fetch_error().unwrap().kind(), io::ErrorKind::ConnectionReset);
  }

  // 2. The failed keys were evicted.
  assert_eq!(loader.cached_entries(), 0);
  let metrics = loader.metrics();
  assert_eq!(metrics.failed_dispatches, 1);
  assert_eq!(metrics.failed_keys, 2);
  assert_eq!(metrics.invalidations, 2);

  // 3. A retry triggers a fresh, successful fetch.
  assert_eq!(*loader.load("a").await.unwrap(), 1);
  assert_eq!(loader.metrics().batches_dispatched, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_fetch_fails_the_batch() {
  let calls = Arc::new(AtomicUsize::new(0));
  let loader = DataLoader::builder({
    let calls = calls.clone();
    move |keys: Vec<u32>, _env: BatchEnvironment| {
      let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
      async move {
        if first {
          panic!("fetch exploded");
        }
        let values = keys.into_iter().map(|k| Ok::<_, TestError>(k * 2)).collect::<Vec<_>>();
        Ok::<_, TestError>(values)
      }
    }
  })
  .build()
  .unwrap();

  match loader.load(4).await {
    Err(LoadError::Panicked(message)) => assert_eq!(&*message, "fetch exploded"),
    other => panic!("unexpected result: {other:?}"),
  }
  assert_eq!(*loader.load(4).await.unwrap(), 8);
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_result_list_reports_missing_values() {
  let loader = DataLoader::builder(|keys: Vec<u32>, _env: BatchEnvironment| async move {
    let values = keys.into_iter().take(1).map(Ok::<u32, TestError>).collect::<Vec<_>>();
    Ok::<_, TestError>(values)
  })
  .build()
  .unwrap();

  let results = tracked(&loader, {
    let loader = loader.clone();
    async move { loader.load_many([1, 2, 3]).await }
  })
  .await;

  assert_eq!(*results[0].clone().unwrap(), 1);
  for result in &results[1..] {
    assert!(matches!(result, Err(LoadError::MissingValue)));
  }
  // Per-key failures stay cached.
  assert_eq!(loader.cached_entries(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_waiter_does_not_cancel_the_fetch() {
  let release = Arc::new(tokio::sync::Notify::new());
  let recorder = Recorder::new();
  let loader = DataLoader::builder({
    let release = release.clone();
    let recorder = recorder.clone();
    move |keys: Vec<u32>, env: BatchEnvironment| {
      let release = release.clone();
      let recorder = recorder.clone();
      async move {
        release.notified().await;
        recorder.fetch(keys, env)
      }
    }
  })
  .build()
  .unwrap();

  // 1. Two callers wait on the same key; one of them gives up.
  let impatient = tokio::spawn({
    let loader = loader.clone();
    async move { loader.load(3).await }
  });
  let patient = tokio::spawn({
    let loader = loader.clone();
    async move { loader.load(3).await }
  });
  while loader.metrics().hits + loader.metrics().misses < 2 {
    tokio::task::yield_now().await;
  }
  impatient.abort();
  assert!(impatient.await.unwrap_err().is_cancelled());

  // 2. The shared fetch still completes for the remaining caller.
  release.notify_one();
  assert_eq!(*patient.await.unwrap().unwrap(), "v3");
  assert_eq!(recorder.batches(), vec![vec![3]]);
}

/// A spawner whose executor discards every task it is given.
struct DiscardingSpawner {
  dropped: AtomicUsize,
}

impl TaskSpawner for DiscardingSpawner {
  fn spawn(&self, future: SpawnedTask) {
    self.dropped.fetch_add(1, Ordering::SeqCst);
    drop(future);
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discarded_dispatch_abandons_and_evicts() {
  for mode in [DispatchMode::Batched, DispatchMode::Immediate] {
    let recorder = Recorder::new();
    let spawner = Arc::new(DiscardingSpawner {
      dropped: AtomicUsize::new(0),
    });
    let loader = recorder
      .builder()
      .dispatch_mode(mode)
      .spawner(spawner.clone())
      .build()
      .unwrap();

    // 1. The fetch task is dropped unpolled, so the load fails instead of hanging.
    let result = tokio::time::timeout(Duration::from_secs(5), loader.load(1))
      .await
      .expect("load hung after its dispatch was discarded");
    assert!(matches!(result, Err(LoadError::Abandoned)));
    assert!(spawner.dropped.load(Ordering::SeqCst) >= 1);

    // 2. The abandoned key was evicted and the fetch never ran.
    assert_eq!(loader.cached_entries(), 0);
    assert_eq!(recorder.calls(), 0);
    assert_eq!(loader.metrics().failed_keys, 1);

    // 3. A later load of the same key is not stuck behind the abandoned cell.
    let again = tokio::time::timeout(Duration::from_secs(5), loader.load(1))
      .await
      .expect("second load hung");
    assert!(matches!(again, Err(LoadError::Abandoned)));
  }
}
