mod common;

use common::Recorder;
use fibre_dataloader::{
  BuildError, DispatchMode, LoaderOptions, TaskSpawner, TickScheduler, TokioSpawner,
};

use std::sync::Arc;

#[test]
fn test_zero_sizes_are_rejected() {
  let recorder = Recorder::new();
  let err = recorder.builder().max_batch_size(0).build().unwrap_err();
  assert_eq!(err, BuildError::ZeroBatchSize);

  let err = recorder.builder().fuzzy_match_sample(0).build().unwrap_err();
  assert_eq!(err, BuildError::ZeroFuzzySample);
}

#[test]
fn test_build_outside_a_runtime_needs_a_spawner() {
  let recorder = Recorder::new();
  let err = recorder.builder().build().unwrap_err();
  assert_eq!(err, BuildError::SpawnerRequired);

  // An explicit spawner works anywhere.
  let runtime = tokio::runtime::Runtime::new().unwrap();
  let spawner: Arc<dyn TaskSpawner> =
    Arc::new(TokioSpawner::with_handle(runtime.handle().clone()));
  let loader = recorder.builder().spawner(spawner).build().unwrap();
  assert_eq!(loader.scheduler().name(), "dataloader-scheduler");

  let value = runtime.block_on(loader.load(1)).unwrap();
  assert_eq!(*value, "v1");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_options_are_applied() {
  let recorder = Recorder::new();
  let options = LoaderOptions {
    name: "users".to_string(),
    max_batch_size: 2,
    dispatch_mode: DispatchMode::Batched,
    ..LoaderOptions::default()
  };
  let loader = recorder.builder().options(options).build().unwrap();

  assert_eq!(loader.name(), "users");
  assert_eq!(loader.scheduler().name(), "users-scheduler");
  assert_eq!(loader.dispatch_mode(), DispatchMode::Batched);

  let metrics = loader.metrics();
  assert_eq!(metrics.hits, 0);
  assert_eq!(metrics.batches_dispatched, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loaders_can_share_a_scheduler() {
  let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::new());
  let scheduler = TickScheduler::named("shared", spawner);

  let first = Recorder::new().builder().scheduler(scheduler.clone()).build().unwrap();
  let second = Recorder::new()
    .builder()
    .name("second")
    .scheduler(scheduler.clone())
    .build()
    .unwrap();

  assert_eq!(first.scheduler().name(), "shared");
  assert_eq!(second.scheduler().name(), "shared");
  first.load(1).await.unwrap();
  second.load(1).await.unwrap();
  assert_eq!(scheduler.current_tick(), 2);
}
