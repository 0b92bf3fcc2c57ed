use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur when building a loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// The loader was configured with a maximum batch size of zero.
  #[error("max batch size must be a positive integer")]
  ZeroBatchSize,
  /// Fuzzy cache-key matching was configured with a sample size of zero.
  #[error("fuzzy match sample size must be a positive integer")]
  ZeroFuzzySample,
  /// No `TaskSpawner` or `TickScheduler` was configured and the default
  /// `tokio` feature is not enabled.
  #[error("a loader requires a task spawner, a tick scheduler or the 'tokio' feature")]
  SpawnerRequired,
}

/// The reason a single `load` did not produce a value.
///
/// Errors produced by the fetch function are shared between every waiter of
/// the same key, so they are held behind an `Arc` rather than requiring
/// `E: Clone`.
#[derive(Debug, Error)]
pub enum LoadError<E> {
  /// The fetch function returned an error for this key only.
  #[error("{0}")]
  Fetch(Arc<E>),
  /// The fetch function failed for the whole batch this key was part of.
  #[error("batch dispatch failed: {0}")]
  Dispatch(Arc<E>),
  /// The fetch function panicked while loading the batch.
  #[error("batch fetch panicked: {0}")]
  Panicked(Arc<str>),
  /// The fetch function returned fewer results than it was given keys.
  #[error("fetch function returned no value for this key")]
  MissingValue,
  /// The batch holding this key was dropped before it could be dispatched.
  #[error("batch was abandoned before dispatch")]
  Abandoned,
}

impl<E> LoadError<E> {
  /// Returns the fetch error behind this failure, if there is one.
  pub fn fetch_error(&self) -> Option<&E> {
    match self {
      LoadError::Fetch(e) | LoadError::Dispatch(e) => Some(e),
      _ => None,
    }
  }

  /// Returns `true` if the whole batch failed, as opposed to a single key.
  pub fn is_batch_failure(&self) -> bool {
    matches!(
      self,
      LoadError::Dispatch(_) | LoadError::Panicked(_) | LoadError::Abandoned
    )
  }
}

impl<E> Clone for LoadError<E> {
  fn clone(&self) -> Self {
    match self {
      LoadError::Fetch(e) => LoadError::Fetch(e.clone()),
      LoadError::Dispatch(e) => LoadError::Dispatch(e.clone()),
      LoadError::Panicked(msg) => LoadError::Panicked(msg.clone()),
      LoadError::MissingValue => LoadError::MissingValue,
      LoadError::Abandoned => LoadError::Abandoned,
    }
  }
}

/// Renders a caught panic payload for logging and `LoadError::Panicked`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> Arc<str> {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    Arc::from(*s)
  } else if let Some(s) = payload.downcast_ref::<String>() {
    Arc::from(s.as_str())
  } else {
    Arc::from("non-string panic payload")
  }
}
